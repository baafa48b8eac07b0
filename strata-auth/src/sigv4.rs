//! AWS Signature Version 4 implementation
//!
//! The canonical request is rebuilt from the incoming request and the header
//! names the client advertised in `SignedHeaders`:
//!
//! ```text
//! METHOD\nURI\nCANONICAL_QUERY\nCANONICAL_HEADERS\nSIGNED_HEADERS\nPAYLOAD_HASH
//! ```
//!
//! The payload hash is taken from `x-amz-content-sha256` as sent; the body is
//! never rehashed.

use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use hmac::{Hmac, Mac};
use http::header::{AUTHORIZATION, HOST};
use http::{HeaderMap, Method, Request, Uri};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

use crate::credentials::{Credential, CredentialError, CredentialStore};

type HmacSha256 = Hmac<Sha256>;

pub const ALGORITHM: &str = "AWS4-HMAC-SHA256";
pub const AMZ_DATE_FORMAT: &str = "%Y%m%dT%H%M%SZ";
pub const X_AMZ_DATE: &str = "x-amz-date";
pub const X_AMZ_CONTENT_SHA256: &str = "x-amz-content-sha256";
pub const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";
pub const DEFAULT_REGION: &str = "us-east-1";
pub const DEFAULT_SERVICE: &str = "s3";

/// Everything but the RFC 3986 unreserved characters is escaped
const URI_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Errors during signature verification
#[derive(Debug, Error)]
pub enum SigV4Error {
    #[error("Missing authorization header")]
    MissingAuthHeader,

    #[error("Invalid authorization header format")]
    InvalidAuthFormat,

    #[error("Unsupported signing algorithm: {0}")]
    InvalidAlgorithm(String),

    #[error("Missing credential")]
    MissingCredential,

    #[error("Empty access key")]
    MissingAccessKey,

    #[error("Missing signed headers")]
    MissingSignedHeaders,

    #[error("Missing signature")]
    MissingSignature,

    #[error("Invalid request date: {0:?}")]
    InvalidDate(String),

    #[error("Unknown access key: {0}")]
    UnknownAccessKey(String),

    #[error("Request time too skewed")]
    RequestTimeTooSkewed,

    #[error("Signature mismatch")]
    SignatureMismatch,

    #[error("Credential store error: {0}")]
    Credentials(#[from] CredentialError),
}

/// Parsed SigV4 authorization header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationHeader {
    pub algorithm: String,
    pub access_key: String,
    /// Everything after the access key in `Credential=`, e.g. `20130524/us-east-1/s3/aws4_request`
    pub scope: String,
    /// Normalized: trimmed, lower-cased and sorted
    pub signed_headers: Vec<String>,
    pub signature: String,
}

/// Parse an AWS SigV4 authorization header
///
/// Format: AWS4-HMAC-SHA256 Credential=AKID/DATE/REGION/SERVICE/aws4_request,
///         SignedHeaders=host;x-amz-date, Signature=HEX
pub fn parse_authorization_header(header: &str) -> Result<AuthorizationHeader, SigV4Error> {
    let (algorithm, components) = header
        .trim()
        .split_once(' ')
        .ok_or(SigV4Error::InvalidAuthFormat)?;

    if algorithm != ALGORITHM {
        return Err(SigV4Error::InvalidAlgorithm(algorithm.to_string()));
    }

    let mut credential = None;
    let mut signed_headers = None;
    let mut signature = None;

    for component in components.split(',') {
        let Some((name, value)) = component.trim().split_once('=') else {
            continue;
        };

        match name.trim() {
            "Credential" => credential = Some(value.trim()),
            "SignedHeaders" => signed_headers = Some(value.trim()),
            "Signature" => signature = Some(value.trim()),
            _ => {}
        }
    }

    let credential = credential.ok_or(SigV4Error::MissingCredential)?;
    let (access_key, scope) = credential.split_once('/').unwrap_or((credential, ""));
    if access_key.is_empty() {
        return Err(SigV4Error::MissingAccessKey);
    }

    let signed_headers = signed_headers.ok_or(SigV4Error::MissingSignedHeaders)?;

    let signature = signature.ok_or(SigV4Error::MissingSignature)?;
    if signature.is_empty() {
        return Err(SigV4Error::MissingSignature);
    }

    Ok(AuthorizationHeader {
        algorithm: algorithm.to_string(),
        access_key: access_key.to_string(),
        scope: scope.to_string(),
        signed_headers: normalize_signed_headers(signed_headers),
        signature: signature.to_string(),
    })
}

/// Split a `SignedHeaders` value into trimmed, lower-cased, sorted names
pub fn normalize_signed_headers(raw: &str) -> Vec<String> {
    let mut names: Vec<String> = raw
        .trim()
        .trim_end_matches(',')
        .split(';')
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();
    names.sort();
    names.dedup();
    names
}

/// Parse an `X-Amz-Date` timestamp
pub fn parse_amz_date(value: &str) -> Result<DateTime<Utc>, SigV4Error> {
    NaiveDateTime::parse_from_str(value.trim(), AMZ_DATE_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|_| SigV4Error::InvalidDate(value.to_string()))
}

/// Region and service that signatures are scoped to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningScope {
    pub region: String,
    pub service: String,
}

impl SigningScope {
    pub fn new(region: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            service: service.into(),
        }
    }

    /// `<YYYYMMDD>/<region>/<service>/aws4_request`
    pub fn credential_scope(&self, timestamp: &DateTime<Utc>) -> String {
        format!(
            "{}/{}/{}/aws4_request",
            timestamp.format("%Y%m%d"),
            self.region,
            self.service
        )
    }
}

impl Default for SigningScope {
    fn default() -> Self {
        Self::new(DEFAULT_REGION, DEFAULT_SERVICE)
    }
}

/// Borrowed view of the parts of a request that take part in signing
#[derive(Debug, Clone, Copy)]
pub struct SignableRequest<'a> {
    pub method: &'a Method,
    pub uri: &'a Uri,
    pub headers: &'a HeaderMap,
}

impl<'a> SignableRequest<'a> {
    pub fn new(method: &'a Method, uri: &'a Uri, headers: &'a HeaderMap) -> Self {
        Self {
            method,
            uri,
            headers,
        }
    }

    pub fn from_request<B>(request: &'a Request<B>) -> Self {
        Self::new(request.method(), request.uri(), request.headers())
    }

    /// First value of a header, if it is valid UTF-8
    pub fn header(&self, name: &str) -> Option<&'a str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// All values of a header in arrival order. `host` falls back to the URI authority.
    fn header_values(&self, name: &str) -> Vec<String> {
        let values: Vec<String> = self
            .headers
            .get_all(name)
            .iter()
            .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
            .collect();

        if values.is_empty() && name == HOST.as_str() {
            if let Some(authority) = self.uri.authority() {
                return vec![authority.to_string()];
            }
        }
        values
    }
}

fn uri_encode(value: &str) -> String {
    utf8_percent_encode(value, URI_ENCODE_SET).to_string()
}

/// Request path as sent on the wire, `/` if empty
pub fn canonical_uri(path: &str) -> &str {
    if path.is_empty() {
        "/"
    } else {
        path
    }
}

/// Canonical query string from a raw query
pub fn canonical_query_string(query: Option<&str>) -> String {
    match query {
        Some(query) if !query.is_empty() => canonical_query_from_pairs(
            form_urlencoded::parse(query.as_bytes())
                .map(|(k, v)| (k.into_owned(), v.into_owned())),
        ),
        _ => String::new(),
    }
}

/// Canonical query string from decoded pairs: encoded, sorted by key then value
pub fn canonical_query_from_pairs(pairs: impl IntoIterator<Item = (String, String)>) -> String {
    let mut encoded: Vec<(String, String)> = pairs
        .into_iter()
        .map(|(k, v)| (uri_encode(&k), uri_encode(&v)))
        .collect();
    encoded.sort();

    encoded
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

/// One `name:value\n` line per signed header; repeated headers are comma-joined
pub fn canonical_headers(request: &SignableRequest<'_>, signed_headers: &[String]) -> String {
    let mut block = String::new();
    for name in signed_headers {
        let joined = request.header_values(name).join(",");
        block.push_str(name);
        block.push(':');
        block.push_str(joined.trim());
        block.push('\n');
    }
    block
}

/// Build the canonical request using the request's full query string
pub fn canonical_request(
    request: &SignableRequest<'_>,
    signed_headers: &[String],
    payload_hash: &str,
) -> String {
    let query = canonical_query_string(request.uri.query());
    canonical_request_with_query(request, &query, signed_headers, payload_hash)
}

pub(crate) fn canonical_request_with_query(
    request: &SignableRequest<'_>,
    canonical_query: &str,
    signed_headers: &[String],
    payload_hash: &str,
) -> String {
    format!(
        "{}\n{}\n{}\n{}\n{}\n{}",
        request.method.as_str(),
        canonical_uri(request.uri.path()),
        canonical_query,
        canonical_headers(request, signed_headers),
        signed_headers.join(";"),
        payload_hash
    )
}

/// Create the string to sign
pub fn string_to_sign(
    timestamp: &DateTime<Utc>,
    scope: &SigningScope,
    canonical_request: &str,
) -> String {
    let canonical_hash = hex::encode(Sha256::digest(canonical_request.as_bytes()));
    format!(
        "{}\n{}\n{}\n{}",
        ALGORITHM,
        timestamp.format(AMZ_DATE_FORMAT),
        scope.credential_scope(timestamp),
        canonical_hash
    )
}

/// Sign a string using HMAC-SHA256
fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Derive the date-scoped signing key
pub fn derive_signing_key(
    secret_key: &str,
    timestamp: &DateTime<Utc>,
    scope: &SigningScope,
) -> Vec<u8> {
    let date = timestamp.format("%Y%m%d").to_string();
    let k_date = hmac_sha256(format!("AWS4{secret_key}").as_bytes(), date.as_bytes());
    let k_region = hmac_sha256(&k_date, scope.region.as_bytes());
    let k_service = hmac_sha256(&k_region, scope.service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

/// Hex signature of a string to sign
pub fn compute_signature(signing_key: &[u8], string_to_sign: &str) -> String {
    hex::encode(hmac_sha256(signing_key, string_to_sign.as_bytes()))
}

/// Constant-time comparison of a supplied hex signature
pub(crate) fn check_signature(
    signing_key: &[u8],
    string_to_sign: &str,
    supplied: &str,
) -> Result<(), SigV4Error> {
    let supplied = hex::decode(supplied).map_err(|_| SigV4Error::SignatureMismatch)?;
    let mut mac = HmacSha256::new_from_slice(signing_key).expect("HMAC can take key of any size");
    mac.update(string_to_sign.as_bytes());
    mac.verify_slice(&supplied)
        .map_err(|_| SigV4Error::SignatureMismatch)
}

/// Verify a parsed header against a known secret
///
/// No clock or credential lookups happen here.
pub fn verify_with_secret(
    request: &SignableRequest<'_>,
    auth: &AuthorizationHeader,
    timestamp: &DateTime<Utc>,
    payload_hash: &str,
    secret_key: &str,
    scope: &SigningScope,
) -> Result<(), SigV4Error> {
    let canonical = canonical_request(request, &auth.signed_headers, payload_hash);
    let to_sign = string_to_sign(timestamp, scope, &canonical);
    debug!(canonical_request = %canonical, string_to_sign = %to_sign, "Computed SigV4 inputs");

    let signing_key = derive_signing_key(secret_key, timestamp, scope);
    check_signature(&signing_key, &to_sign, &auth.signature)
}

/// Produce an `Authorization` header value for a request
///
/// The payload hash is read from the request's `x-amz-content-sha256` header,
/// as the verifier does.
pub fn sign_request(
    request: &SignableRequest<'_>,
    access_key: &str,
    secret_key: &str,
    timestamp: &DateTime<Utc>,
    signed_headers: &[&str],
    scope: &SigningScope,
) -> String {
    let names = normalize_signed_headers(&signed_headers.join(";"));
    let payload_hash = request.header(X_AMZ_CONTENT_SHA256).unwrap_or_default();

    let canonical = canonical_request(request, &names, payload_hash);
    let to_sign = string_to_sign(timestamp, scope, &canonical);
    let signature = compute_signature(
        &derive_signing_key(secret_key, timestamp, scope),
        &to_sign,
    );

    format!(
        "{ALGORITHM} Credential={access_key}/{}, SignedHeaders={}, Signature={signature}",
        scope.credential_scope(timestamp),
        names.join(";")
    )
}

/// Verifies header-signed requests against the credential store
#[derive(Debug, Clone)]
pub struct SigV4Verifier {
    credentials: Arc<CredentialStore>,
    scope: SigningScope,
    max_skew: Option<Duration>,
}

impl SigV4Verifier {
    pub fn new(credentials: Arc<CredentialStore>, scope: SigningScope) -> Self {
        Self {
            credentials,
            scope,
            max_skew: None,
        }
    }

    /// Reject requests dated further than `max_skew` from now. `None` disables the check.
    #[must_use]
    pub fn with_max_skew(mut self, max_skew: Option<Duration>) -> Self {
        self.max_skew = max_skew;
        self
    }

    pub fn scope(&self) -> &SigningScope {
        &self.scope
    }

    pub fn credentials(&self) -> &Arc<CredentialStore> {
        &self.credentials
    }

    /// Verify a request using its own `Authorization`, `X-Amz-Date` and
    /// `X-Amz-Content-SHA256` headers
    pub async fn verify(&self, request: &SignableRequest<'_>) -> Result<Credential, SigV4Error> {
        let authorization = request
            .header(AUTHORIZATION.as_str())
            .ok_or(SigV4Error::MissingAuthHeader)?;
        let date = request.header(X_AMZ_DATE).unwrap_or_default();
        let content_hash = request.header(X_AMZ_CONTENT_SHA256).unwrap_or_default();

        self.verify_parts(request, authorization, date, content_hash)
            .await
    }

    /// Verify with explicitly supplied authorization inputs
    pub async fn verify_parts(
        &self,
        request: &SignableRequest<'_>,
        authorization_header: &str,
        date_header: &str,
        content_hash: &str,
    ) -> Result<Credential, SigV4Error> {
        let auth = parse_authorization_header(authorization_header)?;
        let timestamp = parse_amz_date(date_header)?;
        self.check_skew(&timestamp, &Utc::now())?;

        let credential = self
            .credentials
            .find(&auth.access_key)
            .await?
            .ok_or_else(|| SigV4Error::UnknownAccessKey(auth.access_key.clone()))?;

        verify_with_secret(
            request,
            &auth,
            &timestamp,
            content_hash,
            &credential.secret_key,
            &self.scope,
        )?;

        Ok(credential)
    }

    /// Boolean form of [`verify_parts`](Self::verify_parts). Failures are logged, never raised.
    pub async fn is_valid(
        &self,
        request: &SignableRequest<'_>,
        authorization_header: &str,
        date_header: &str,
        content_hash: &str,
    ) -> bool {
        match self
            .verify_parts(request, authorization_header, date_header, content_hash)
            .await
        {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, "SigV4 verification failed");
                false
            }
        }
    }

    fn check_skew(&self, timestamp: &DateTime<Utc>, now: &DateTime<Utc>) -> Result<(), SigV4Error> {
        let Some(max_skew) = self.max_skew else {
            return Ok(());
        };

        let skew = if now > timestamp {
            *now - *timestamp
        } else {
            *timestamp - *now
        };

        if skew > max_skew {
            return Err(SigV4Error::RequestTimeTooSkewed);
        }
        Ok(())
    }
}
