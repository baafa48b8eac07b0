//! Presigned URLs (SigV4 query-string authentication)
//!
//! The signing inputs travel in the query string instead of headers and the
//! payload is always `UNSIGNED-PAYLOAD`. A URL is valid from `X-Amz-Date`
//! (less [`MAX_CLOCK_AHEAD_SECS`] for client clock drift) until
//! `X-Amz-Date + X-Amz-Expires`.

use chrono::{DateTime, Duration, Utc};
use http::header::HOST;
use http::{Method, Request, Uri};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use thiserror::Error;

use crate::credentials::Credential;
use crate::sigv4::{
    canonical_query_from_pairs, canonical_request_with_query, check_signature,
    derive_signing_key, compute_signature, normalize_signed_headers, parse_amz_date,
    string_to_sign, SigV4Error, SigV4Verifier, SignableRequest, SigningScope, ALGORITHM,
    AMZ_DATE_FORMAT, UNSIGNED_PAYLOAD,
};

/// Longest lifetime a presigned URL may request (seven days)
pub const MAX_EXPIRES_SECS: i64 = 604_800;

/// How far `X-Amz-Date` may be ahead of the server clock
pub const MAX_CLOCK_AHEAD_SECS: i64 = 900;

const X_AMZ_ALGORITHM: &str = "X-Amz-Algorithm";
const X_AMZ_CREDENTIAL: &str = "X-Amz-Credential";
const X_AMZ_DATE: &str = "X-Amz-Date";
const X_AMZ_EXPIRES: &str = "X-Amz-Expires";
const X_AMZ_SIGNED_HEADERS: &str = "X-Amz-SignedHeaders";
const X_AMZ_SIGNATURE: &str = "X-Amz-Signature";

/// Path segments keep `/` but escape everything outside the unreserved set
const PATH_SEGMENT_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'/');

#[derive(Debug, Error)]
pub enum PresignError {
    #[error("Missing query parameter: {0}")]
    MissingParameter(&'static str),

    #[error("Invalid X-Amz-Expires: {0}")]
    InvalidExpires(String),

    #[error("Presigned URL has expired")]
    Expired,

    #[error("Presigned URL is not valid yet")]
    NotYetValid,

    #[error("Invalid request URI: {0}")]
    InvalidUri(String),

    #[error(transparent)]
    SigV4(#[from] SigV4Error),
}

/// Signing parameters extracted from a presigned URL's query string
#[derive(Debug, Clone)]
pub struct PresignedQuery {
    pub access_key: String,
    pub timestamp: DateTime<Utc>,
    pub expires: Duration,
    pub signed_headers: Vec<String>,
    pub signature: String,
    /// Every parameter except the signature, canonicalized
    canonical_query: String,
}

impl PresignedQuery {
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.timestamp + self.expires
    }
}

/// True when the URI carries query-string authentication
pub fn is_presigned(uri: &Uri) -> bool {
    uri.query().is_some_and(|q| {
        form_urlencoded::parse(q.as_bytes()).any(|(name, _)| name == X_AMZ_SIGNATURE)
    })
}

fn validate_expires(secs: i64) -> Result<Duration, PresignError> {
    if (1..=MAX_EXPIRES_SECS).contains(&secs) {
        Ok(Duration::seconds(secs))
    } else {
        Err(PresignError::InvalidExpires(secs.to_string()))
    }
}

/// Parse the `X-Amz-*` parameters of a presigned URL
pub fn parse_presigned_query(query: &str) -> Result<PresignedQuery, PresignError> {
    let pairs: Vec<(String, String)> = form_urlencoded::parse(query.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    let param = |name: &'static str| {
        pairs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
            .ok_or(PresignError::MissingParameter(name))
    };

    let algorithm = param(X_AMZ_ALGORITHM)?;
    if algorithm != ALGORITHM {
        return Err(SigV4Error::InvalidAlgorithm(algorithm.to_string()).into());
    }

    let credential = param(X_AMZ_CREDENTIAL)?;
    let access_key = credential.split('/').next().unwrap_or_default();
    if access_key.is_empty() {
        return Err(SigV4Error::MissingAccessKey.into());
    }

    let timestamp = parse_amz_date(param(X_AMZ_DATE)?)?;

    let raw_expires = param(X_AMZ_EXPIRES)?;
    let expires = raw_expires
        .parse::<i64>()
        .map_err(|_| PresignError::InvalidExpires(raw_expires.to_string()))
        .and_then(validate_expires)?;

    let signed_headers = normalize_signed_headers(param(X_AMZ_SIGNED_HEADERS)?);

    let signature = param(X_AMZ_SIGNATURE)?;
    if signature.is_empty() {
        return Err(SigV4Error::MissingSignature.into());
    }

    let canonical_query = canonical_query_from_pairs(
        pairs
            .iter()
            .filter(|(k, _)| k != X_AMZ_SIGNATURE)
            .cloned(),
    );

    Ok(PresignedQuery {
        access_key: access_key.to_string(),
        timestamp,
        expires,
        signed_headers,
        signature: signature.to_string(),
        canonical_query,
    })
}

/// Check a parsed presigned URL against a known secret at time `now`
pub fn verify_presigned_with_secret(
    request: &SignableRequest<'_>,
    presigned: &PresignedQuery,
    secret_key: &str,
    scope: &SigningScope,
    now: &DateTime<Utc>,
) -> Result<(), PresignError> {
    if presigned.timestamp > *now + Duration::seconds(MAX_CLOCK_AHEAD_SECS) {
        return Err(PresignError::NotYetValid);
    }
    if *now > presigned.expires_at() {
        return Err(PresignError::Expired);
    }

    let canonical = canonical_request_with_query(
        request,
        &presigned.canonical_query,
        &presigned.signed_headers,
        UNSIGNED_PAYLOAD,
    );
    let to_sign = string_to_sign(&presigned.timestamp, scope, &canonical);
    let signing_key = derive_signing_key(secret_key, &presigned.timestamp, scope);

    check_signature(&signing_key, &to_sign, &presigned.signature)?;
    Ok(())
}

/// Percent-encoded `/<bucket>/<key>` path
pub fn object_path(bucket: &str, key: &str) -> String {
    format!(
        "/{}/{}",
        utf8_percent_encode(bucket, PATH_SEGMENT_SET),
        utf8_percent_encode(key, PATH_SEGMENT_SET)
    )
}

/// Parameters for generating a presigned URL
#[derive(Debug, Clone)]
pub struct PresignRequest<'a> {
    pub method: Method,
    /// Value of the `Host` header the client will send
    pub host: &'a str,
    /// Already percent-encoded request path
    pub path: &'a str,
    pub timestamp: DateTime<Utc>,
    pub expires_secs: i64,
}

/// Generate the path and query of a presigned URL
pub fn presign_url(
    request: &PresignRequest<'_>,
    credential: &Credential,
    scope: &SigningScope,
) -> Result<String, PresignError> {
    validate_expires(request.expires_secs)?;

    let pairs = vec![
        (X_AMZ_ALGORITHM.to_string(), ALGORITHM.to_string()),
        (
            X_AMZ_CREDENTIAL.to_string(),
            format!(
                "{}/{}",
                credential.access_key_id,
                scope.credential_scope(&request.timestamp)
            ),
        ),
        (
            X_AMZ_DATE.to_string(),
            request.timestamp.format(AMZ_DATE_FORMAT).to_string(),
        ),
        (X_AMZ_EXPIRES.to_string(), request.expires_secs.to_string()),
        (X_AMZ_SIGNED_HEADERS.to_string(), HOST.as_str().to_string()),
    ];
    let canonical_query = canonical_query_from_pairs(pairs);

    let http_request = Request::builder()
        .method(request.method.clone())
        .uri(request.path)
        .header(HOST, request.host)
        .body(())
        .map_err(|e| PresignError::InvalidUri(e.to_string()))?;
    let signable = SignableRequest::from_request(&http_request);

    let canonical = canonical_request_with_query(
        &signable,
        &canonical_query,
        &[HOST.as_str().to_string()],
        UNSIGNED_PAYLOAD,
    );
    let to_sign = string_to_sign(&request.timestamp, scope, &canonical);
    let signature = compute_signature(
        &derive_signing_key(&credential.secret_key, &request.timestamp, scope),
        &to_sign,
    );

    Ok(format!(
        "{}?{canonical_query}&{X_AMZ_SIGNATURE}={signature}",
        signable.uri.path()
    ))
}

impl SigV4Verifier {
    /// Verify a presigned request and resolve its credential
    pub async fn verify_presigned(
        &self,
        request: &SignableRequest<'_>,
        now: &DateTime<Utc>,
    ) -> Result<Credential, PresignError> {
        let query = request
            .uri
            .query()
            .ok_or(PresignError::MissingParameter(X_AMZ_SIGNATURE))?;
        let presigned = parse_presigned_query(query)?;

        let credential = self
            .credentials()
            .find(&presigned.access_key)
            .await
            .map_err(SigV4Error::from)?
            .ok_or_else(|| SigV4Error::UnknownAccessKey(presigned.access_key.clone()))?;

        verify_presigned_with_secret(request, &presigned, &credential.secret_key, self.scope(), now)?;
        Ok(credential)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::credentials::CredentialStore;

    const HOST_VALUE: &str = "localhost:9000";

    fn credential() -> Credential {
        Credential::new("AK1", "SK1", "owner")
    }

    fn presigned_get(path_and_query: &str) -> Request<()> {
        Request::builder()
            .method("GET")
            .uri(path_and_query)
            .header("host", HOST_VALUE)
            .body(())
            .unwrap()
    }

    fn generate(timestamp: DateTime<Utc>, expires_secs: i64) -> String {
        let path = object_path("demo", "dir/file one.txt");
        presign_url(
            &PresignRequest {
                method: Method::GET,
                host: HOST_VALUE,
                path: &path,
                timestamp,
                expires_secs,
            },
            &credential(),
            &SigningScope::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_object_path_encoding() {
        assert_eq!(object_path("demo", "dir/file one.txt"), "/demo/dir/file%20one.txt");
        assert_eq!(object_path("demo", "a+b"), "/demo/a%2Bb");
    }

    #[test]
    fn test_round_trip() {
        let now = Utc::now();
        let url = generate(now, 300);
        assert!(url.starts_with("/demo/dir/file%20one.txt?X-Amz-Algorithm=AWS4-HMAC-SHA256"));

        let request = presigned_get(&url);
        assert!(is_presigned(request.uri()));

        let parsed = parse_presigned_query(request.uri().query().unwrap()).unwrap();
        assert_eq!(parsed.access_key, "AK1");
        assert_eq!(parsed.signed_headers, vec!["host"]);
        assert_eq!(parsed.expires, Duration::seconds(300));

        verify_presigned_with_secret(
            &SignableRequest::from_request(&request),
            &parsed,
            "SK1",
            &SigningScope::default(),
            &now,
        )
        .unwrap();
    }

    #[test]
    fn test_tampering_detected() {
        let now = Utc::now();
        let url = generate(now, 300).replace("file%20one", "file%20two");
        let request = presigned_get(&url);
        let parsed = parse_presigned_query(request.uri().query().unwrap()).unwrap();

        assert!(matches!(
            verify_presigned_with_secret(
                &SignableRequest::from_request(&request),
                &parsed,
                "SK1",
                &SigningScope::default(),
                &now
            ),
            Err(PresignError::SigV4(SigV4Error::SignatureMismatch))
        ));

        let url = generate(now, 300);
        let request = presigned_get(&url);
        let parsed = parse_presigned_query(request.uri().query().unwrap()).unwrap();
        assert!(verify_presigned_with_secret(
            &SignableRequest::from_request(&request),
            &parsed,
            "other-secret",
            &SigningScope::default(),
            &now
        )
        .is_err());
    }

    #[test]
    fn test_expiry() {
        let issued = Utc::now() - Duration::seconds(120);
        let request = presigned_get(&generate(issued, 60));
        let parsed = parse_presigned_query(request.uri().query().unwrap()).unwrap();

        assert!(matches!(
            verify_presigned_with_secret(
                &SignableRequest::from_request(&request),
                &parsed,
                "SK1",
                &SigningScope::default(),
                &Utc::now()
            ),
            Err(PresignError::Expired)
        ));
    }

    #[test]
    fn test_future_dated_url_rejected() {
        let now = Utc::now();
        let verify = |issued: DateTime<Utc>| {
            let request = presigned_get(&generate(issued, 60));
            let parsed = parse_presigned_query(request.uri().query().unwrap()).unwrap();
            verify_presigned_with_secret(
                &SignableRequest::from_request(&request),
                &parsed,
                "SK1",
                &SigningScope::default(),
                &now,
            )
        };

        assert!(matches!(
            verify(now + Duration::days(365)),
            Err(PresignError::NotYetValid)
        ));
        assert!(matches!(
            verify(now + Duration::seconds(MAX_CLOCK_AHEAD_SECS + 1)),
            Err(PresignError::NotYetValid)
        ));
        // Small drift ahead of the server clock is tolerated
        verify(now + Duration::seconds(30)).unwrap();
    }

    #[test]
    fn test_expires_bounds() {
        let path = object_path("demo", "k");
        for expires_secs in [0, -5, MAX_EXPIRES_SECS + 1] {
            let result = presign_url(
                &PresignRequest {
                    method: Method::GET,
                    host: HOST_VALUE,
                    path: &path,
                    timestamp: Utc::now(),
                    expires_secs,
                },
                &credential(),
                &SigningScope::default(),
            );
            assert!(matches!(result, Err(PresignError::InvalidExpires(_))));
        }
    }

    #[test]
    fn test_missing_parameters() {
        assert!(matches!(
            parse_presigned_query("X-Amz-Signature=00"),
            Err(PresignError::MissingParameter("X-Amz-Algorithm"))
        ));
        assert!(!is_presigned(&"/demo/key?prefix=a".parse().unwrap()));
        assert!(!is_presigned(&"/demo/key".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_verifier_resolves_presigned_credential() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CredentialStore::in_dir(dir.path()));
        store.add(credential()).await.unwrap();
        let verifier = SigV4Verifier::new(store, SigningScope::default());

        let now = Utc::now();
        let request = presigned_get(&generate(now, 300));
        let resolved = verifier
            .verify_presigned(&SignableRequest::from_request(&request), &now)
            .await
            .unwrap();
        assert_eq!(resolved.access_key_id, "AK1");
    }
}
