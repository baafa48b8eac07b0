//! S3 HTTP request handlers
//!
//! Every handler authorizes first and only then touches storage, so a missing
//! bucket or key is indistinguishable from a forbidden one until the caller is
//! allowed in.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{rejection::QueryRejection, Path, Query, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::any,
    Router,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use strata_auth::CredentialStore;
use strata_core::{AwsError, ErrorCode, RequestId};
use tracing::{debug, error, info, warn};

use crate::acl::{
    has_acl_headers, resolve_acl_headers, AclError, BucketAcl, BucketPermissions, X_AMZ_ACL,
};
use crate::authz::{AccessRequest, AuthorizationResult, Authorizer, AuthzError, Decision};
use crate::listing::{list_bucket, ListError, ListRequest};
use crate::metadata::{ObjectAttributes, ObjectMetadata};
use crate::permissions::{PermissionError, PermissionStore};
use crate::storage::{ObjectInfo, ObjectStorage, StorageError};
use crate::xml::{format_access_control_policy, format_list_buckets, format_list_objects};

const XML_CONTENT_TYPE: &str = "application/xml";
const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";
const USER_METADATA_PREFIX: &str = "x-amz-meta-";
const HTTP_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// Shared state for S3 handlers
pub struct S3State {
    pub authorizer: Authorizer,
    pub storage: Arc<dyn ObjectStorage>,
    pub permissions: Arc<PermissionStore>,
    pub credentials: Arc<CredentialStore>,
    /// Reported in `x-amz-bucket-region`
    pub region: String,
}

/// Query parameters of bucket-level requests
#[derive(Debug, Deserialize, Default)]
pub struct BucketQuery {
    pub prefix: Option<String>,
    pub delimiter: Option<String>,
    #[serde(rename = "max-keys")]
    pub max_keys: Option<usize>,
    #[serde(rename = "continuation-token")]
    pub continuation_token: Option<String>,
    #[serde(rename = "start-after")]
    pub start_after: Option<String>,
    pub acl: Option<String>,
}

impl BucketQuery {
    fn list_request(self) -> ListRequest {
        ListRequest {
            prefix: self.prefix.unwrap_or_default(),
            delimiter: self.delimiter.unwrap_or_default(),
            max_keys: self.max_keys,
            continuation_token: self.continuation_token.filter(|t| !t.is_empty()),
            start_after: self.start_after.filter(|s| !s.is_empty()),
        }
    }
}

type HandlerResult = Result<Response, AwsError>;

/// S3 routes: `/`, `/{bucket}` and `/{bucket}/{key...}`
pub fn router(state: Arc<S3State>) -> Router {
    Router::new()
        .route("/", any(handle_root))
        .route("/:bucket", any(handle_bucket))
        .route("/:bucket/", any(handle_bucket))
        .route("/:bucket/*key", any(handle_object))
        .with_state(state)
}

/// Handle root-level operations (ListBuckets)
pub async fn handle_root(
    State(state): State<Arc<S3State>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let request_id = RequestId::new();

    let access = AccessRequest::new(&method, &uri, &headers);
    let result = match state.authorizer.authorize(&access).await {
        Ok(auth) => match method {
            Method::GET => list_buckets(&state, &auth).await,
            _ => Err(AwsError::from_code(ErrorCode::MethodNotAllowed)),
        },
        Err(e) => Err(authz_error(e)),
    };

    finish(result, request_id)
}

/// Handle bucket-level operations
pub async fn handle_bucket(
    State(state): State<Arc<S3State>>,
    Path(bucket): Path<String>,
    method: Method,
    uri: Uri,
    query: Result<Query<BucketQuery>, QueryRejection>,
    headers: HeaderMap,
) -> Response {
    let request_id = RequestId::new();
    let query = match query {
        Ok(Query(query)) => query,
        Err(rejection) => {
            debug!(bucket = %bucket, error = %rejection, "Rejected query string");
            let error = AwsError::new(ErrorCode::InvalidArgument, rejection.body_text());
            return finish(Err(error.with_resource(&bucket)), request_id);
        }
    };
    let acl_query = query.acl.is_some();
    debug!(bucket = %bucket, method = %method, acl = acl_query, "S3 bucket request");

    let access = AccessRequest::new(&method, &uri, &headers)
        .bucket(&bucket)
        .acl_query(acl_query);
    let auth = match state.authorizer.authorize(&access).await {
        Ok(auth) => auth,
        Err(e) => return finish(Err(authz_error(e)), request_id),
    };

    let result = match (method, acl_query) {
        (Method::GET, true) => get_bucket_acl(&state, &bucket, auth).await,
        (Method::PUT, true) => put_bucket_acl(&state, &bucket, &auth, &headers).await,
        (Method::PUT, false) if auth.decision == Decision::Provisioning => {
            create_bucket(&state, &bucket, &auth, &headers).await
        }
        (Method::PUT, false) if has_acl_headers(&headers) => {
            put_bucket_acl(&state, &bucket, &auth, &headers).await
        }
        (Method::PUT, false) => Err(bucket_exists_error(&bucket, &auth)),
        (Method::GET, false) => list_objects(&state, &bucket, query.list_request()).await,
        (Method::HEAD, false) => head_bucket(&state, &bucket).await,
        (Method::DELETE, false) => delete_bucket(&state, &bucket).await,
        _ => Err(AwsError::from_code(ErrorCode::MethodNotAllowed)),
    };

    finish(result, request_id)
}

/// Handle object-level operations
pub async fn handle_object(
    State(state): State<Arc<S3State>>,
    Path((bucket, key)): Path<(String, String)>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request_id = RequestId::new();
    debug!(bucket = %bucket, key = %key, method = %method, "S3 object request");

    let access = AccessRequest::new(&method, &uri, &headers)
        .bucket(&bucket)
        .key(&key);
    let auth = match state.authorizer.authorize(&access).await {
        Ok(auth) => auth,
        Err(e) => return finish(Err(authz_error(e)), request_id),
    };

    let result = match method {
        Method::PUT => put_object(&state, &bucket, &key, &auth, &headers, body).await,
        Method::GET => get_object(&state, &bucket, &key).await,
        Method::HEAD => head_object(&state, &bucket, &key).await,
        Method::DELETE => delete_object(&state, &bucket, &key).await,
        _ => Err(AwsError::from_code(ErrorCode::MethodNotAllowed)),
    };

    finish(result, request_id)
}

// === Root Operations ===

async fn list_buckets(state: &S3State, auth: &AuthorizationResult) -> HandlerResult {
    let session = auth.session.as_ref().ok_or_else(AwsError::access_denied)?;

    let buckets: Vec<BucketPermissions> = state
        .permissions
        .list()
        .await
        .map_err(|e| permission_error(e, ""))?
        .into_iter()
        .filter(|b| b.is_visible_to(&session.access_key_id))
        .collect();

    Ok(xml_response(format_list_buckets(
        &session.access_key_id,
        &session.display_name,
        &buckets,
    )))
}

// === Bucket Operations ===

async fn create_bucket(
    state: &S3State,
    bucket: &str,
    auth: &AuthorizationResult,
    headers: &HeaderMap,
) -> HandlerResult {
    let session = auth.session.as_ref().ok_or_else(AwsError::access_denied)?;

    state
        .storage
        .create_bucket(bucket)
        .await
        .map_err(|e| storage_error(e, bucket, None))?;

    let mut permissions = BucketPermissions::new(bucket, session);

    // ACL headers never fail the creation itself
    if has_acl_headers(headers) {
        match resolve_acl_headers(&state.credentials, headers).await {
            Ok((resolved, errors)) => {
                for e in &errors {
                    warn!(bucket, error = %e, "Ignoring ACL header on bucket creation");
                }
                resolved.apply_to(&mut permissions);
            }
            Err(e) => warn!(bucket, error = %e, "Could not resolve ACL grantees"),
        }
    }

    // A directory without a document could never be provisioned again
    if let Err(e) = state.permissions.create(&permissions).await {
        if let Err(cleanup) = state.storage.delete_bucket(bucket).await {
            error!(bucket, error = %cleanup, "Failed to remove bucket directory after permissions error");
        }
        return Err(permission_error(e, bucket));
    }
    info!(bucket, owner = %session.access_key_id, acl = permissions.acl.as_canned(), "Created bucket");

    Ok(empty_response(StatusCode::OK, |h| {
        insert_header(h, header::LOCATION, &format!("/{bucket}"));
    }))
}

fn bucket_exists_error(bucket: &str, auth: &AuthorizationResult) -> AwsError {
    let owned = matches!(
        (&auth.permissions, auth.session_id()),
        (Some(p), Some(id)) if p.owner.id == id
    );
    let code = if owned {
        ErrorCode::BucketAlreadyOwnedByYou
    } else {
        ErrorCode::BucketAlreadyExists
    };
    AwsError::from_code(code).with_resource(bucket)
}

async fn head_bucket(state: &S3State, bucket: &str) -> HandlerResult {
    if !state.storage.bucket_exists(bucket).await {
        return Err(AwsError::from_code(ErrorCode::NoSuchBucket).with_resource(bucket));
    }
    Ok(empty_response(StatusCode::OK, |h| {
        insert_header(h, HeaderName::from_static("x-amz-bucket-region"), &state.region);
    }))
}

async fn delete_bucket(state: &S3State, bucket: &str) -> HandlerResult {
    state
        .storage
        .delete_bucket(bucket)
        .await
        .map_err(|e| storage_error(e, bucket, None))?;
    state
        .permissions
        .delete(bucket)
        .await
        .map_err(|e| permission_error(e, bucket))?;

    info!(bucket, "Deleted bucket");
    Ok(empty_response(StatusCode::NO_CONTENT, |_| {}))
}

async fn list_objects(state: &S3State, bucket: &str, request: ListRequest) -> HandlerResult {
    match list_bucket(state.storage.as_ref(), bucket, &request).await {
        Ok(result) => Ok(xml_response(format_list_objects(bucket, &request, &result))),
        Err(ListError::InvalidContinuationToken) => Err(AwsError::new(
            ErrorCode::InvalidArgument,
            "The continuation token provided is incorrect",
        )),
        Err(ListError::Storage(e)) => Err(storage_error(e, bucket, None)),
    }
}

async fn get_bucket_acl(state: &S3State, bucket: &str, auth: AuthorizationResult) -> HandlerResult {
    let permissions = match auth.permissions {
        Some(permissions) => permissions,
        None => state
            .permissions
            .load(bucket)
            .await
            .map_err(|e| permission_error(e, bucket))?,
    };
    Ok(xml_response(format_access_control_policy(&permissions)))
}

async fn put_bucket_acl(
    state: &S3State,
    bucket: &str,
    auth: &AuthorizationResult,
    headers: &HeaderMap,
) -> HandlerResult {
    if !has_acl_headers(headers) {
        return Err(AwsError::new(
            ErrorCode::InvalidRequest,
            "ACL changes must be sent as x-amz-acl or x-amz-grant-* headers",
        ));
    }

    match apply_acl_headers(state, bucket, auth, headers).await {
        Ok(()) => Ok(empty_response(StatusCode::OK, |_| {})),
        Err(AclError::InsufficientPermission) => Err(AwsError::access_denied()),
        Err(AclError::Permissions(e)) => Err(permission_error(e, bucket)),
        Err(AclError::Credentials(e)) => {
            error!(bucket, error = %e, "Credential store failure while resolving grantees");
            Err(AwsError::from_code(ErrorCode::InternalError))
        }
        Err(e) => Err(AwsError::new(ErrorCode::MalformedAclError, e.to_string())),
    }
}

/// Resolve the request's ACL headers and store them in one locked update
///
/// Every header problem is logged; the first one is returned and nothing is stored.
async fn apply_acl_headers(
    state: &S3State,
    bucket: &str,
    auth: &AuthorizationResult,
    headers: &HeaderMap,
) -> Result<(), AclError> {
    let allowed = auth
        .session_grant()
        .is_some_and(|g| g.permission.is_acl_modification());
    if !allowed {
        return Err(AclError::InsufficientPermission);
    }

    let (resolved, errors) = resolve_acl_headers(&state.credentials, headers).await?;
    for e in &errors {
        warn!(bucket, error = %e, "Rejected ACL header");
    }
    if let Some(first) = errors.into_iter().next() {
        return Err(first);
    }

    state
        .permissions
        .modify(bucket, |permissions| {
            resolved.apply_to(permissions);
            Ok(())
        })
        .await?;

    info!(
        bucket,
        canned = resolved.canned.map(|acl| acl.as_canned()),
        grants = resolved.grants.len(),
        "Updated bucket ACL"
    );
    Ok(())
}

// === Object Operations ===

async fn put_object(
    state: &S3State,
    bucket: &str,
    key: &str,
    auth: &AuthorizationResult,
    headers: &HeaderMap,
    body: Bytes,
) -> HandlerResult {
    let attributes = extract_attributes(headers, auth.session_id().unwrap_or_default());

    let result = state
        .storage
        .put_object(bucket, key, body, attributes)
        .await
        .map_err(|e| storage_error(e, bucket, Some(key)))?;

    Ok(empty_response(StatusCode::OK, |h| {
        insert_header(h, header::ETAG, &result.etag);
        if let Some(version_id) = &result.version_id {
            insert_header(h, HeaderName::from_static("x-amz-version-id"), version_id);
        }
    }))
}

async fn get_object(state: &S3State, bucket: &str, key: &str) -> HandlerResult {
    let object = state
        .storage
        .get_object(bucket, key)
        .await
        .map_err(|e| storage_error(e, bucket, Some(key)))?;

    let mut response = Response::new(Body::from(object.data));
    object_headers(response.headers_mut(), &object.info);
    Ok(response)
}

async fn head_object(state: &S3State, bucket: &str, key: &str) -> HandlerResult {
    let info = state
        .storage
        .head_object(bucket, key)
        .await
        .map_err(|e| storage_error(e, bucket, Some(key)))?;

    Ok(empty_response(StatusCode::OK, |h| object_headers(h, &info)))
}

async fn delete_object(state: &S3State, bucket: &str, key: &str) -> HandlerResult {
    let removed = state
        .storage
        .delete_object(bucket, key)
        .await
        .map_err(|e| storage_error(e, bucket, Some(key)))?;
    debug!(bucket, key, removed, "Delete object");

    Ok(empty_response(StatusCode::NO_CONTENT, |_| {}))
}

// === Helper Functions ===

fn extract_attributes(headers: &HeaderMap, owner: &str) -> ObjectAttributes {
    let public = headers
        .get(X_AMZ_ACL)
        .and_then(|v| v.to_str().ok())
        .and_then(BucketAcl::from_canned)
        .is_some_and(|acl| acl.allows_public_read());

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(String::from);

    let user_metadata: BTreeMap<String, String> = headers
        .iter()
        .filter_map(|(name, value)| {
            let meta_key = name.as_str().strip_prefix(USER_METADATA_PREFIX)?;
            Some((meta_key.to_string(), value.to_str().ok()?.to_string()))
        })
        .collect();

    ObjectAttributes {
        owner: owner.to_string(),
        public,
        content_type,
        user_metadata,
    }
}

fn object_headers(headers: &mut HeaderMap, info: &ObjectInfo) {
    if let Some(etag) = &info.etag {
        insert_header(headers, header::ETAG, etag);
    }
    insert_header(headers, header::CONTENT_LENGTH, &info.size.to_string());
    insert_header(headers, header::LAST_MODIFIED, &http_date(&info.last_modified));

    let metadata: Option<&ObjectMetadata> = info.metadata.as_ref();
    let content_type = metadata
        .and_then(|m| m.content_type.as_deref())
        .unwrap_or(DEFAULT_CONTENT_TYPE);
    insert_header(headers, header::CONTENT_TYPE, content_type);

    if let Some(meta) = metadata {
        insert_header(headers, HeaderName::from_static("x-amz-version-id"), &meta.version_id);
        for (name, value) in &meta.user_metadata {
            match HeaderName::try_from(format!("{USER_METADATA_PREFIX}{name}")) {
                Ok(name) => insert_header(headers, name, value),
                Err(_) => debug!(name = %name, "Skipping unrepresentable metadata header"),
            }
        }
    }
}

fn http_date(time: &DateTime<Utc>) -> String {
    time.format(HTTP_DATE_FORMAT).to_string()
}

fn insert_header(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    match HeaderValue::from_str(value) {
        Ok(value) => {
            headers.insert(name, value);
        }
        Err(_) => debug!(header = %name, "Dropping header with invalid value"),
    }
}

fn empty_response(status: StatusCode, headers: impl FnOnce(&mut HeaderMap)) -> Response {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = status;
    headers(response.headers_mut());
    response
}

fn xml_response(body: String) -> Response {
    let mut response = Response::new(Body::from(body));
    insert_header(response.headers_mut(), header::CONTENT_TYPE, XML_CONTENT_TYPE);
    response
}

fn error_response(error: &AwsError) -> Response {
    let status =
        StatusCode::from_u16(error.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = (status, error.to_xml()).into_response();
    insert_header(response.headers_mut(), header::CONTENT_TYPE, XML_CONTENT_TYPE);
    response
}

/// Attach request IDs and render errors
fn finish(result: HandlerResult, request_id: RequestId) -> Response {
    let mut response = match result {
        Ok(response) => response,
        Err(error) => error_response(&error.with_request_id(request_id.clone())),
    };

    let headers = response.headers_mut();
    for (name, value) in request_id.header_pairs() {
        insert_header(headers, HeaderName::from_static(name), value);
    }
    response
}

fn authz_error(error: AuthzError) -> AwsError {
    match error {
        AuthzError::Denied(_) => AwsError::access_denied(),
        AuthzError::MethodNotAllowed(_) => AwsError::from_code(ErrorCode::MethodNotAllowed),
        AuthzError::InvalidKey(reason) => AwsError::new(ErrorCode::InvalidArgument, reason),
    }
}

fn storage_error(error: StorageError, bucket: &str, key: Option<&str>) -> AwsError {
    match error {
        StorageError::BucketNotFound(_) => {
            AwsError::from_code(ErrorCode::NoSuchBucket).with_resource(bucket)
        }
        StorageError::ObjectNotFound { .. } => {
            AwsError::from_code(ErrorCode::NoSuchKey).with_resource(key.unwrap_or_default())
        }
        StorageError::BucketAlreadyExists(_) => {
            AwsError::from_code(ErrorCode::BucketAlreadyExists).with_resource(bucket)
        }
        StorageError::BucketNotEmpty(_) => {
            AwsError::from_code(ErrorCode::BucketNotEmpty).with_resource(bucket)
        }
        StorageError::InvalidBucketName(_) => {
            AwsError::from_code(ErrorCode::InvalidBucketName).with_resource(bucket)
        }
        StorageError::InvalidKey(reason) => AwsError::new(ErrorCode::InvalidArgument, reason),
        e @ (StorageError::Io(_) | StorageError::Malformed(_)) => {
            error!(bucket, key = ?key, error = %e, "Storage failure");
            AwsError::from_code(ErrorCode::InternalError)
        }
    }
}

fn permission_error(error: PermissionError, bucket: &str) -> AwsError {
    match error {
        PermissionError::NotFound(_) => {
            AwsError::from_code(ErrorCode::NoSuchBucket).with_resource(bucket)
        }
        PermissionError::AlreadyExists(_) => {
            AwsError::from_code(ErrorCode::BucketAlreadyExists).with_resource(bucket)
        }
        e => {
            error!(bucket, error = %e, "Permission store failure");
            AwsError::from_code(ErrorCode::InternalError)
        }
    }
}
