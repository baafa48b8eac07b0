//! Integration tests for the S3 router
//!
//! Requests are signed with the crate's own SigV4 signer and driven through the
//! axum router with `oneshot`.

use std::sync::Arc;

use axum::body::Body;
use axum::Router;
use chrono::Utc;
use http::header::AUTHORIZATION;
use http::{Method, Request, Response, StatusCode};
use http_body_util::BodyExt;
use tempfile::TempDir;
use tower::ServiceExt;

use strata_auth::sigv4::{sign_request, AMZ_DATE_FORMAT, UNSIGNED_PAYLOAD, X_AMZ_CONTENT_SHA256, X_AMZ_DATE};
use strata_auth::{presign_url, Credential, PresignRequest, SignableRequest, SigningScope};
use strata_s3::{router, S3Config, StrataS3};

const HOST: &str = "localhost:9000";

struct TestServer {
    _dir: TempDir,
    router: Router,
}

impl TestServer {
    /// Server with identities AK1/SK1 and AK2/SK2 and no buckets
    async fn start() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let stores = StrataS3::open(dir.path());
        for (ak, sk, name) in [("AK1", "SK1", "alice"), ("AK2", "SK2", "bob")] {
            stores
                .credentials()
                .add(Credential::new(ak, sk, name))
                .await
                .unwrap();
        }

        let state = stores.into_state(&S3Config::new(dir.path()));
        Self {
            _dir: dir,
            router: router(Arc::new(state)),
        }
    }

    async fn send(&self, request: Request<Body>) -> Response<Body> {
        self.router.clone().oneshot(request).await.unwrap()
    }

    /// Start with bucket `demo` owned by AK1
    async fn with_demo_bucket() -> Self {
        let server = Self::start().await;
        let response = server.send(signed(Method::PUT, "/demo", "AK1", "SK1")).await;
        assert_eq!(response.status(), StatusCode::OK);
        server
    }
}

struct RequestBuilder {
    method: Method,
    uri: String,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

fn request(method: Method, uri: &str) -> RequestBuilder {
    RequestBuilder {
        method,
        uri: uri.to_string(),
        headers: Vec::new(),
        body: Vec::new(),
    }
}

impl RequestBuilder {
    fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    fn body(mut self, body: &[u8]) -> Self {
        self.body = body.to_vec();
        self
    }

    fn build(self) -> Request<Body> {
        let mut builder = Request::builder()
            .method(self.method)
            .uri(self.uri)
            .header("host", HOST);
        for (name, value) in &self.headers {
            builder = builder.header(name, value);
        }
        builder.body(Body::from(self.body)).unwrap()
    }

    fn sign(self, access_key: &str, secret: &str) -> Request<Body> {
        let now = Utc::now();
        let mut request = self
            .header(X_AMZ_DATE, &now.format(AMZ_DATE_FORMAT).to_string())
            .header(X_AMZ_CONTENT_SHA256, UNSIGNED_PAYLOAD)
            .build();

        let authorization = sign_request(
            &SignableRequest::from_request(&request),
            access_key,
            secret,
            &now,
            &["host", "x-amz-content-sha256", "x-amz-date"],
            &SigningScope::default(),
        );
        request
            .headers_mut()
            .insert(AUTHORIZATION, authorization.parse().unwrap());
        request
    }
}

fn signed(method: Method, uri: &str, access_key: &str, secret: &str) -> Request<Body> {
    request(method, uri).sign(access_key, secret)
}

fn anonymous(method: Method, uri: &str) -> Request<Body> {
    request(method, uri).build()
}

async fn body_string(response: Response<Body>) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

async fn assert_denied(response: Response<Body>) {
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body = body_string(response).await;
    assert!(body.contains("<Code>AccessDenied</Code>"), "{body}");
}

// =============================================================================
// GRANTS END TO END
// =============================================================================

#[tokio::test]
async fn test_read_grant_end_to_end() {
    let server = TestServer::with_demo_bucket().await;

    let upload = request(Method::PUT, "/demo/file.txt")
        .body(b"hello world")
        .sign("AK1", "SK1");
    assert_eq!(server.send(upload).await.status(), StatusCode::OK);

    // AK2 has no grant yet
    assert_denied(server.send(signed(Method::GET, "/demo/file.txt", "AK2", "SK2")).await).await;

    let grant = request(Method::PUT, "/demo?acl")
        .header("x-amz-grant-read", "id=\"AK2\"")
        .sign("AK1", "SK1");
    assert_eq!(server.send(grant).await.status(), StatusCode::OK);

    let response = server
        .send(signed(Method::GET, "/demo/file.txt", "AK2", "SK2"))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, "hello world");

    assert_denied(
        server
            .send(signed(Method::GET, "/demo/file.txt", "AK2", "wrong-secret"))
            .await,
    )
    .await;

    let write = request(Method::PUT, "/demo/file.txt")
        .body(b"overwrite")
        .sign("AK2", "SK2");
    assert_denied(server.send(write).await).await;
}

#[tokio::test]
async fn test_missing_resources_are_denied_before_authorization() {
    let server = TestServer::with_demo_bucket().await;

    assert_denied(server.send(anonymous(Method::GET, "/demo/file.txt")).await).await;
    assert_denied(server.send(anonymous(Method::GET, "/ghost/file.txt")).await).await;
    assert_denied(server.send(signed(Method::GET, "/ghost", "AK1", "SK1")).await).await;

    // Once authorized, absence is reported precisely
    let response = server
        .send(signed(Method::GET, "/demo/missing.txt", "AK1", "SK1"))
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(body_string(response).await.contains("<Code>NoSuchKey</Code>"));
}

#[tokio::test]
async fn test_full_control_grant_allows_writes() {
    let server = TestServer::with_demo_bucket().await;

    let grant = request(Method::PUT, "/demo?acl")
        .header("x-amz-grant-full-control", "id=\"AK2\"")
        .sign("AK1", "SK1");
    assert_eq!(server.send(grant).await.status(), StatusCode::OK);

    let upload = request(Method::PUT, "/demo/by-bob.txt")
        .body(b"bob")
        .sign("AK2", "SK2");
    assert_eq!(server.send(upload).await.status(), StatusCode::OK);

    let delete = signed(Method::DELETE, "/demo/by-bob.txt", "AK2", "SK2");
    assert_eq!(server.send(delete).await.status(), StatusCode::NO_CONTENT);
}

// =============================================================================
// PUBLIC ACCESS
// =============================================================================

#[tokio::test]
async fn test_public_read_bucket() {
    let server = TestServer::start().await;

    let create = request(Method::PUT, "/open")
        .header("x-amz-acl", "public-read")
        .sign("AK1", "SK1");
    assert_eq!(server.send(create).await.status(), StatusCode::OK);

    let upload = request(Method::PUT, "/open/readme.txt")
        .body(b"welcome")
        .sign("AK1", "SK1");
    assert_eq!(server.send(upload).await.status(), StatusCode::OK);

    let response = server.send(anonymous(Method::GET, "/open/readme.txt")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, "welcome");

    let listing = server.send(anonymous(Method::GET, "/open")).await;
    assert_eq!(listing.status(), StatusCode::OK);
    assert!(body_string(listing).await.contains("<Key>readme.txt</Key>"));

    let write = request(Method::PUT, "/open/graffiti.txt").body(b"x").build();
    assert_denied(server.send(write).await).await;
}

#[tokio::test]
async fn test_public_object_in_private_bucket() {
    let server = TestServer::with_demo_bucket().await;

    let shared = request(Method::PUT, "/demo/shared.txt")
        .header("x-amz-acl", "public-read")
        .body(b"shared")
        .sign("AK1", "SK1");
    assert_eq!(server.send(shared).await.status(), StatusCode::OK);
    let private = request(Method::PUT, "/demo/private.txt")
        .body(b"private")
        .sign("AK1", "SK1");
    assert_eq!(server.send(private).await.status(), StatusCode::OK);

    let response = server.send(anonymous(Method::GET, "/demo/shared.txt")).await;
    assert_eq!(response.status(), StatusCode::OK);

    assert_denied(server.send(anonymous(Method::GET, "/demo/private.txt")).await).await;
    assert_denied(server.send(anonymous(Method::GET, "/demo")).await).await;
}

// =============================================================================
// BUCKETS AND ACL API
// =============================================================================

#[tokio::test]
async fn test_create_existing_bucket() {
    let server = TestServer::with_demo_bucket().await;

    let again = server.send(signed(Method::PUT, "/demo", "AK1", "SK1")).await;
    assert_eq!(again.status(), StatusCode::CONFLICT);
    assert!(body_string(again)
        .await
        .contains("<Code>BucketAlreadyOwnedByYou</Code>"));

    let invalid = server.send(signed(Method::PUT, "/No_Such", "AK1", "SK1")).await;
    assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_bucket_acl_document() {
    let server = TestServer::with_demo_bucket().await;

    let grant = request(Method::PUT, "/demo?acl")
        .header("x-amz-grant-read", "id=\"AK2\"")
        .header("x-amz-acl", "public-read")
        .sign("AK1", "SK1");
    assert_eq!(server.send(grant).await.status(), StatusCode::OK);

    let response = server.send(signed(Method::GET, "/demo?acl", "AK1", "SK1")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_string(response).await;
    assert!(body.contains("<AccessControlPolicy"));
    assert!(body.contains("<ID>AK2</ID>"));
    assert!(body.contains("<Permission>FULL_CONTROL</Permission>"));
    assert!(body.contains("AllUsers"));

    // READ does not cover reading the ACL
    assert_denied(server.send(signed(Method::GET, "/demo?acl", "AK2", "SK2")).await).await;
}

#[tokio::test]
async fn test_malformed_acl_headers_are_rejected() {
    let server = TestServer::with_demo_bucket().await;

    let unknown = request(Method::PUT, "/demo?acl")
        .header("x-amz-grant-read", "id=\"NOBODY\"")
        .sign("AK1", "SK1");
    let response = server.send(unknown).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(body_string(response).await.contains("MalformedACLError"));

    let bogus = request(Method::PUT, "/demo?acl")
        .header("x-amz-grant-everything", "id=\"AK2\"")
        .sign("AK1", "SK1");
    assert_eq!(server.send(bogus).await.status(), StatusCode::BAD_REQUEST);

    // Nothing was applied
    assert_denied(server.send(signed(Method::GET, "/demo", "AK2", "SK2")).await).await;
}

#[tokio::test]
async fn test_list_buckets_shows_visible_buckets() {
    let server = TestServer::with_demo_bucket().await;
    assert_eq!(
        server
            .send(signed(Method::PUT, "/bobs-bucket", "AK2", "SK2"))
            .await
            .status(),
        StatusCode::OK
    );

    let alice = body_string(server.send(signed(Method::GET, "/", "AK1", "SK1")).await).await;
    assert!(alice.contains("<Name>demo</Name>"));
    assert!(!alice.contains("<Name>bobs-bucket</Name>"));

    let grant = request(Method::PUT, "/demo?acl")
        .header("x-amz-grant-read", "id=\"AK2\"")
        .sign("AK1", "SK1");
    server.send(grant).await;

    let bob = body_string(server.send(signed(Method::GET, "/", "AK2", "SK2")).await).await;
    assert!(bob.contains("<Name>demo</Name>"));
    assert!(bob.contains("<Name>bobs-bucket</Name>"));

    assert_denied(server.send(anonymous(Method::GET, "/")).await).await;
}

#[tokio::test]
async fn test_delete_bucket() {
    let server = TestServer::with_demo_bucket().await;
    let upload = request(Method::PUT, "/demo/k").body(b"v").sign("AK1", "SK1");
    server.send(upload).await;

    let response = server.send(signed(Method::DELETE, "/demo", "AK1", "SK1")).await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert!(body_string(response).await.contains("<Code>BucketNotEmpty</Code>"));

    let delete = server.send(signed(Method::DELETE, "/demo/k", "AK1", "SK1")).await;
    assert_eq!(delete.status(), StatusCode::NO_CONTENT);
    let response = server.send(signed(Method::DELETE, "/demo", "AK1", "SK1")).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    // The ACL document went with it
    assert_denied(server.send(signed(Method::GET, "/demo", "AK1", "SK1")).await).await;
}

// =============================================================================
// OBJECTS AND LISTING
// =============================================================================

#[tokio::test]
async fn test_object_headers_round_trip() {
    let server = TestServer::with_demo_bucket().await;

    let upload = request(Method::PUT, "/demo/doc.txt")
        .header("content-type", "text/plain")
        .header("x-amz-meta-color", "blue")
        .body(b"content")
        .sign("AK1", "SK1");
    let response = server.send(upload).await;
    assert_eq!(response.status(), StatusCode::OK);
    let etag = response.headers()["etag"].clone();
    assert!(response.headers().contains_key("x-amz-request-id"));
    assert!(response.headers().contains_key("x-amz-id-2"));

    let head = server.send(signed(Method::HEAD, "/demo/doc.txt", "AK1", "SK1")).await;
    assert_eq!(head.status(), StatusCode::OK);
    assert_eq!(head.headers()["etag"], etag);
    assert_eq!(head.headers()["content-type"], "text/plain");
    assert_eq!(head.headers()["x-amz-meta-color"], "blue");
    assert!(head.headers().contains_key("last-modified"));
}

#[tokio::test]
async fn test_listing_with_prefix_delimiter_and_pages() {
    let server = TestServer::with_demo_bucket().await;
    for key in ["a/x", "a/y/z", "b/x"] {
        let upload = request(Method::PUT, &format!("/demo/{key}"))
            .body(key.as_bytes())
            .sign("AK1", "SK1");
        assert_eq!(server.send(upload).await.status(), StatusCode::OK);
    }

    let body = body_string(
        server
            .send(signed(Method::GET, "/demo?delimiter=%2F&prefix=a%2F", "AK1", "SK1"))
            .await,
    )
    .await;
    assert!(body.contains("<Key>a/x</Key>"));
    assert!(body.contains("<Prefix>a/y/</Prefix>"));
    assert!(!body.contains("<Key>b/x</Key>"));
    assert!(body.contains("<KeyCount>2</KeyCount>"));

    let page = body_string(
        server
            .send(signed(Method::GET, "/demo?max-keys=1", "AK1", "SK1"))
            .await,
    )
    .await;
    assert!(page.contains("<IsTruncated>true</IsTruncated>"));
    assert!(page.contains("<NextContinuationToken>"));
}

#[tokio::test]
async fn test_malformed_list_parameters_get_xml_errors() {
    let server = TestServer::with_demo_bucket().await;

    for uri in ["/demo?max-keys=abc", "/demo?max-keys=-1"] {
        let response = server.send(signed(Method::GET, uri, "AK1", "SK1")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{uri}");
        assert_eq!(response.headers()["content-type"], "application/xml");
        assert!(response.headers().contains_key("x-amz-request-id"));
        let body = body_string(response).await;
        assert!(body.contains("<Code>InvalidArgument</Code>"), "{body}");
        assert!(body.contains("<Resource>demo</Resource>"), "{body}");
    }
}

#[tokio::test]
async fn test_rejected_keys() {
    let server = TestServer::with_demo_bucket().await;

    let sidecar = server
        .send(signed(Method::GET, "/demo/file.txt.strata-meta.json", "AK1", "SK1"))
        .await;
    assert_denied(sidecar).await;

    let traversal = request(Method::PUT, "/demo/a/../../escape")
        .body(b"x")
        .sign("AK1", "SK1");
    let response = server.send(traversal).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(body_string(response).await.contains("<Code>InvalidArgument</Code>"));
}

// =============================================================================
// PRESIGNED URLS
// =============================================================================

#[tokio::test]
async fn test_presigned_get() {
    let server = TestServer::with_demo_bucket().await;
    let upload = request(Method::PUT, "/demo/report.csv")
        .body(b"a,b,c")
        .sign("AK1", "SK1");
    server.send(upload).await;

    let url = presign_url(
        &PresignRequest {
            method: Method::GET,
            host: HOST,
            path: "/demo/report.csv",
            timestamp: Utc::now(),
            expires_secs: 300,
        },
        &Credential::new("AK1", "SK1", "alice"),
        &SigningScope::default(),
    )
    .unwrap();

    let response = server.send(anonymous(Method::GET, &url)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, "a,b,c");

    let tampered = url.replace("report.csv", "other.csv");
    assert_denied(server.send(anonymous(Method::GET, &tampered)).await).await;

    let put = anonymous(Method::PUT, &url);
    assert_denied(server.send(put).await).await;
}
