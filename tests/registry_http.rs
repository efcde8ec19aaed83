//! HTTP-level behaviour of `RegistryClient` against a local registry

use axum::Router;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use docker_image_copier::image::manifest::media_types;
use docker_image_copier::registry::{PUSH_ACTIONS, Registry, RegistryClient, RegistryClientBuilder};
use docker_image_copier::{Digest, Logger, RegistryError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

const MANIFEST: &[u8] = br#"{"schemaVersion":2,"mediaType":"application/vnd.oci.image.manifest.v1+json","config":{"mediaType":"application/vnd.oci.image.config.v1+json","digest":"sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855","size":0},"layers":[]}"#;
const UPLOAD_LOCATION: &str = "/v2/app/blobs/uploads/session-1?_state=opaque";

#[derive(Clone, Copy)]
enum AuthMode {
    Anonymous,
    /// Only the n-th issued token is accepted
    AcceptToken(usize),
    RejectAll,
}

#[derive(Clone)]
struct Fixture {
    base: Arc<Mutex<String>>,
    auth: AuthMode,
    tokens_issued: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<String>>>,
    uploads: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl Fixture {
    fn new(auth: AuthMode) -> Self {
        Self {
            base: Arc::new(Mutex::new(String::new())),
            auth,
            tokens_issued: Arc::new(AtomicUsize::new(0)),
            requests: Arc::new(Mutex::new(Vec::new())),
            uploads: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn authorized(&self, authorization: Option<&str>) -> bool {
        match self.auth {
            AuthMode::Anonymous => true,
            AuthMode::AcceptToken(n) => authorization == Some(format!("Bearer token-{}", n).as_str()),
            AuthMode::RejectAll => false,
        }
    }

    fn challenge(&self) -> Response {
        let base = self.base.lock().unwrap().clone();
        Response::builder()
            .status(StatusCode::UNAUTHORIZED)
            .header(
                header::WWW_AUTHENTICATE,
                format!(r#"Bearer realm="{}/token",service="fixture""#, base),
            )
            .body(Body::from(r#"{"errors":[{"code":"UNAUTHORIZED"}]}"#))
            .unwrap()
    }

    /// Requests served so far whose "METHOD uri" line starts with `prefix`
    fn count(&self, prefix: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|line| line.starts_with(prefix))
            .count()
    }

    fn registry_requests(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|line| !line.ends_with(" /v2/") && !line.contains(" /token"))
            .cloned()
            .collect()
    }
}

async fn handle(State(fx): State<Fixture>, request: Request) -> Response {
    let method = request.method().to_string();
    let uri = request.uri().clone();
    let authorization = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let body = axum::body::to_bytes(request.into_body(), usize::MAX)
        .await
        .unwrap();
    fx.requests
        .lock()
        .unwrap()
        .push(format!("{} {}", method, uri));

    match uri.path() {
        "/token" => {
            let n = fx.tokens_issued.fetch_add(1, Ordering::SeqCst) + 1;
            return axum::Json(serde_json::json!({ "token": format!("token-{}", n) }))
                .into_response();
        }
        "/v2/" => {
            return match fx.auth {
                AuthMode::Anonymous => StatusCode::OK.into_response(),
                _ => fx.challenge(),
            };
        }
        _ => {}
    }

    if !fx.authorized(authorization.as_deref()) {
        return fx.challenge();
    }

    match (method.as_str(), uri.path()) {
        ("GET", "/v2/app/manifests/v1") => Response::builder()
            .header(header::CONTENT_TYPE, media_types::OCI_MANIFEST)
            .body(Body::from(MANIFEST))
            .unwrap(),
        ("POST", "/v2/app/blobs/uploads/") => Response::builder()
            .status(StatusCode::ACCEPTED)
            .header(header::LOCATION, UPLOAD_LOCATION)
            .body(Body::empty())
            .unwrap(),
        ("PUT", "/v2/app/blobs/uploads/session-1") => {
            let query: HashMap<String, String> =
                url::form_urlencoded::parse(uri.query().unwrap_or_default().as_bytes())
                    .into_owned()
                    .collect();
            match query.get("digest") {
                Some(digest) if query.get("_state").map(String::as_str) == Some("opaque") => {
                    fx.uploads
                        .lock()
                        .unwrap()
                        .insert(digest.clone(), body.to_vec());
                    StatusCode::CREATED.into_response()
                }
                _ => StatusCode::BAD_REQUEST.into_response(),
            }
        }
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn start_registry(fx: Fixture) -> (JoinHandle<()>, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let host = listener.local_addr().unwrap().to_string();
    *fx.base.lock().unwrap() = format!("http://{}", host);

    let app = Router::new().fallback(handle).with_state(fx);
    let server = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (server, host)
}

fn client(host: &str) -> RegistryClient {
    RegistryClientBuilder::new(host)
        .with_actions(PUSH_ACTIONS)
        .with_output(Logger::new_quiet())
        .build()
        .unwrap()
}

#[tokio::test]
async fn rejected_token_is_refreshed_once_and_request_replayed() {
    let fx = Fixture::new(AuthMode::AcceptToken(2));
    let (server, host) = start_registry(fx.clone()).await;

    let manifest = client(&host).get_manifest("app", "v1").await.unwrap();

    assert_eq!(&manifest.bytes[..], MANIFEST);
    assert_eq!(manifest.media_type, media_types::OCI_MANIFEST);
    assert_eq!(fx.tokens_issued.load(Ordering::SeqCst), 2);
    assert_eq!(fx.count("GET /v2/app/manifests/v1"), 2);

    let requested_scope = fx
        .requests
        .lock()
        .unwrap()
        .iter()
        .any(|line| line.contains("scope=repository%3Aapp%3Apull%2Cpush"));
    assert!(requested_scope);
    server.abort();
}

#[tokio::test]
async fn second_rejection_is_auth_required() {
    let fx = Fixture::new(AuthMode::RejectAll);
    let (server, host) = start_registry(fx.clone()).await;

    let err = client(&host).get_manifest("app", "v1").await.unwrap_err();

    assert!(matches!(err, RegistryError::AuthRequired(_)), "got {:?}", err);
    assert_eq!(fx.count("GET /v2/app/manifests/v1"), 2);
    assert_eq!(fx.tokens_issued.load(Ordering::SeqCst), 2);
    server.abort();
}

#[tokio::test]
async fn blob_upload_opens_session_then_puts_with_digest() {
    let fx = Fixture::new(AuthMode::Anonymous);
    let (server, host) = start_registry(fx.clone()).await;

    let content = b"layer content uploaded in one piece".to_vec();
    let digest = Digest::sha256(&content);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("blob");
    std::fs::write(&path, &content).unwrap();

    client(&host)
        .put_blob("app", &digest, content.len() as u64, &path)
        .await
        .unwrap();

    let requests = fx.registry_requests();
    assert_eq!(requests.len(), 2, "{:?}", requests);
    assert_eq!(requests[0], "POST /v2/app/blobs/uploads/");
    assert!(
        requests[1].starts_with("PUT /v2/app/blobs/uploads/session-1?_state=opaque&digest="),
        "{}",
        requests[1]
    );
    assert_eq!(
        fx.uploads.lock().unwrap().get(&digest.to_string()),
        Some(&content)
    );
    server.abort();
}
