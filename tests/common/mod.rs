//! Shared fixture: a tempdir-rooted dynamic directory plus the full app
//! (runtime + router) driven in-process.

use std::path::Path;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{Method, Request, Response, StatusCode};
use axum::Router;
use tower::ServiceExt;

use fluxion::config::FluxionConfig;
use fluxion::runtime::FileRuntime;

pub struct TestServer {
    // Held for its Drop; the dynamic directory lives here.
    pub dir: tempfile::TempDir,
    pub runtime: Arc<FileRuntime>,
    pub app: Router,
}

impl TestServer {
    pub fn write(&self, rel: &str, content: &str) {
        write_file(self.dir.path(), rel, content);
    }

    pub async fn request(&self, method: Method, path: &str, body: &[u8]) -> Response<Body> {
        let request = Request::builder()
            .method(method)
            .uri(path)
            .body(Body::from(body.to_vec()))
            .unwrap();
        self.app.clone().oneshot(request).await.unwrap()
    }

    pub async fn get(&self, path: &str) -> Response<Body> {
        self.request(Method::GET, path, b"").await
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.runtime.close();
    }
}

pub fn write_file(root: &Path, rel: &str, content: &str) {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, content).unwrap();
}

pub async fn serve(
    files: &[(&str, &str)],
    configure: impl FnOnce(&mut FluxionConfig),
) -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    for (rel, content) in files {
        write_file(dir.path(), rel, content);
    }
    let mut config = FluxionConfig::new(dir.path());
    configure(&mut config);
    let max_request_bytes = config.max_request_bytes;
    let runtime = FileRuntime::new(&config).await.unwrap();
    let app = fluxion::build_app(runtime.clone(), max_request_bytes);
    TestServer { dir, runtime, app }
}

pub async fn body_string(response: Response<Body>) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8_lossy(&bytes).into_owned()
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

pub fn assert_status(response: &Response<Body>, expected: StatusCode) {
    assert_eq!(response.status(), expected);
}
