use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::http::header::HeaderValue;
use axum::http::{Method, Request};
use axum::Router;
use tower::ServiceExt;

use crate::{AllowAll, Authorize, Gateway, Options};

pub fn options(root: &Path) -> Options {
    Options::new(root.to_path_buf())
}

pub fn app(options: Options) -> Router {
    app_with(options, Arc::new(AllowAll))
}

pub fn app_with(options: Options, authorize: Arc<dyn Authorize>) -> Router {
    crate::router(Gateway { options, authorize }).unwrap()
}

/// Initialize a bare repository under `root`.
pub fn seed(root: &Path, name: &str) -> PathBuf {
    let repo = root.join(name);
    let status = Command::new("git")
        .args(["init", "--quiet", "--bare"])
        .arg(&repo)
        .status()
        .unwrap();
    assert!(status.success(), "git init --bare failed");

    repo
}

pub async fn get(app: &Router, path: impl ToString) -> Response {
    request(app, "GET", path, &[], Vec::new()).await
}

pub async fn request(
    app: &Router,
    method: &str,
    path: impl ToString,
    headers: &[(&str, &str)],
    body: Vec<u8>,
) -> Response {
    let mut request = Request::builder()
        .method(Method::from_bytes(method.as_bytes()).unwrap())
        .uri(path.to_string());
    for (name, value) in headers {
        request = request.header(*name, *value);
    }

    Response(
        app.clone()
            .oneshot(request.body(Body::from(body)).unwrap())
            .await
            .unwrap(),
    )
}

pub struct Response(axum::response::Response);

impl Response {
    pub fn status(&self) -> axum::http::StatusCode {
        self.0.status()
    }

    pub fn header(&self, name: &str) -> Option<&HeaderValue> {
        self.0.headers().get(name)
    }

    pub async fn body(self) -> Bytes {
        axum::body::to_bytes(self.0.into_body(), usize::MAX)
            .await
            .unwrap()
    }
}
