pub mod error;
pub mod router;

mod canned;
mod git;
mod process;
mod raw;
mod repo;
mod resolve;
mod spool;
#[cfg(test)]
mod test;
mod tracing_extra;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::str;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use axum::body::{Body, HttpBody};
use axum::extract::State;
use axum::http::{Request, Response};
use axum::middleware;
use axum::response::{IntoResponse as _, Response as AxumResponse};
use percent_encoding::percent_decode_str;
use tower_http::trace::TraceLayer;
use tracing::Span;

use tracing_extra::{tracing_middleware, RequestId, TracingInfo};

pub use git::Service;

/// Default chunk size for streaming copies.
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct Options {
    pub listen: SocketAddr,
    /// The only directory tree repositories are served from.
    pub root: PathBuf,
    /// Virtual path segment separating a decorative URL prefix from the
    /// repository-relative path.
    pub uri_marker: Option<String>,
    /// Create a bare repository on first push to a path that has none.
    pub auto_create: bool,
    pub buffer_size: usize,
    /// Canonicalize existing paths before the containment check. Off by
    /// default: syntactic resolution only, symlinks inside the root are
    /// served as-is.
    pub follow_symlinks: bool,
}

impl Options {
    pub fn new(root: PathBuf) -> Self {
        Self {
            listen: ([0, 0, 0, 0], 8080).into(),
            root,
            uri_marker: None,
            auto_create: false,
            buffer_size: DEFAULT_BUFFER_SIZE,
            follow_symlinks: false,
        }
    }
}

/// Authorization predicate consulted once per smart request. The gateway
/// never authenticates anyone; it hands over whatever principal the
/// front-end established and lets the predicate decide.
pub trait Authorize: Send + Sync {
    fn authorize(&self, principal: Option<&str>, repo: &Path, service: Service) -> bool;
}

/// The default predicate: everyone may do everything.
pub struct AllowAll;

impl Authorize for AllowAll {
    fn authorize(&self, _principal: Option<&str>, _repo: &Path, _service: Service) -> bool {
        true
    }
}

/// Immutable per-process state shared by all handlers.
pub struct Gateway {
    pub options: Options,
    pub authorize: Arc<dyn Authorize>,
}

/// A request that passed dispatch, path resolution and the repository
/// probe.
pub struct Resolved {
    pub service: Service,
    pub repo: PathBuf,
    pub created: bool,
}

/// Run the server.
pub async fn run(mut options: Options) -> anyhow::Result<()> {
    let git_version = Command::new("git")
        .arg("version")
        .output()
        .context("'git' command must be available")?
        .stdout;

    tracing::info!("{}", str::from_utf8(&git_version)?.trim());

    options.root = options
        .root
        .canonicalize()
        .context("repository root must exist")?;

    let listen = options.listen;

    tracing::info!("listening on http://{}", listen);
    tracing::info!("serving repositories under {}", options.root.display());

    let request_id = RequestId::new();

    let app = router(Gateway {
        options,
        authorize: Arc::new(AllowAll),
    })?
    .layer(middleware::from_fn(tracing_middleware))
    .layer(
        TraceLayer::new_for_http()
            .make_span_with(move |_request: &Request<Body>| {
                tracing::info_span!("request", id = %request_id.clone().next())
            })
            .on_response(
                |response: &Response<Body>, latency: Duration, _span: &Span| {
                    if let Some(info) = response.extensions().get::<TracingInfo>() {
                        tracing::info!(
                            "{} \"{} {} {:?}\" {} {:?} {}",
                            info.connect_info.0,
                            info.method,
                            info.uri,
                            info.version,
                            response.status(),
                            latency,
                            response
                                .body()
                                .size_hint()
                                .exact()
                                .map(|n| n.to_string())
                                .unwrap_or("0".to_string()),
                        );
                    }
                },
            ),
    )
    .into_make_service_with_connect_info::<SocketAddr>();

    axum_server::bind(listen)
        .serve(app)
        .await
        .map_err(anyhow::Error::from)
}

/// Assemble the application: the gateway's route table behind a fallback
/// that converts every incoming request into the gateway's own context.
pub fn router(gateway: Gateway) -> anyhow::Result<axum::Router> {
    let routes = routes(Arc::new(gateway))?;

    Ok(axum::Router::new()
        .fallback(dispatch)
        .with_state(Arc::new(routes)))
}

/// The three smart-HTTP routes, most specific first; everything else
/// falls through to static file serving.
fn routes(gateway: Arc<Gateway>) -> Result<router::Router, regex::Error> {
    use axum::http::Method;
    use router::Route;

    let marker = match gateway.options.uri_marker.as_deref() {
        Some(marker) if !marker.is_empty() => {
            format!("(?P<decorative_path>.*?)(?:/{})", regex::escape(marker))
        }
        _ => String::new(),
    };
    let info_refs = Arc::new(git::InfoRefs {
        gateway: gateway.clone(),
    });
    let rpc = Arc::new(git::Rpc {
        gateway: gateway.clone(),
    });
    let files = Arc::new(raw::Static { gateway });

    Ok(router::Router::new()
        .route(
            Route::new(&format!(
                r"^{marker}(?P<working_path>.*?)/info/refs\?.*?service=(?P<git_command>git-[^&]+).*$"
            ))?
            .on(Method::GET, info_refs.clone())
            .on(Method::HEAD, info_refs),
        )
        .route(
            // Greedy on purpose: of several `/git-…` segments, the last
            // one is the command.
            Route::new(&format!(
                r"^{marker}(?P<working_path>.*)/(?P<git_command>git-[^/]+)$"
            ))?
            .on(Method::POST, rpc),
        )
        .route(
            Route::new(&format!(r"^{marker}(?P<working_path>.*)$"))?
                .on(Method::GET, files.clone())
                .on(Method::HEAD, files),
        ))
}

async fn dispatch(
    State(routes): State<Arc<router::Router>>,
    request: axum::extract::Request,
) -> AxumResponse {
    let (parts, body) = request.into_parts();

    let path = match percent_decode_str(parts.uri.path()).decode_utf8() {
        Ok(path) => path.into_owned(),
        Err(_) => return error::Error::BadRequest.into_response(),
    };
    let query = parts.uri.query().unwrap_or_default().to_owned();
    let principal = parts
        .headers
        .get("remote-user")
        .and_then(|v| v.to_str().ok())
        .map(ToOwned::to_owned);

    routes
        .dispatch(router::Request {
            method: parts.method,
            path,
            query,
            headers: parts.headers,
            body,
            principal,
            captures: HashMap::new(),
        })
        .await
}

pub mod logger {
    use tracing::dispatcher::Dispatch;

    pub fn init() -> Result<(), tracing::subscriber::SetGlobalDefaultError> {
        tracing::dispatcher::set_global_default(Dispatch::new(subscriber()))
    }

    #[cfg(feature = "logfmt")]
    pub fn subscriber() -> impl tracing::Subscriber {
        use tracing_subscriber::layer::SubscriberExt as _;
        use tracing_subscriber::EnvFilter;

        tracing_subscriber::Registry::default()
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
            .with(tracing_logfmt::layer())
    }

    #[cfg(not(feature = "logfmt"))]
    pub fn subscriber() -> impl tracing::Subscriber {
        tracing_subscriber::FmtSubscriber::builder()
            .with_target(false)
            .with_max_level(tracing::Level::DEBUG)
            .finish()
    }
}

#[cfg(test)]
mod routes_test {
    use std::fs;
    use std::path::Path;
    use std::sync::Arc;

    use axum::http::StatusCode;
    use pretty_assertions::assert_eq;

    use crate::test::{self, get, request};
    use crate::{AllowAll, Authorize, Service};

    #[tokio::test]
    async fn test_invalid_route_returns_404() {
        let tmp = tempfile::tempdir().unwrap();
        let app = test::app(test::options(tmp.path()));

        let response = get(&app, "/aa/a").await;

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_head_requests_are_routed() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("hello.txt"), "hi").unwrap();
        let app = test::app(test::options(tmp.path()));

        let response = request(&app, "HEAD", "/hello.txt", &[], Vec::new()).await;

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_denied_principal_is_forbidden() {
        struct PushersOnly;

        impl Authorize for PushersOnly {
            fn authorize(&self, principal: Option<&str>, _repo: &Path, _service: Service) -> bool {
                principal == Some("alice")
            }
        }

        let tmp = tempfile::tempdir().unwrap();
        test::seed(tmp.path(), "repo.git");
        let app = test::app_with(test::options(tmp.path()), Arc::new(PushersOnly));

        let response = get(&app, "/repo.git/info/refs?service=git-upload-pack").await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = request(
            &app,
            "GET",
            "/repo.git/info/refs?service=git-upload-pack",
            &[("Remote-User", "alice")],
            Vec::new(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_non_utf8_escape_is_a_bad_request() {
        let tmp = tempfile::tempdir().unwrap();
        let app = test::app(test::options(tmp.path()));

        let response = get(&app, "/%ff%fe").await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_allow_all_is_the_default() {
        assert!(AllowAll.authorize(None, Path::new("/srv/git/x"), Service::ReceivePack));
    }
}
