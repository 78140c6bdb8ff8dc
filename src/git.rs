//! Smart HTTP protocol handlers.
//!
//! Two endpoints make up the smart protocol: the service advertisement
//! (`GET /…/info/refs?service=…`) and the stateless RPC exchange
//! (`POST /…/git-upload-pack` or `/…/git-receive-pack`). Both shell out to
//! the `git` binary in `--stateless-rpc` mode and stream its output back.

use std::fmt;
use std::io::Write as _;
use std::str::FromStr;
use std::sync::Arc;

use axum::async_trait;
use axum::body::{Body, BodyDataStream};
use axum::http::header;
use axum::http::header::HeaderValue;
use axum::response::{IntoResponse, Response};
use flate2::write::GzDecoder;
use futures_util::StreamExt as _;
use tokio::process::Command;

use crate::error::Error;
use crate::process;
use crate::repo;
use crate::resolve;
use crate::router::{Handle, Request};
use crate::spool::Spooled;
use crate::{Gateway, Resolved};

/// The git services the gateway will run. Nothing else is allowed near a
/// command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Service {
    /// Server side of `clone` and `fetch`.
    UploadPack,
    /// Server side of `push`.
    ReceivePack,
}

impl Service {
    /// The git subcommand, e.g. `upload-pack`.
    pub fn subcommand(&self) -> &'static str {
        match self {
            Service::UploadPack => "upload-pack",
            Service::ReceivePack => "receive-pack",
        }
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Service::UploadPack => write!(f, "git-upload-pack"),
            Service::ReceivePack => write!(f, "git-receive-pack"),
        }
    }
}

impl FromStr for Service {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "git-upload-pack" => Ok(Service::UploadPack),
            "git-receive-pack" => Ok(Service::ReceivePack),
            other => Err(Error::UnknownService(other.to_owned())),
        }
    }
}

/// Shared preconditions of both smart endpoints: a known service, a path
/// under the root, an authorized principal and a repository that exists
/// (or was just created for a push).
async fn prepare(
    gateway: &Gateway,
    git_command: &str,
    working_path: &str,
    principal: Option<&str>,
) -> Result<Resolved, Error> {
    let service: Service = git_command.parse()?;
    let repo = resolve::resolve(
        &gateway.options.root,
        working_path,
        gateway.options.follow_symlinks,
    )?;
    if !gateway.authorize.authorize(principal, &repo, service) {
        return Err(Error::Forbidden);
    }
    let created = repo::probe(
        &gateway.options.root,
        &repo,
        service,
        gateway.options.auto_create,
    )
    .await?;

    Ok(Resolved {
        service,
        repo,
        created,
    })
}

/// `GET /…/info/refs?service=…`: the ref advertisement that convinces the
/// client it is talking to a smart server.
pub struct InfoRefs {
    pub(crate) gateway: Arc<Gateway>,
}

#[async_trait]
impl Handle for InfoRefs {
    async fn handle(&self, request: Request) -> Response {
        advertise(&self.gateway, request)
            .await
            .unwrap_or_else(IntoResponse::into_response)
    }
}

async fn advertise(gateway: &Gateway, request: Request) -> Result<Response, Error> {
    let resolved = prepare(
        gateway,
        request.capture("git_command"),
        request.capture("working_path"),
        request.principal.as_deref(),
    )
    .await?;
    let service = resolved.service;

    // The advertisement opens with a pkt-line service header and a flush
    // packet. The length prefix counts itself and every payload byte,
    // newline included; the client reads these as binary counts, so an
    // uncounted byte corrupts the handshake.
    let mut spool = Spooled::new(gateway.options.buffer_size);
    let line = format!("# service={service}\n");
    write!(&mut spool, "{:04x}{}0000", line.len() + 4, line)?;

    let mut cmd = Command::new("git");
    cmd.arg(service.subcommand())
        .arg("--stateless-rpc")
        .arg("--advertise-refs")
        .arg(&resolved.repo);

    let exit = process::run(cmd, None::<tokio::io::Empty>, &mut spool)
        .await
        .map_err(|_| Error::ExecutionFailed)?;
    if !exit.success() {
        tracing::error!(
            "git {} --advertise-refs: {}",
            service.subcommand(),
            exit.stderr_lossy().trim_end()
        );
        return Err(Error::ExecutionFailed);
    }

    let length = spool.len()?;
    let stream = spool.into_stream(gateway.options.buffer_size)?;
    let mut response = Response::new(Body::from_stream(stream));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        format!("application/x-{service}-advertisement").parse()?,
    );
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    response
        .headers_mut()
        .insert(header::CONTENT_LENGTH, length.into());

    Ok(response)
}

/// `POST /…/git-upload-pack` and `POST /…/git-receive-pack`: one full
/// negotiation-and-pack exchange per request.
pub struct Rpc {
    pub(crate) gateway: Arc<Gateway>,
}

#[async_trait]
impl Handle for Rpc {
    async fn handle(&self, request: Request) -> Response {
        rpc(&self.gateway, request)
            .await
            .unwrap_or_else(IntoResponse::into_response)
    }
}

async fn rpc(gateway: &Gateway, request: Request) -> Result<Response, Error> {
    let resolved = prepare(
        gateway,
        request.capture("git_command"),
        request.capture("working_path"),
        request.principal.as_deref(),
    )
    .await?;
    let service = resolved.service;

    // A still-chunked body means no front-end de-chunked the request;
    // this layer does not speak chunked transfer coding.
    if request.headers.contains_key(header::TRANSFER_ENCODING) {
        return Err(Error::ChunkedBody);
    }

    let length = request
        .headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(0)
        .max(0) as u64;

    // Whether the request body is compressed.
    let gzip = matches!(
        request.headers.get(header::CONTENT_ENCODING).map(|v| v.to_str()),
        Some(Ok("gzip"))
    );

    let stdin = if length > 0 {
        let mut spool = Spooled::new(gateway.options.buffer_size);
        ingest(request.body.into_data_stream(), length, gzip, &mut spool).await?;
        Some(spool.into_reader()?)
    } else {
        None
    };

    let mut out = Spooled::new(gateway.options.buffer_size);
    let mut cmd = Command::new("git");
    cmd.arg(service.subcommand())
        .arg("--stateless-rpc")
        .arg(&resolved.repo);

    let exit = process::run(cmd, stdin, &mut out)
        .await
        .map_err(|_| Error::ExecutionFailed)?;
    if !exit.success() {
        tracing::error!(
            "git {}: exited with {}: {}",
            service.subcommand(),
            exit.status,
            exit.stderr_lossy().trim_end()
        );
        return Err(Error::ExecutionFailed);
    }

    if service == Service::ReceivePack {
        update_server_info(&resolved).await;
    }

    let length = out.len()?;
    let stream = out.into_stream(gateway.options.buffer_size)?;
    let mut response = Response::new(Body::from_stream(stream));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        format!("application/x-{service}-result").parse()?,
    );
    response
        .headers_mut()
        .insert(header::CONTENT_LENGTH, length.into());

    Ok(response)
}

/// Copy the first `length` body bytes into the spool, inflating on the
/// way when the client compressed the body.
async fn ingest(
    mut body: BodyDataStream,
    length: u64,
    gzip: bool,
    spool: &mut Spooled,
) -> Result<(), Error> {
    let mut remaining = length;
    if gzip {
        let mut decoder = GzDecoder::new(&mut *spool);
        copy_body(&mut body, &mut remaining, &mut decoder).await?;
        decoder.finish()?;
    } else {
        copy_body(&mut body, &mut remaining, spool).await?;
    }
    Ok(())
}

async fn copy_body<W: std::io::Write>(
    body: &mut BodyDataStream,
    remaining: &mut u64,
    sink: &mut W,
) -> Result<(), Error> {
    while *remaining > 0 {
        let Some(chunk) = body.next().await else {
            break;
        };
        let chunk = chunk.map_err(std::io::Error::other)?;
        let take = chunk.len().min(*remaining as usize);
        sink.write_all(&chunk[..take])?;
        *remaining -= take as u64;
    }
    Ok(())
}

/// Refresh the info files the dumb protocol reads. Pre-1.7 clients fetch
/// over plain files and rely on these being current after a push; a
/// failure is worth a log line but not a failed push.
async fn update_server_info(resolved: &Resolved) {
    let mut cmd = Command::new("git");
    cmd.arg("--git-dir").arg(&resolved.repo).arg("update-server-info");

    match process::call(cmd).await {
        Ok(exit) if exit.success() => {}
        Ok(exit) => tracing::warn!(
            "git update-server-info {}: {}",
            resolved.repo.display(),
            exit.stderr_lossy().trim_end()
        ),
        Err(err) => tracing::warn!(
            "git update-server-info {}: {}",
            resolved.repo.display(),
            err
        ),
    }
}

#[cfg(test)]
mod routes {
    use axum::http::StatusCode;
    use pretty_assertions::assert_eq;

    use crate::repo;
    use crate::test::{self, get, request};

    #[tokio::test]
    async fn test_upload_pack_advertisement() {
        let tmp = tempfile::tempdir().unwrap();
        test::seed(tmp.path(), "repo.git");
        let app = test::app(test::options(tmp.path()));

        let response = get(&app, "/repo.git/info/refs?service=git-upload-pack").await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.header("Content-Type").unwrap(),
            "application/x-git-upload-pack-advertisement"
        );
        assert_eq!(response.header("Cache-Control").unwrap(), "no-cache");

        let body = response.body().await;
        assert!(body.starts_with(b"001e# service=git-upload-pack\n0000"));
    }

    #[tokio::test]
    async fn test_receive_pack_advertisement() {
        let tmp = tempfile::tempdir().unwrap();
        test::seed(tmp.path(), "repo.git");
        let app = test::app(test::options(tmp.path()));

        let response = get(&app, "/repo.git/info/refs?service=git-receive-pack").await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.header("Content-Type").unwrap(),
            "application/x-git-receive-pack-advertisement"
        );

        let body = response.body().await;
        assert!(body.starts_with(b"001f# service=git-receive-pack\n0000"));
    }

    #[tokio::test]
    async fn test_advertisement_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        test::seed(tmp.path(), "repo.git");
        let app = test::app(test::options(tmp.path()));

        let first = get(&app, "/repo.git/info/refs?service=git-upload-pack")
            .await
            .body()
            .await;
        let second = get(&app, "/repo.git/info/refs?service=git-upload-pack")
            .await
            .body()
            .await;

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_unknown_service_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        test::seed(tmp.path(), "repo.git");
        let app = test::app(test::options(tmp.path()));

        let response = get(&app, "/repo.git/info/refs?service=git-bogus").await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_missing_repository_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let app = test::app(test::options(tmp.path()));

        let response = get(&app, "/absent.git/info/refs?service=git-upload-pack").await;

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_traversal_is_short_circuited() {
        let tmp = tempfile::tempdir().unwrap();
        let app = test::app(test::options(tmp.path()));

        let response = get(&app, "/../outside.git/info/refs?service=git-upload-pack").await;

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_chunked_rpc_is_not_implemented() {
        let tmp = tempfile::tempdir().unwrap();
        test::seed(tmp.path(), "repo.git");
        let app = test::app(test::options(tmp.path()));

        let response = request(
            &app,
            "POST",
            "/repo.git/git-upload-pack",
            &[("Transfer-Encoding", "chunked")],
            Vec::new(),
        )
        .await;

        assert_eq!(response.status(), StatusCode::NOT_IMPLEMENTED);
    }

    #[tokio::test]
    async fn test_push_to_new_path_creates_repository() {
        let tmp = tempfile::tempdir().unwrap();
        let mut options = test::options(tmp.path());
        options.auto_create = true;
        let app = test::app(options);

        // An empty command list: just a flush packet.
        let response = request(
            &app,
            "POST",
            "/new.git/git-receive-pack",
            &[("Content-Length", "4")],
            b"0000".to_vec(),
        )
        .await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.header("Content-Type").unwrap(),
            "application/x-git-receive-pack-result"
        );
        assert!(repo::is_repository(&tmp.path().join("new.git")));
    }

    #[tokio::test]
    async fn test_auto_create_is_push_only() {
        let tmp = tempfile::tempdir().unwrap();
        let mut options = test::options(tmp.path());
        options.auto_create = true;
        let app = test::app(options);

        let response = get(&app, "/new.git/info/refs?service=git-upload-pack").await;

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(!tmp.path().join("new.git").exists());
    }

    #[tokio::test]
    async fn test_uri_marker_rebases_the_path() {
        let tmp = tempfile::tempdir().unwrap();
        test::seed(tmp.path(), "proj.git");
        let mut options = test::options(tmp.path());
        options.uri_marker = Some("repos".to_owned());
        let app = test::app(options);

        let response = get(
            &app,
            "/some/decoration/repos/proj.git/info/refs?service=git-upload-pack",
        )
        .await;

        assert_eq!(response.status(), StatusCode::OK);
        let body = response.body().await;
        assert!(body.starts_with(b"001e# service=git-upload-pack\n0000"));
    }

    #[tokio::test]
    async fn test_method_mismatch_advertises_alternatives() {
        let tmp = tempfile::tempdir().unwrap();
        test::seed(tmp.path(), "repo.git");
        let app = test::app(test::options(tmp.path()));

        let response = request(
            &app,
            "PUT",
            "/repo.git/info/refs?service=git-upload-pack",
            &[],
            Vec::new(),
        )
        .await;

        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(response.header("Allow").unwrap(), "GET, HEAD");
    }
}
