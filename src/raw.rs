//! Dumb HTTP protocol: plain files out of the repository tree.
//!
//! Anything the smart routes do not claim falls through to here: `HEAD`,
//! `info/refs`, loose objects, packfiles. Clients cache these, so the
//! handler speaks conditional GET with an mtime-derived validator pair.

use std::ffi::OsStr;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use axum::async_trait;
use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use hyper::HeaderMap;
use time::format_description::FormatItem;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};

use crate::canned;
use crate::error::Error;
use crate::resolve;
use crate::router::{Handle, Request};
use crate::spool::FileStream;
use crate::Gateway;

/// IMF-fixdate, the only date format worth emitting in HTTP headers.
const HTTP_DATE: &[FormatItem<'static>] = format_description!(
    "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
);

pub struct Static {
    pub(crate) gateway: Arc<Gateway>,
}

#[async_trait]
impl Handle for Static {
    async fn handle(&self, request: Request) -> Response {
        serve(&self.gateway, &request).unwrap_or_else(IntoResponse::into_response)
    }
}

fn serve(gateway: &Gateway, request: &Request) -> Result<Response, Error> {
    let path = if request.captures.contains_key("working_path") {
        request.capture("working_path")
    } else {
        request.path.as_str()
    };
    let full = resolve::resolve(&gateway.options.root, path, gateway.options.follow_symlinks)?;

    let meta = fs::metadata(&full).map_err(|_| Error::NotFound)?;
    if !meta.is_file() {
        return Err(Error::NotFound);
    }

    let mtime = OffsetDateTime::from(meta.modified()?);
    let etag = format!("{:x}", mtime.unix_timestamp());
    let last_modified = mtime.format(HTTP_DATE).map_err(std::io::Error::other)?;

    let mut validators = HeaderMap::new();
    validators.insert(header::ETAG, format!("\"{etag}\"").parse()?);
    validators.insert(header::LAST_MODIFIED, last_modified.parse()?);

    if let Some(since) = request
        .headers
        .get(header::IF_MODIFIED_SINCE)
        .and_then(|v| v.to_str().ok())
    {
        if let Ok(since) = PrimitiveDateTime::parse(since, HTTP_DATE) {
            // Validators carry second resolution only.
            if since.assume_utc().unix_timestamp() >= mtime.unix_timestamp() {
                return Ok(canned::response(StatusCode::NOT_MODIFIED, validators));
            }
        }
    }
    if let Some(tags) = request
        .headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
    {
        if tags == "*" || tags.contains(&etag) {
            return Ok(canned::response(StatusCode::NOT_MODIFIED, validators));
        }
    }

    let file = fs::File::open(&full).map_err(|_| Error::NotFound)?;
    let stream = FileStream::new(file, gateway.options.buffer_size);

    let mut response = Response::new(Body::from_stream(stream));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static(content_type(&full)),
    );
    response
        .headers_mut()
        .insert(header::CONTENT_LENGTH, meta.len().into());
    response.headers_mut().extend(validators);

    Ok(response)
}

/// Content type by file extension, extended with the types git's dumb
/// protocol transfers.
fn content_type(path: &Path) -> &'static str {
    match path.extension().and_then(OsStr::to_str) {
        Some("pack") => "application/x-git-packed-objects",
        Some("idx") => "application/x-git-packed-objects-toc",
        Some("txt") | Some("md") => "text/plain",
        Some("html") | Some("htm") => "text/html",
        Some("json") => "application/json",
        _ => "application/octet-stream",
    }
}
