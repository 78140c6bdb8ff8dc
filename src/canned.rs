//! Canned HTTP responses.
//!
//! Every error the gateway emits goes through here: a bare status line, a
//! `text/plain` content type and an empty body. Git clients probe the status
//! code only; a payload would be misread as protocol data.

use axum::body::Body;
use axum::http::header::{HeaderValue, ALLOW, CONTENT_TYPE};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;

/// An empty `text/plain` response with the given status. Caller-supplied
/// headers are applied on top of the content type.
pub fn response(status: StatusCode, headers: HeaderMap) -> Response {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response.headers_mut().extend(headers);
    response
}

/// A `405 Method Not Allowed` advertising the methods the matched routes
/// would have accepted.
pub fn method_not_allowed<'a>(allowed: impl Iterator<Item = &'a str>) -> Response {
    let mut headers = HeaderMap::new();
    let list = allowed.collect::<Vec<_>>().join(", ");
    if let Ok(value) = HeaderValue::from_str(&list) {
        headers.insert(ALLOW, value);
    }
    response(StatusCode::METHOD_NOT_ALLOWED, headers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_canned_response_is_empty_text_plain() {
        let response = response(StatusCode::NOT_FOUND, HeaderMap::new());

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers().get(CONTENT_TYPE).unwrap(), "text/plain");
    }

    #[test]
    fn test_method_not_allowed_lists_methods() {
        let response = method_not_allowed(["GET", "HEAD"].into_iter());

        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(response.headers().get(ALLOW).unwrap(), "GET, HEAD");
    }
}
