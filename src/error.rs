use std::io;

use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};

use crate::canned;

/// Errors relating to the HTTP gateway.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// The request path could not be decoded.
    #[error("request path is not valid UTF-8")]
    BadRequest,

    /// The requested service is not a known git command.
    #[error("unknown git service '{0}'")]
    UnknownService(String),

    /// The resolved path escapes the served root, the principal lacks
    /// access, or auto-creation would nest repositories.
    #[error("forbidden")]
    Forbidden,

    /// No repository or file at the resolved path.
    #[error("not found")]
    NotFound,

    /// The git subprocess failed to spawn, copy or exit cleanly.
    #[error("git execution failed")]
    ExecutionFailed,

    /// Chunked request bodies must be decoded by the front-end.
    #[error("chunked request bodies are not supported")]
    ChunkedBody,

    /// HeaderValue error.
    #[error(transparent)]
    InvalidHeaderValue(#[from] axum::http::header::InvalidHeaderValue),
}

impl Error {
    pub fn status(&self) -> StatusCode {
        match self {
            Error::BadRequest | Error::UnknownService(_) => StatusCode::BAD_REQUEST,
            Error::Forbidden => StatusCode::FORBIDDEN,
            Error::NotFound => StatusCode::NOT_FOUND,
            Error::ExecutionFailed => StatusCode::EXPECTATION_FAILED,
            Error::ChunkedBody => StatusCode::NOT_IMPLEMENTED,
            Error::Io(_) | Error::InvalidHeaderValue(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        match &self {
            Error::Io(_) | Error::ExecutionFailed | Error::InvalidHeaderValue(_) => {
                tracing::error!("{}", self)
            }
            _ => tracing::debug!("{}", self),
        }
        canned::response(self.status(), HeaderMap::new())
    }
}
