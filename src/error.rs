use axum::{
    body::Body,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use thiserror::Error;
use tracing::{debug, warn};

/// `axum`-compatible error handler.
#[derive(Error)]
pub struct Error {
    status: StatusCode,
    err: anyhow::Error,
    /// Plain-text body returned to the client, if any.
    message: Option<String>,
}

impl Error {
    /// A client error whose message is echoed back as the response body.
    pub fn bad_request(err: impl Into<anyhow::Error>) -> Self {
        let err = err.into();
        Self {
            status: StatusCode::BAD_REQUEST,
            message: Some(err.to_string()),
            err,
        }
    }

    pub fn with_status(status: StatusCode, err: impl Into<anyhow::Error>) -> Self {
        Self {
            status,
            err: err.into(),
            message: None,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::with_status(StatusCode::INTERNAL_SERVER_ERROR, err)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {:?}", self.status, self.err)
    }
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.err.fmt(f)
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        // Client errors are routine for a public report endpoint.
        if self.status.is_server_error() {
            warn!("{:?}", self.err);
        } else {
            debug!("{:?}", self.err);
        }

        // N.B: Server error details never leave the process.
        match self.message {
            Some(message) => (
                self.status,
                [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
                message,
            )
                .into_response(),
            None => (self.status, Body::empty()).into_response(),
        }
    }
}
