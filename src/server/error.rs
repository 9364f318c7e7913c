//! API error handling
//!
//! Maps pipeline failures onto HTTP responses of the form `{ "error": <message> }`.

use crate::error::{BgReplaceError, ErrorKind};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

/// API error type
#[derive(Debug)]
pub enum ApiError {
    /// Caller-correctable problem; the message is returned verbatim
    BadRequest(String),
    /// Processing failure; `message` is generic, `detail` is only logged
    InternalError { message: String, detail: String },
}

impl ApiError {
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::InternalError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match self {
            Self::BadRequest(msg) => msg,
            Self::InternalError { message, detail } => {
                tracing::error!(detail = %detail, "Request failed: {}", message);
                message
            },
        };

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

impl From<BgReplaceError> for ApiError {
    fn from(err: BgReplaceError) -> Self {
        match err.kind() {
            ErrorKind::Validation => Self::BadRequest(err.public_message()),
            ErrorKind::UpstreamTool | ErrorKind::ImageCodec | ErrorKind::Internal => {
                Self::InternalError {
                    message: err.public_message(),
                    detail: err.to_string(),
                }
            },
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
