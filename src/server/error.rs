//! HTTP error mapping for the service endpoints

use crate::error::BgRemovalError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use axum_extra::extract::multipart::{MultipartError, MultipartRejection};
use serde::{Deserialize, Serialize};

/// Message returned when the request carries no `image` file part
pub const NO_IMAGE_MESSAGE: &str = "No image file provided. Use \"image\" field in multipart form.";

/// Message returned when the `image` part has an empty filename
pub const NO_FILE_SELECTED_MESSAGE: &str = "No file selected";

/// JSON body of every error response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
}

/// Errors surfaced by the HTTP layer
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Client input problem, reported as 400
    #[error("{0}")]
    BadRequest(String),

    /// Request body over the configured upload limit, reported as 413
    #[error("{0}")]
    PayloadTooLarge(String),

    /// Decode, model or encode failure, reported as 500
    #[error(transparent)]
    Processing(#[from] BgRemovalError),
}

impl ApiError {
    /// HTTP status for this error kind
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Processing(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Response body for this error
    #[must_use]
    pub fn to_response(&self) -> ErrorResponse {
        let mut error = self.to_string();
        if error.trim().is_empty() {
            error = "Background removal failed".to_string();
        }
        ErrorResponse {
            success: false,
            error,
        }
    }
}

impl From<MultipartRejection> for ApiError {
    fn from(_: MultipartRejection) -> Self {
        Self::BadRequest(NO_IMAGE_MESSAGE.to_string())
    }
}

impl From<MultipartError> for ApiError {
    fn from(e: MultipartError) -> Self {
        if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
            Self::PayloadTooLarge(format!("Uploaded file is too large: {}", e.body_text()))
        } else {
            Self::BadRequest(format!("Failed to read multipart body: {e}"))
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status_code(), Json(self.to_response())).into_response()
    }
}
