//! Endpoint handlers

use super::error::{ApiError, NO_FILE_SELECTED_MESSAGE, NO_IMAGE_MESSAGE};
use super::AppState;
use crate::config::SERVICE_NAME;
use crate::models::MODEL_NAME;
use axum::{
    extract::State,
    http::header,
    response::{IntoResponse, Response},
    Json,
};
use axum_extra::extract::{multipart::MultipartRejection, Multipart};
use serde::{Deserialize, Serialize};
use tracing::{info, warn, Instrument, Span};
use uuid::Uuid;

/// Form field carrying the uploaded image
pub const IMAGE_FIELD: &str = "image";

/// Filename advertised for the returned PNG
pub const OUTPUT_FILENAME: &str = "removed_bg.png";

/// Body of `GET /health`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub model: String,
    pub model_path: String,
}

/// File part taken from the multipart form
#[derive(Debug)]
struct ImageUpload {
    filename: String,
    data: Vec<u8>,
}

/// GET /health
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: SERVICE_NAME.to_string(),
        model: MODEL_NAME.to_string(),
        model_path: state.config.model_dir().display().to_string(),
    })
}

/// POST /remove-bg
///
/// Reads the `image` file part, removes its background and answers with the
/// cut-out as an inline PNG.
pub async fn remove_background(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Response, ApiError> {
    let request_id = Uuid::new_v4();
    let span = tracing::info_span!(
        "remove_bg",
        %request_id,
        filename = tracing::field::Empty,
        input_bytes = tracing::field::Empty
    );

    async move {
        let result = process_upload(state, multipart).await;
        match &result {
            Ok(_) => info!("Background removed"),
            Err(e @ (ApiError::BadRequest(_) | ApiError::PayloadTooLarge(_))) => {
                warn!(error = %e, "Rejected upload");
            },
            Err(e @ ApiError::Processing(_)) => tracing::error!(error = %e, "Background removal failed"),
        }
        result
    }
    .instrument(span)
    .await
}

async fn process_upload(
    state: AppState,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Response, ApiError> {
    let upload = read_image_upload(multipart?).await?;

    let span = Span::current();
    span.record("filename", upload.filename.as_str());
    span.record("input_bytes", upload.data.len());

    let png = crate::remove_background_from_bytes(&state.processor, upload.data).await?;

    Ok((
        [
            (header::CONTENT_TYPE, "image/png".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("inline; filename=\"{OUTPUT_FILENAME}\""),
            ),
        ],
        png,
    )
        .into_response())
}

/// Find the first `image` part that is a file
///
/// Parts named `image` without a `filename` parameter are plain form values
/// and are skipped.
async fn read_image_upload(mut multipart: Multipart) -> Result<ImageUpload, ApiError> {
    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some(IMAGE_FIELD) {
            continue;
        }
        let Some(filename) = field.file_name().map(str::to_string) else {
            continue;
        };
        if filename.is_empty() {
            return Err(ApiError::BadRequest(NO_FILE_SELECTED_MESSAGE.to_string()));
        }

        let data = field.bytes().await?.to_vec();
        return Ok(ImageUpload { filename, data });
    }

    Err(ApiError::BadRequest(NO_IMAGE_MESSAGE.to_string()))
}
