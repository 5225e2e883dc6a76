#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::cast_possible_truncation)]

//! # rebag-ml-service
//!
//! HTTP microservice that removes the background of uploaded images with the
//! U2Net salient-object model, returning a transparent PNG.
//!
//! ## Endpoints
//!
//! - `GET /health`: liveness, reports service name, model and model directory
//! - `POST /remove-bg`: multipart field `image`, answers with `image/png`
//!
//! ## Feature Flags
//!
//! - `onnx` (default): ONNX Runtime backend with CUDA / `CoreML` acceleration
//! - `tract` (default): pure Rust backend
//! - `cli` (default): the service binary, argument parsing and log output
//! - `tracing-json`: JSON log format
//!
//! ## Library Usage
//!
//! ```rust,no_run
//! use rebag_ml_service::{
//!     create_app, AppState, BackgroundRemovalProcessor, ModelDownloader, ModelStore,
//!     ServiceConfig,
//! };
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = ServiceConfig::builder().model_dir("./model").build()?;
//!
//! // Fetch u2net.onnx if it is not there yet
//! let store = ModelStore::from_config(&config);
//! ModelDownloader::new()?.ensure_model(&store, &config, false).await?;
//!
//! let processor = BackgroundRemovalProcessor::new(&config)?;
//! let app = create_app(AppState::new(config, processor));
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:5050").await?;
//! axum::serve(listener, app).await?;
//! # Ok(())
//! # }
//! ```

pub mod backends;
#[cfg(feature = "cli")]
pub mod cli;
pub mod config;
pub mod download;
pub mod error;
pub mod inference;
pub mod models;
pub mod processor;
pub mod server;
#[cfg(feature = "cli")]
pub mod tracing_config;
pub mod types;
pub mod utils;

pub use backends::*;
pub use config::{BackendType, ExecutionProvider, ServiceConfig, ServiceConfigBuilder};
pub use download::ModelDownloader;
pub use error::{BgRemovalError, Result};
pub use inference::InferenceBackend;
pub use models::{ModelInfo, ModelStore, PreprocessingConfig};
pub use processor::{BackendFactory, BackgroundRemovalProcessor, DefaultBackendFactory};
pub use server::{create_app, ApiError, AppState, ErrorResponse, HealthResponse};
pub use types::{ProcessingTimings, RemovalResult, SegmentationMask};
pub use utils::ImagePreprocessor;

#[cfg(feature = "cli")]
pub use tracing_config::{TracingConfig, TracingFormat};

/// Fetch the model weights if they are missing, then load the model
///
/// Meant to run beside the server: until it succeeds, `/remove-bg` answers 500
/// through the processor's lazy model loading while `/health` keeps answering.
/// Returns the load time, or `None` when the model was already loaded.
///
/// # Errors
/// - Download or digest failures
/// - Model loading failures
pub async fn prepare_model(
    processor: &BackgroundRemovalProcessor,
    config: &ServiceConfig,
    show_progress: bool,
) -> Result<Option<instant::Duration>> {
    let store = ModelStore::from_config(config);
    ModelDownloader::new()?
        .ensure_model(&store, config, show_progress)
        .await?;

    let processor = processor.clone();
    tokio::task::spawn_blocking(move || processor.warm_up())
        .await
        .map_err(|e| BgRemovalError::internal(format!("Model warm-up task failed: {e}")))?
}

/// Remove the background from encoded image bytes on the blocking thread pool
///
/// The current tracing span is carried onto the worker thread.
///
/// # Errors
/// - Decode, inference or PNG encoding failures
/// - The worker task panicked
pub async fn remove_background_from_bytes(
    processor: &BackgroundRemovalProcessor,
    image_bytes: Vec<u8>,
) -> Result<Vec<u8>> {
    let processor = processor.clone();
    let span = tracing::Span::current();

    tokio::task::spawn_blocking(move || {
        span.in_scope(|| processor.remove_background_png(&image_bytes))
    })
    .await
    .map_err(|e| BgRemovalError::internal(format!("Processing task failed: {e}")))?
}
