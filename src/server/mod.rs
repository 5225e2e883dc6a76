//! HTTP surface: router construction and serving

pub mod error;
pub mod handlers;

pub use error::{ApiError, ErrorResponse};
pub use handlers::HealthResponse;

use crate::{config::ServiceConfig, error::Result, processor::BackgroundRemovalProcessor};
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

/// Shared state handed to every handler
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServiceConfig>,
    pub processor: BackgroundRemovalProcessor,
}

impl AppState {
    #[must_use]
    pub fn new(config: ServiceConfig, processor: BackgroundRemovalProcessor) -> Self {
        Self {
            config: Arc::new(config),
            processor,
        }
    }
}

/// Build the service router
pub fn create_app(state: AppState) -> Router {
    let max_upload_bytes = state.config.max_upload_bytes;

    Router::new()
        .route("/health", get(handlers::health))
        .route("/remove-bg", post(handlers::remove_background))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until `shutdown` resolves, letting in-flight requests finish
///
/// # Errors
/// - Accept loop I/O failures
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = create_app(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// Resolves on Ctrl-C or, on Unix, SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    tracing::info!("⏹️  Shutdown signal received, draining in-flight requests");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::test_utils::{encode_image, split_image, MockBackend};
    use crate::config::BackendType;
    use axum::{
        body::{to_bytes, Body},
        http::{header, Request, StatusCode},
    };
    use image::ImageFormat;
    use tower::ServiceExt;

    const BOUNDARY: &str = "X-REBAG-TEST-BOUNDARY";

    fn mock_state(backend: MockBackend) -> AppState {
        let config = ServiceConfig::builder()
            .model_dir("/tmp/rebag-model")
            .build()
            .unwrap();
        let processor = BackgroundRemovalProcessor::from_backend(Box::new(backend), BackendType::Onnx);
        AppState::new(config, processor)
    }

    fn multipart_request(filename: &str, data: &[u8]) -> Request<Body> {
        let mut body = format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"image\"; filename=\"{filename}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
        )
        .into_bytes();
        body.extend_from_slice(data);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

        Request::builder()
            .method("POST")
            .uri("/remove-bg")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn test_remove_bg_returns_inline_png() {
        let app = create_app(mock_state(MockBackend::new()));
        let input = encode_image(&split_image(48, 24), ImageFormat::Png);

        let response = app.oneshot(multipart_request("photo.png", &input)).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "image/png");
        assert_eq!(
            response.headers()[header::CONTENT_DISPOSITION],
            "inline; filename=\"removed_bg.png\""
        );

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let decoded = image::load_from_memory_with_format(&body, ImageFormat::Png).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (48, 24));
    }

    #[tokio::test]
    async fn test_remove_bg_inference_failure_is_500() {
        let app = create_app(mock_state(MockBackend::new_failing_inference()));
        let input = encode_image(&split_image(8, 8), ImageFormat::Png);

        let response = app.oneshot(multipart_request("photo.png", &input)).await.unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let error: ErrorResponse = serde_json::from_slice(&body).unwrap();
        assert!(!error.success);
        assert!(error.error.contains("Mock backend inference failed"));
    }

    #[tokio::test]
    async fn test_concurrent_requests_are_independent() {
        let app = create_app(mock_state(MockBackend::new()));
        let sizes = [(10, 30), (33, 12), (64, 64)];

        let responses = futures_util::future::join_all(sizes.iter().map(|&(w, h)| {
            let app = app.clone();
            async move {
                let input = encode_image(&split_image(w, h), ImageFormat::Png);
                let response = app.oneshot(multipart_request("x.png", &input)).await.unwrap();
                assert_eq!(response.status(), StatusCode::OK);
                let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
                let decoded = image::load_from_memory(&body).unwrap();
                (decoded.width(), decoded.height())
            }
        }))
        .await;

        assert_eq!(responses, sizes.to_vec());
    }

    #[tokio::test]
    async fn test_body_over_limit_is_413() {
        let config = ServiceConfig::builder()
            .model_dir("/tmp/rebag-model")
            .max_upload_bytes(64)
            .build()
            .unwrap();
        let processor =
            BackgroundRemovalProcessor::from_backend(Box::new(MockBackend::new()), BackendType::Onnx);
        let app = create_app(AppState::new(config, processor));

        let response = app
            .oneshot(multipart_request("big.png", &[7u8; 4096]))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let error: ErrorResponse = serde_json::from_slice(&body).unwrap();
        assert!(!error.success);
        assert!(error.error.contains("too large"));
    }

    #[tokio::test]
    async fn test_body_under_limit_is_processed() {
        let input = encode_image(&split_image(4, 4), ImageFormat::Png);
        let config = ServiceConfig::builder()
            .model_dir("/tmp/rebag-model")
            .max_upload_bytes(input.len() + 1024)
            .build()
            .unwrap();
        let processor =
            BackgroundRemovalProcessor::from_backend(Box::new(MockBackend::new()), BackendType::Onnx);
        let app = create_app(AppState::new(config, processor));

        let response = app.oneshot(multipart_request("small.png", &input)).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_serve_stops_on_shutdown() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();

        let handle = tokio::spawn(serve(listener, mock_state(MockBackend::new()), async {
            let _ = rx.await;
        }));
        tx.send(()).unwrap();

        assert!(handle.await.unwrap().is_ok());
    }
}
