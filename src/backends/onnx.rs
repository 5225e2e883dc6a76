//! ONNX Runtime backend implementation for the segmentation model
//!
//! Runs `u2net.onnx` through ONNX Runtime with CPU, CUDA or `CoreML` execution
//! providers. The session is created lazily on `initialize`, reading the weights
//! from the configured model directory.

use crate::config::{ExecutionProvider, ServiceConfig};
use crate::error::{BgRemovalError, Result};
use crate::inference::InferenceBackend;
use crate::models::{ModelInfo, ModelStore, PreprocessingConfig};
use instant::{Duration, Instant};
use ndarray::Array4;
use ort::execution_providers::{
    CUDAExecutionProvider, CoreMLExecutionProvider, ExecutionProvider as OrtExecutionProvider,
};
use ort::session::{builder::GraphOptimizationLevel, builder::SessionBuilder, Session};
use ort::{self, value::Value};

/// ONNX Runtime backend for running the background removal model
#[derive(Debug)]
pub struct OnnxBackend {
    session: Option<Session>,
    store: ModelStore,
    execution_provider: ExecutionProvider,
    intra_threads: usize,
    initialized: bool,
}

impl OnnxBackend {
    /// List all ONNX Runtime execution providers with availability status and descriptions
    ///
    /// Returns `(name, available, description)` tuples.
    pub fn list_providers() -> Vec<(String, bool, String)> {
        let cuda_available =
            OrtExecutionProvider::is_available(&CUDAExecutionProvider::default()).unwrap_or(false);
        let coreml_available =
            OrtExecutionProvider::is_available(&CoreMLExecutionProvider::default())
                .unwrap_or(false);

        tracing::debug!(
            os = std::env::consts::OS,
            arch = std::env::consts::ARCH,
            cuda_available,
            coreml_available,
            "Execution provider availability"
        );

        vec![
            (
                "CPU".to_string(),
                true,
                "Always available, uses CPU for inference".to_string(),
            ),
            (
                "CUDA".to_string(),
                cuda_available,
                "NVIDIA GPU acceleration (requires CUDA toolkit and compatible GPU)".to_string(),
            ),
            (
                "CoreML".to_string(),
                coreml_available,
                "Apple Silicon GPU acceleration (macOS only)".to_string(),
            ),
        ]
    }

    /// Create a backend reading weights from `store`
    #[must_use]
    pub fn new(store: ModelStore, execution_provider: ExecutionProvider, intra_threads: usize) -> Self {
        Self {
            session: None,
            store,
            execution_provider,
            intra_threads,
            initialized: false,
        }
    }

    /// Create a backend from the service configuration
    #[must_use]
    pub fn from_config(config: &ServiceConfig) -> Self {
        Self::new(
            ModelStore::from_config(config),
            config.execution_provider,
            config.intra_threads,
        )
    }

    /// Register the requested execution providers, falling back to CPU when unavailable
    fn configure_providers(&self, session_builder: SessionBuilder) -> Result<SessionBuilder> {
        let mut providers = Vec::new();

        let want_cuda = matches!(
            self.execution_provider,
            ExecutionProvider::Auto | ExecutionProvider::Cuda
        );
        let want_coreml = matches!(
            self.execution_provider,
            ExecutionProvider::Auto | ExecutionProvider::CoreMl
        );

        if want_cuda {
            let cuda_provider = CUDAExecutionProvider::default();
            if OrtExecutionProvider::is_available(&cuda_provider).unwrap_or(false) {
                tracing::info!("🚀 CUDA execution provider is available and will be used");
                providers.push(cuda_provider.build());
            } else if self.execution_provider == ExecutionProvider::Cuda {
                tracing::warn!(
                    "CUDA execution provider requested but not available, falling back to CPU"
                );
            }
        }

        if want_coreml {
            let coreml_provider = CoreMLExecutionProvider::default();
            if OrtExecutionProvider::is_available(&coreml_provider).unwrap_or(false) {
                tracing::info!("🍎 CoreML execution provider is available and will be used");
                providers.push(coreml_provider.with_subgraphs(true).build());
            } else if self.execution_provider == ExecutionProvider::CoreMl {
                tracing::warn!(
                    "CoreML execution provider requested but not available, falling back to CPU"
                );
            }
        }

        if providers.is_empty() {
            tracing::info!("Using CPU execution provider");
            return Ok(session_builder);
        }

        session_builder
            .with_execution_providers(providers)
            .map_err(|e| {
                BgRemovalError::inference(format!("Failed to set execution providers: {e}"))
            })
    }

    /// Load and initialize the ONNX model
    fn load_model(&mut self) -> Result<Duration> {
        let model_load_start = Instant::now();
        let model_data = self.store.load_model()?;

        let session_builder = Session::builder()
            .map_err(|e| {
                BgRemovalError::inference(format!("Failed to create session builder: {e}"))
            })?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| {
                BgRemovalError::inference(format!("Failed to set optimization level: {e}"))
            })?;
        let session_builder = self.configure_providers(session_builder)?;

        let intra_threads = if self.intra_threads > 0 {
            self.intra_threads
        } else {
            std::thread::available_parallelism()
                .map(std::num::NonZeroUsize::get)
                .unwrap_or(4)
        };

        let session = session_builder
            .with_intra_threads(intra_threads)
            .map_err(|e| BgRemovalError::inference(format!("Failed to set intra threads: {e}")))?
            .commit_from_memory(&model_data)
            .map_err(|e| {
                BgRemovalError::model_error_with_context(
                    "create session for",
                    self.store.model_path(),
                    &e.to_string(),
                    &["delete the file to download it again"],
                )
            })?;

        self.session = Some(session);
        self.initialized = true;

        let model_load_time = model_load_start.elapsed();
        tracing::info!(
            provider = %self.execution_provider,
            intra_threads,
            size_mb = %format!("{:.1}", model_data.len() as f64 / (1024.0 * 1024.0)),
            "📊 Model loading complete: {:.0}ms",
            model_load_time.as_secs_f64() * 1000.0
        );

        Ok(model_load_time)
    }
}

impl InferenceBackend for OnnxBackend {
    fn initialize(&mut self) -> Result<Option<Duration>> {
        if self.initialized {
            return Ok(None);
        }

        let model_load_time = self.load_model()?;
        Ok(Some(model_load_time))
    }

    fn infer(&mut self, input: &Array4<f32>) -> Result<Array4<f32>> {
        if !self.initialized {
            return Err(BgRemovalError::internal("Backend not initialized"));
        }

        let session = self
            .session
            .as_mut()
            .ok_or_else(|| BgRemovalError::internal("ONNX session not initialized"))?;

        let inference_start = Instant::now();

        let input_value = Value::from_array(input.clone()).map_err(|e| {
            BgRemovalError::processing(format!("Failed to convert input tensor: {e}"))
        })?;

        // Positional inputs: the model's single input is fed regardless of its name
        let outputs = session
            .run(ort::inputs![input_value])
            .map_err(|e| BgRemovalError::inference(format!("ONNX inference failed: {e}")))?;

        // U2Net emits several side outputs; the fused prediction comes first
        let output_tensor = {
            let keys: Vec<_> = outputs.keys().collect();
            let Some(first_key) = keys.first() else {
                return Err(BgRemovalError::inference("No output tensors found"));
            };
            outputs
                .get(first_key)
                .ok_or_else(|| BgRemovalError::inference("First output tensor not found"))?
                .try_extract_array::<f32>()
                .map_err(|e| {
                    BgRemovalError::inference(format!("Failed to extract output tensor: {e}"))
                })?
        };

        let output_shape = output_tensor.shape().to_vec();
        let [batch, channels, height, width] = output_shape[..] else {
            return Err(BgRemovalError::inference(format!(
                "Expected 4D output tensor, got {}D",
                output_shape.len()
            )));
        };

        let output_array = Array4::from_shape_vec(
            (batch, channels, height, width),
            output_tensor.iter().copied().collect(),
        )
        .map_err(|e| BgRemovalError::inference(format!("Failed to reshape output tensor: {e}")))?;

        tracing::debug!(
            output_shape = ?output_array.shape(),
            "⚡ ONNX inference: {:.2}ms",
            inference_start.elapsed().as_secs_f64() * 1000.0
        );

        Ok(output_array)
    }

    fn preprocessing_config(&self) -> PreprocessingConfig {
        self.store.preprocessing_config()
    }

    fn model_info(&self) -> ModelInfo {
        self.store.model_info()
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }
}

#[cfg(all(test, feature = "onnx"))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_onnx_backend_creation() {
        let backend = OnnxBackend::new(ModelStore::new("./model"), ExecutionProvider::Cpu, 0);

        assert!(!backend.is_initialized());
        assert_eq!(backend.model_info().input_shape, (1, 3, 320, 320));
        assert_eq!(backend.preprocessing_config().target_size, [320, 320]);
    }

    #[test]
    fn test_infer_before_initialize_fails() {
        let mut backend = OnnxBackend::new(ModelStore::new("./model"), ExecutionProvider::Cpu, 0);
        let input = Array4::<f32>::zeros((1, 3, 320, 320));

        let err = backend.infer(&input).unwrap_err();
        assert!(err.to_string().contains("not initialized"));
    }

    #[test]
    fn test_initialize_without_weights_fails() {
        let temp_dir = TempDir::new().unwrap();
        let mut backend =
            OnnxBackend::new(ModelStore::new(temp_dir.path()), ExecutionProvider::Cpu, 1);

        let err = backend.initialize().unwrap_err();
        assert!(err.to_string().contains("u2net.onnx"));
        assert!(!backend.is_initialized());
    }
}
