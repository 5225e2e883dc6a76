//! Tract backend implementation for the segmentation model
//!
//! Pure Rust inference through Tract, with no native runtime to install.
//! Slower than ONNX Runtime but useful where the shared library is unavailable.

use crate::config::ServiceConfig;
use crate::error::{BgRemovalError, Result};
use crate::inference::InferenceBackend;
use crate::models::{ModelInfo, ModelStore, PreprocessingConfig};
use instant::{Duration, Instant};
use ndarray::Array4;
use tract_onnx::prelude::*;

/// Type alias for the complex Tract model type to reduce complexity warnings
type TractModel = RunnableModel<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// Tract backend for running the segmentation model using pure Rust inference
#[derive(Debug)]
pub struct TractBackend {
    model: Option<TractModel>,
    store: ModelStore,
    initialized: bool,
}

impl TractBackend {
    /// Tract only runs on the CPU
    pub fn list_providers() -> Vec<(String, bool, String)> {
        vec![(
            "CPU".to_string(),
            true,
            "Pure Rust CPU inference with no external dependencies".to_string(),
        )]
    }

    /// Create a backend reading weights from `store`
    #[must_use]
    pub fn new(store: ModelStore) -> Self {
        Self {
            model: None,
            store,
            initialized: false,
        }
    }

    /// Create a backend from the service configuration
    #[must_use]
    pub fn from_config(config: &ServiceConfig) -> Self {
        Self::new(ModelStore::from_config(config))
    }

    fn load_model(&mut self) -> Result<Duration> {
        let model_load_start = Instant::now();
        let model_data = self.store.load_model()?;
        let (batch, channels, height, width) = self.store.model_info().input_shape;

        let model_path = self.store.model_path();
        let model_error = |operation: &str, e: &dyn std::fmt::Display| {
            BgRemovalError::model_error_with_context(
                operation,
                &model_path,
                &e.to_string(),
                &["delete the file to download it again"],
            )
        };

        // Pinning the input fact lets Tract resolve the symbolic batch and spatial dims
        let model = onnx()
            .model_for_read(&mut std::io::Cursor::new(&model_data))
            .map_err(|e| model_error("parse", &e))?
            .with_input_fact(0, f32::fact([batch, channels, height, width]).into())
            .map_err(|e| model_error("set input shape for", &e))?
            .into_optimized()
            .map_err(|e| model_error("optimize", &e))?
            .into_runnable()
            .map_err(|e| model_error("prepare", &e))?;

        self.model = Some(model);
        self.initialized = true;

        let model_load_time = model_load_start.elapsed();
        tracing::info!(
            size_mb = %format!("{:.1}", model_data.len() as f64 / (1024.0 * 1024.0)),
            "✅ Tract backend initialized in {}ms",
            model_load_time.as_millis()
        );

        Ok(model_load_time)
    }
}

impl InferenceBackend for TractBackend {
    fn initialize(&mut self) -> Result<Option<Duration>> {
        if self.initialized {
            return Ok(None);
        }

        let model_load_time = self.load_model()?;
        Ok(Some(model_load_time))
    }

    fn infer(&mut self, input: &Array4<f32>) -> Result<Array4<f32>> {
        let model = self
            .model
            .as_ref()
            .ok_or_else(|| BgRemovalError::internal("Tract model not initialized"))?;

        let inference_start = Instant::now();

        let input_data: Vec<f32> = input.iter().copied().collect();
        let input_tensor = Tensor::from_shape(input.shape(), &input_data).map_err(|e| {
            BgRemovalError::processing(format!("Failed to convert input tensor: {e}"))
        })?;

        let outputs = model
            .run(tvec![input_tensor.into()])
            .map_err(|e| BgRemovalError::inference(format!("Tract inference failed: {e}")))?;

        let output_tensor = outputs
            .into_iter()
            .next()
            .ok_or_else(|| BgRemovalError::inference("No output tensor found"))?;

        let output_shape = output_tensor.shape().to_vec();
        let [batch, channels, height, width] = output_shape[..] else {
            return Err(BgRemovalError::inference(format!(
                "Expected 4D output tensor, got {}D",
                output_shape.len()
            )));
        };

        let output_data = output_tensor.as_slice::<f32>().map_err(|e| {
            BgRemovalError::inference(format!("Failed to convert output tensor: {e}"))
        })?;

        let output_array =
            Array4::from_shape_vec((batch, channels, height, width), output_data.to_vec())
                .map_err(|e| {
                    BgRemovalError::inference(format!("Failed to reshape output tensor: {e}"))
                })?;

        tracing::debug!(
            output_shape = ?output_array.shape(),
            "✅ Tract inference completed in {}ms",
            inference_start.elapsed().as_millis()
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
