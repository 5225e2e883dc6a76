//! Inference backend abstraction

use crate::error::Result;
use crate::models::{ModelInfo, PreprocessingConfig};
use ndarray::Array4;

// Use instant crate for cross-platform time compatibility
use instant::Duration;

/// Trait for inference backends
///
/// Backends are loaded lazily: `infer` on an uninitialized backend is an error,
/// callers run `initialize` first (it is a no-op once the model is loaded).
pub trait InferenceBackend: Send {
    /// Load the model, returning the load time on first call and `None` afterwards
    ///
    /// # Errors
    /// - Weights missing or unreadable
    /// - Runtime session creation failures
    fn initialize(&mut self) -> Result<Option<Duration>>;

    /// Run inference on an NCHW input tensor, returning the first model output
    ///
    /// # Errors
    /// - Backend not initialized
    /// - Model inference failures
    /// - Output tensor not 4-dimensional
    fn infer(&mut self, input: &Array4<f32>) -> Result<Array4<f32>>;

    /// Preprocessing parameters the model expects
    fn preprocessing_config(&self) -> PreprocessingConfig;

    /// Model information for this backend
    fn model_info(&self) -> ModelInfo;

    /// Check if backend is initialized
    fn is_initialized(&self) -> bool;
}
