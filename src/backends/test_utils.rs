//! Test utilities and mock backends for testing inference functionality
//!
//! `MockBackend` implements `InferenceBackend` without model weights or a
//! runtime. Its prediction marks every pixel whose normalized red value is above
//! the channel mean as foreground, so a test image decides its own mask.

use crate::{
    error::{BgRemovalError, Result},
    inference::InferenceBackend,
    models::{ModelInfo, PreprocessingConfig},
};
use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
use instant::Duration;
use ndarray::Array4;
use std::io::Cursor;
use std::sync::{Arc, Mutex};

/// Mock backend for testing
#[derive(Debug, Clone)]
pub struct MockBackend {
    initialized: bool,
    model_info: ModelInfo,
    preprocessing_config: PreprocessingConfig,
    /// Call history for verification in tests
    call_history: Arc<Mutex<Vec<String>>>,
    should_fail_init: bool,
    should_fail_inference: bool,
    panic_on_next_inference: bool,
}

impl MockBackend {
    /// Create a new mock backend with a small input size
    #[must_use]
    pub fn new() -> Self {
        Self {
            initialized: false,
            model_info: ModelInfo {
                name: "mock-u2net".to_string(),
                precision: "fp32".to_string(),
                size_bytes: 1024 * 1024,
                input_shape: (1, 3, 32, 32),
                output_shape: (1, 1, 32, 32),
            },
            preprocessing_config: PreprocessingConfig {
                target_size: [32, 32],
                ..PreprocessingConfig::u2net()
            },
            call_history: Arc::new(Mutex::new(Vec::new())),
            should_fail_init: false,
            should_fail_inference: false,
            panic_on_next_inference: false,
        }
    }

    /// Create a mock backend that will fail during initialization
    #[must_use]
    pub fn new_failing_init() -> Self {
        let mut backend = Self::new();
        backend.should_fail_init = true;
        backend
    }

    /// Create a mock backend that will fail during inference
    #[must_use]
    pub fn new_failing_inference() -> Self {
        let mut backend = Self::new();
        backend.should_fail_inference = true;
        backend
    }

    /// Create a mock backend whose first inference panics
    #[must_use]
    pub fn new_panicking_once() -> Self {
        let mut backend = Self::new();
        backend.panic_on_next_inference = true;
        backend
    }

    /// Shared handle to the call history, usable after the backend is boxed
    #[must_use]
    pub fn call_history(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.call_history)
    }

    fn record_call(&self, method: &str) {
        if let Ok(mut history) = self.call_history.lock() {
            history.push(method.to_string());
        }
    }

    fn generate_mock_output(input: &Array4<f32>) -> Array4<f32> {
        let (batch, _, height, width) = input.dim();
        let red = input.index_axis(ndarray::Axis(1), 0);
        let mean = red.mean().unwrap_or(0.0);

        let mut output = Array4::<f32>::zeros((batch, 1, height, width));
        for ((b, y, x), &value) in red.indexed_iter() {
            if value > mean {
                output[[b, 0, y, x]] = 1.0;
            }
        }
        output
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InferenceBackend for MockBackend {
    fn initialize(&mut self) -> Result<Option<Duration>> {
        self.record_call("initialize");

        if self.should_fail_init {
            return Err(BgRemovalError::model("Mock backend initialization failed"));
        }
        if self.initialized {
            return Ok(None);
        }

        self.initialized = true;
        Ok(Some(Duration::from_millis(5)))
    }

    fn infer(&mut self, input: &Array4<f32>) -> Result<Array4<f32>> {
        self.record_call("infer");

        if !self.initialized {
            return Err(BgRemovalError::internal("Mock backend not initialized"));
        }
        if self.should_fail_inference {
            return Err(BgRemovalError::inference("Mock backend inference failed"));
        }
        if self.panic_on_next_inference {
            self.panic_on_next_inference = false;
            panic!("Mock backend inference panicked");
        }

        Ok(Self::generate_mock_output(input))
    }

    fn preprocessing_config(&self) -> PreprocessingConfig {
        self.preprocessing_config.clone()
    }

    fn model_info(&self) -> ModelInfo {
        self.model_info.clone()
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }
}

/// Opaque image whose left half is red and right half black
#[must_use]
pub fn split_image(width: u32, height: u32) -> RgbaImage {
    RgbaImage::from_fn(width, height, |x, _| {
        if x < width / 2 {
            Rgba([255, 0, 0, 255])
        } else {
            Rgba([0, 0, 0, 255])
        }
    })
}

/// Encode an image in the given format
///
/// # Panics
/// Encoder failures
#[must_use]
pub fn encode_image(image: &RgbaImage, format: ImageFormat) -> Vec<u8> {
    let dynamic = match format {
        ImageFormat::Jpeg => DynamicImage::ImageRgb8(DynamicImage::ImageRgba8(image.clone()).to_rgb8()),
        _ => DynamicImage::ImageRgba8(image.clone()),
    };
    let mut buffer = Vec::new();
    dynamic
        .write_to(&mut Cursor::new(&mut buffer), format)
        .expect("test image encodes");
    buffer
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_requires_initialization() {
        let mut backend = MockBackend::new();
        let input = Array4::<f32>::zeros((1, 3, 32, 32));

        assert!(backend.infer(&input).is_err());
        assert!(backend.initialize().unwrap().is_some());
        assert!(backend.initialize().unwrap().is_none());
        assert!(backend.infer(&input).is_ok());

        let history = backend.call_history();
        let calls = history.lock().unwrap().clone();
        assert_eq!(calls, vec!["infer", "initialize", "initialize", "infer"]);
    }

    #[test]
    fn test_mock_output_follows_red_channel() {
        let mut input = Array4::<f32>::zeros((1, 3, 4, 4));
        input[[0, 0, 1, 2]] = 3.0;

        let output = MockBackend::generate_mock_output(&input);

        assert_eq!(output.shape(), &[1, 1, 4, 4]);
        assert_eq!(output[[0, 0, 1, 2]], 1.0);
        assert_eq!(output.sum(), 1.0);
    }

    #[test]
    fn test_failing_variants() {
        assert!(MockBackend::new_failing_init().initialize().is_err());

        let mut backend = MockBackend::new_failing_inference();
        backend.initialize().unwrap();
        let err = backend.infer(&Array4::zeros((1, 3, 2, 2))).unwrap_err();
        assert!(err.to_string().contains("inference failed"));
    }
}
