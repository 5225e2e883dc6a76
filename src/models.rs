//! Model storage and metadata
//!
//! The service runs a single fixed model, U2Net, whose weights live in the
//! configured model directory as `u2net.onnx`. `ModelStore` owns that location:
//! it creates the directory, answers whether the weights are present and reads
//! them for the inference backends.

use crate::config::ServiceConfig;
use crate::error::{BgRemovalError, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Model identifier reported by the liveness endpoint
pub const MODEL_NAME: &str = "u2net";

/// File name of the weights inside the model directory
pub const MODEL_FILE_NAME: &str = "u2net.onnx";

/// Square input resolution of U2Net
pub const MODEL_INPUT_SIZE: u32 = 320;

/// Model information and metadata
#[derive(Debug, Clone, PartialEq)]
pub struct ModelInfo {
    pub name: String,
    pub precision: String,
    pub size_bytes: usize,
    pub input_shape: (usize, usize, usize, usize), // NCHW format
    pub output_shape: (usize, usize, usize, usize),
}

/// Preprocessing parameters the model was trained with
#[derive(Debug, Clone, PartialEq)]
pub struct PreprocessingConfig {
    /// Target input size `[width, height]`
    pub target_size: [u32; 2],
    /// Per-channel mean (RGB) applied after scaling to `[0, 1]`
    pub normalization_mean: [f32; 3],
    /// Per-channel standard deviation (RGB)
    pub normalization_std: [f32; 3],
}

impl PreprocessingConfig {
    /// ImageNet statistics at 320x320, as used by U2Net
    #[must_use]
    pub fn u2net() -> Self {
        Self {
            target_size: [MODEL_INPUT_SIZE, MODEL_INPUT_SIZE],
            normalization_mean: [0.485, 0.456, 0.406],
            normalization_std: [0.229, 0.224, 0.225],
        }
    }
}

impl Default for PreprocessingConfig {
    fn default() -> Self {
        Self::u2net()
    }
}

/// Location of the model weights on disk
#[derive(Debug, Clone)]
pub struct ModelStore {
    model_dir: PathBuf,
}

impl ModelStore {
    /// Create a store rooted at `model_dir`
    #[must_use]
    pub fn new<P: Into<PathBuf>>(model_dir: P) -> Self {
        Self {
            model_dir: model_dir.into(),
        }
    }

    /// Create a store for the configured model directory
    #[must_use]
    pub fn from_config(config: &ServiceConfig) -> Self {
        Self::new(config.model_dir.clone())
    }

    /// Directory holding the weights
    #[must_use]
    pub fn model_dir(&self) -> &Path {
        &self.model_dir
    }

    /// Full path of the weights file
    #[must_use]
    pub fn model_path(&self) -> PathBuf {
        self.model_dir.join(MODEL_FILE_NAME)
    }

    /// Create the model directory (and parents) if it does not exist yet
    ///
    /// # Errors
    /// - Insufficient permissions or a file occupying the path
    pub fn ensure_dir(&self) -> Result<()> {
        if self.model_dir.is_dir() {
            return Ok(());
        }

        fs::create_dir_all(&self.model_dir).map_err(|e| {
            BgRemovalError::file_io_error("create model directory", &self.model_dir, &e)
        })?;
        tracing::debug!(path = %self.model_dir.display(), "Created model directory");
        Ok(())
    }

    /// Whether a non-empty weights file is present
    #[must_use]
    pub fn is_model_available(&self) -> bool {
        fs::metadata(self.model_path()).is_ok_and(|meta| meta.is_file() && meta.len() > 0)
    }

    /// Read the weights into memory
    ///
    /// # Errors
    /// - Weights file missing or unreadable
    pub fn load_model(&self) -> Result<Vec<u8>> {
        let path = self.model_path();
        if !path.is_file() {
            return Err(BgRemovalError::model_error_with_context(
                "load",
                &path,
                "file not found",
                &[
                    "check MODEL_DIR",
                    "allow the model download at startup",
                    "copy u2net.onnx into the model directory",
                ],
            ));
        }

        fs::read(&path).map_err(|e| BgRemovalError::file_io_error("read model file", &path, &e))
    }

    /// Model metadata; size is 0 when the weights are not on disk yet
    #[must_use]
    pub fn model_info(&self) -> ModelInfo {
        let size_bytes = fs::metadata(self.model_path())
            .map(|meta| meta.len() as usize)
            .unwrap_or(0);
        let side = MODEL_INPUT_SIZE as usize;

        ModelInfo {
            name: MODEL_NAME.to_string(),
            precision: "fp32".to_string(),
            size_bytes,
            input_shape: (1, 3, side, side),
            output_shape: (1, 1, side, side),
        }
    }

    /// Preprocessing parameters for the stored model
    #[must_use]
    pub fn preprocessing_config(&self) -> PreprocessingConfig {
        PreprocessingConfig::u2net()
    }
}
