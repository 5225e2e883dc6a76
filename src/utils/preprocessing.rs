//! Image preprocessing for U2Net-style salient object models

use crate::{
    error::{BgRemovalError, Result},
    models::PreprocessingConfig,
};
use image::{imageops::FilterType, DynamicImage, RgbImage};
use ndarray::Array4;

/// Lower bound for the max-value divisor, so all-black images stay finite
const MIN_SCALE_DIVISOR: f32 = 1e-6;

/// Shared image preprocessing utilities
pub struct ImagePreprocessor;

impl ImagePreprocessor {
    /// Preprocess an image into the model's NCHW input tensor
    ///
    /// This function handles:
    /// - RGB conversion
    /// - Resize to the model's square input (aspect ratio is not preserved)
    /// - Scaling by the brightest channel value of the resized image
    /// - Per-channel mean/std normalization
    ///
    /// # Errors
    /// - Zero-sized target dimensions
    pub fn preprocess_for_inference(
        image: &DynamicImage,
        preprocessing_config: &PreprocessingConfig,
    ) -> Result<Array4<f32>> {
        let [target_width, target_height] = preprocessing_config.target_size;
        if target_width == 0 || target_height == 0 {
            return Err(BgRemovalError::processing(
                "Model input size must be non-zero",
            ));
        }
        if image.width() == 0 || image.height() == 0 {
            return Err(BgRemovalError::processing_stage_error(
                "preprocessing",
                "image has no pixels",
                Some(&format!("{}x{}", image.width(), image.height())),
            ));
        }

        let rgb_image = image.to_rgb8();
        let resized = if rgb_image.dimensions() == (target_width, target_height) {
            rgb_image
        } else {
            image::imageops::resize(
                &rgb_image,
                target_width,
                target_height,
                FilterType::Lanczos3,
            )
        };

        Ok(Self::canvas_to_tensor(&resized, preprocessing_config))
    }

    /// Convert the resized canvas to a normalized tensor
    fn canvas_to_tensor(canvas: &RgbImage, preprocessing_config: &PreprocessingConfig) -> Array4<f32> {
        let (width, height) = canvas.dimensions();
        let mut tensor = Array4::<f32>::zeros((1, 3, height as usize, width as usize));

        let max_value = canvas.as_raw().iter().copied().max().unwrap_or(0);
        let divisor = f32::from(max_value).max(MIN_SCALE_DIVISOR);
        let mean = preprocessing_config.normalization_mean;
        let std = preprocessing_config.normalization_std;

        #[allow(clippy::indexing_slicing)]
        // Safe: tensor dimensions pre-allocated to match canvas size
        for (y, row) in canvas.rows().enumerate() {
            for (x, pixel) in row.enumerate() {
                for channel in 0..3 {
                    let scaled = f32::from(pixel[channel]) / divisor;
                    tensor[[0, channel, y, x]] = (scaled - mean[channel]) / std[channel];
                }
            }
        }

        tensor
    }
}
