//! Core types for background removal operations

use crate::error::{BgRemovalError, Result};
use image::{GrayImage, ImageBuffer, ImageFormat, Rgba, RgbaImage};
use serde::{Deserialize, Serialize};
use std::io::Cursor;

/// Result of a background removal operation
#[derive(Debug, Clone)]
pub struct RemovalResult {
    /// The processed image with background removed
    pub image: RgbaImage,

    /// The segmentation mask used for removal
    pub mask: SegmentationMask,

    /// Original image dimensions
    pub original_dimensions: (u32, u32),

    /// Per-stage timings
    pub timings: ProcessingTimings,
}

impl RemovalResult {
    /// Create a new removal result
    #[must_use]
    pub fn new(
        image: RgbaImage,
        mask: SegmentationMask,
        original_dimensions: (u32, u32),
        timings: ProcessingTimings,
    ) -> Self {
        Self {
            image,
            mask,
            original_dimensions,
            timings,
        }
    }

    /// Encode the cut-out image as PNG
    ///
    /// # Errors
    /// - PNG encoder failures
    pub fn to_png_bytes(&self) -> Result<Vec<u8>> {
        let mut buffer = Vec::new();
        let mut cursor = Cursor::new(&mut buffer);
        self.image.write_to(&mut cursor, ImageFormat::Png)?;
        Ok(buffer)
    }

    /// Get image dimensions
    #[must_use]
    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }
}

/// Grayscale segmentation mask, 0 = background and 255 = foreground
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentationMask {
    /// Mask data as grayscale values (0-255), row-major
    pub data: Vec<u8>,

    /// Mask dimensions (width, height)
    pub dimensions: (u32, u32),
}

impl SegmentationMask {
    /// Create a new segmentation mask
    #[must_use]
    pub fn new(data: Vec<u8>, dimensions: (u32, u32)) -> Self {
        Self { data, dimensions }
    }

    /// Create mask from a grayscale image
    #[must_use]
    pub fn from_image(image: &GrayImage) -> Self {
        Self::new(image.as_raw().clone(), image.dimensions())
    }

    /// Convert mask to a grayscale image
    ///
    /// # Errors
    /// - Data length does not match the dimensions
    pub fn to_image(&self) -> Result<GrayImage> {
        let (width, height) = self.dimensions;
        ImageBuffer::from_raw(width, height, self.data.clone()).ok_or_else(|| {
            BgRemovalError::processing("Failed to create image from mask data")
        })
    }

    /// Resize the mask to new dimensions
    ///
    /// # Errors
    /// - Data length does not match the dimensions
    pub fn resize(&self, new_width: u32, new_height: u32) -> Result<SegmentationMask> {
        if self.dimensions == (new_width, new_height) {
            return Ok(self.clone());
        }

        let current_image = self.to_image()?;
        let resized = image::imageops::resize(
            &current_image,
            new_width,
            new_height,
            image::imageops::FilterType::Lanczos3,
        );

        Ok(SegmentationMask::from_image(&resized))
    }

    /// Cut the image out along the mask
    ///
    /// Composites the image over a transparent canvas: every channel, alpha
    /// included, is scaled by `mask / 255` with rounding. Fully transparent
    /// pixels are written as `[0, 0, 0, 0]`.
    ///
    /// # Errors
    /// - Image and mask dimensions differ
    pub fn apply_to_image(&self, image: &RgbaImage) -> Result<RgbaImage> {
        if image.dimensions() != self.dimensions {
            return Err(BgRemovalError::processing(format!(
                "Image and mask dimensions do not match: {:?} vs {:?}",
                image.dimensions(),
                self.dimensions
            )));
        }

        let (width, height) = image.dimensions();
        let mut result = RgbaImage::new(width, height);

        for ((pixel, out), &mask_value) in image
            .pixels()
            .zip(result.pixels_mut())
            .zip(self.data.iter())
        {
            let scale = |channel: u8| ((u16::from(channel) * u16::from(mask_value) + 127) / 255) as u8;
            let alpha = scale(pixel[3]);
            *out = if alpha > 0 {
                Rgba([scale(pixel[0]), scale(pixel[1]), scale(pixel[2]), alpha])
            } else {
                Rgba([0, 0, 0, 0])
            };
        }

        Ok(result)
    }

    /// Get mask statistics
    #[must_use]
    pub fn statistics(&self) -> MaskStatistics {
        let total_pixels = self.data.len();
        let foreground_pixels = self.data.iter().filter(|&&x| x > 127).count();
        let background_pixels = total_pixels - foreground_pixels;
        let ratio = |count: usize| {
            if total_pixels == 0 {
                0.0
            } else {
                count as f32 / total_pixels as f32
            }
        };

        MaskStatistics {
            total_pixels,
            foreground_pixels,
            background_pixels,
            foreground_ratio: ratio(foreground_pixels),
            background_ratio: ratio(background_pixels),
        }
    }
}

/// Statistics about a segmentation mask
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaskStatistics {
    pub total_pixels: usize,
    pub foreground_pixels: usize,
    pub background_pixels: usize,
    pub foreground_ratio: f32,
    pub background_ratio: f32,
}

/// Detailed timing breakdown for background removal processing
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingTimings {
    /// Model loading time (first call only)
    pub model_load_ms: u64,

    /// Image decoding from the uploaded bytes
    pub image_decode_ms: u64,

    /// Image preprocessing (resize, normalize, tensor conversion)
    pub preprocessing_ms: u64,

    /// Backend inference execution
    pub inference_ms: u64,

    /// Postprocessing (mask generation, alpha application)
    pub postprocessing_ms: u64,

    /// PNG encoding
    pub image_encode_ms: u64,

    /// Total end-to-end processing time
    pub total_ms: u64,
}

impl ProcessingTimings {
    /// Share of the total spent in inference
    #[must_use]
    pub fn inference_ratio(&self) -> f64 {
        if self.total_ms == 0 {
            0.0
        } else {
            self.inference_ms as f64 / self.total_ms as f64
        }
    }
}
