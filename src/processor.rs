//! Background removal processor
//!
//! `BackgroundRemovalProcessor` owns the inference backend and runs the full
//! pipeline: decode, preprocess, infer, mask generation and alpha cutout. It is
//! cheap to clone and shared by every request handler.

use crate::{
    config::{BackendType, ServiceConfig},
    error::{BgRemovalError, Result},
    inference::InferenceBackend,
    models::ModelInfo,
    types::{ProcessingTimings, RemovalResult, SegmentationMask},
    utils::ImagePreprocessor,
};
use image::{DynamicImage, ImageDecoder, ImageReader};
use instant::{Duration, Instant};
use ndarray::{s, Array4};
use std::io::Cursor;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, instrument, span, warn, Level};

/// Factory trait for creating inference backends
pub trait BackendFactory: Send + Sync {
    /// Create an uninitialized backend for the configured engine
    ///
    /// # Errors
    /// - The engine was not compiled into this build
    fn create_backend(&self, config: &ServiceConfig) -> Result<Box<dyn InferenceBackend>>;

    /// List backend types this factory can create
    fn available_backends(&self) -> Vec<BackendType>;
}

/// Creates the backends compiled in through the `onnx` and `tract` features
pub struct DefaultBackendFactory;

impl BackendFactory for DefaultBackendFactory {
    fn create_backend(&self, config: &ServiceConfig) -> Result<Box<dyn InferenceBackend>> {
        match config.backend_type {
            #[cfg(feature = "onnx")]
            BackendType::Onnx => Ok(Box::new(crate::backends::OnnxBackend::from_config(config))),
            #[cfg(feature = "tract")]
            BackendType::Tract => Ok(Box::new(crate::backends::TractBackend::from_config(config))),
            #[allow(unreachable_patterns)]
            other => Err(BgRemovalError::invalid_config(format!(
                "Backend '{other}' is not available in this build"
            ))),
        }
    }

    fn available_backends(&self) -> Vec<BackendType> {
        let mut backends = Vec::new();
        #[cfg(feature = "onnx")]
        backends.push(BackendType::Onnx);
        #[cfg(feature = "tract")]
        backends.push(BackendType::Tract);
        backends
    }
}

/// Shared background removal pipeline
///
/// Inference is serialized through a mutex around the backend; decoding,
/// preprocessing and mask application run without holding it. A request that
/// panics while holding the lock does not take the backend down with it: the
/// next caller recovers the guard and clears the poison flag.
#[derive(Clone)]
pub struct BackgroundRemovalProcessor {
    backend: Arc<Mutex<Box<dyn InferenceBackend>>>,
    backend_type: BackendType,
}

impl BackgroundRemovalProcessor {
    /// Create a processor with the default backend factory
    ///
    /// The model is not loaded until `warm_up` or the first processed image.
    ///
    /// # Errors
    /// - The configured backend is not compiled in
    pub fn new(config: &ServiceConfig) -> Result<Self> {
        Self::with_factory(config, &DefaultBackendFactory)
    }

    /// Create a processor with a custom backend factory
    ///
    /// # Errors
    /// - Backend creation failures
    pub fn with_factory(config: &ServiceConfig, factory: &dyn BackendFactory) -> Result<Self> {
        let backend = factory.create_backend(config)?;
        Ok(Self::from_backend(backend, config.backend_type))
    }

    /// Wrap an already constructed backend
    #[must_use]
    pub fn from_backend(backend: Box<dyn InferenceBackend>, backend_type: BackendType) -> Self {
        Self {
            backend: Arc::new(Mutex::new(backend)),
            backend_type,
        }
    }

    /// Backend engine in use
    #[must_use]
    pub fn backend_type(&self) -> BackendType {
        self.backend_type
    }

    /// Load the model now instead of on the first request
    ///
    /// Returns the load time, or `None` when the model was already loaded.
    ///
    /// # Errors
    /// - Model loading failures
    pub fn warm_up(&self) -> Result<Option<Duration>> {
        let mut backend = self.lock_backend();
        let load_time = backend.initialize()?;
        if let Some(duration) = load_time {
            info!(
                backend = %self.backend_type,
                model = %backend.model_info().name,
                "🔥 Model warmed up in {}ms",
                duration.as_millis()
            );
        }
        Ok(load_time)
    }

    /// Whether the model has been loaded
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.lock_backend().is_initialized()
    }

    /// Model metadata reported by the backend
    #[must_use]
    pub fn model_info(&self) -> ModelInfo {
        self.lock_backend().model_info()
    }

    /// Decode uploaded bytes into an image, honouring the EXIF orientation tag
    ///
    /// # Errors
    /// - Empty input
    /// - Unrecognized or corrupt image data
    pub fn decode_image(image_bytes: &[u8]) -> Result<DynamicImage> {
        if image_bytes.is_empty() {
            return Err(BgRemovalError::processing_stage_error(
                "decode",
                "uploaded file is empty",
                None,
            ));
        }

        let decode_error = |e: &dyn std::fmt::Display| {
            BgRemovalError::processing_stage_error(
                "decode",
                &format!("cannot identify image file: {e}"),
                Some(&format!("{} bytes", image_bytes.len())),
            )
        };

        let mut decoder = ImageReader::new(Cursor::new(image_bytes))
            .with_guessed_format()
            .map_err(|e| decode_error(&e))?
            .into_decoder()
            .map_err(|e| decode_error(&e))?;
        let orientation = decoder.orientation().map_err(|e| decode_error(&e))?;
        let mut image = DynamicImage::from_decoder(decoder).map_err(|e| decode_error(&e))?;
        image.apply_orientation(orientation);

        Ok(image)
    }

    /// Run the pipeline on an encoded image
    ///
    /// # Errors
    /// - Decoding failures
    /// - Model loading or inference failures
    #[instrument(skip(self, image_bytes), fields(input_bytes = image_bytes.len()))]
    pub fn process_bytes(&self, image_bytes: &[u8]) -> Result<RemovalResult> {
        let decode_start = Instant::now();
        let image = {
            let _span = span!(Level::DEBUG, "decode").entered();
            Self::decode_image(image_bytes)?
        };
        let image_decode_ms = decode_start.elapsed().as_millis() as u64;

        let mut result = self.process_image(&image)?;
        result.timings.image_decode_ms = image_decode_ms;
        result.timings.total_ms += image_decode_ms;
        Ok(result)
    }

    /// Run the pipeline on a decoded image
    ///
    /// # Errors
    /// - Model loading or inference failures
    /// - Unexpected model output shape
    pub fn process_image(&self, image: &DynamicImage) -> Result<RemovalResult> {
        let total_start = Instant::now();
        let mut timings = ProcessingTimings::default();
        let original_dimensions = (image.width(), image.height());

        let preprocessing_config = {
            let mut backend = self.lock_backend();
            if let Some(load_time) = backend.initialize()? {
                timings.model_load_ms = load_time.as_millis() as u64;
            }
            backend.preprocessing_config()
        };

        let input_tensor = {
            let _span = span!(
                Level::DEBUG,
                "preprocessing",
                original_width = %original_dimensions.0,
                original_height = %original_dimensions.1
            )
            .entered();
            let start = Instant::now();
            let tensor = ImagePreprocessor::preprocess_for_inference(image, &preprocessing_config)?;
            timings.preprocessing_ms = start.elapsed().as_millis() as u64;
            tensor
        };

        let output_tensor = {
            let _span = span!(Level::DEBUG, "inference", backend = %self.backend_type).entered();
            let start = Instant::now();
            let output = self.lock_backend().infer(&input_tensor)?;
            timings.inference_ms = start.elapsed().as_millis() as u64;
            output
        };

        let (mask, cutout) = {
            let _span = span!(
                Level::DEBUG,
                "background_removal",
                width = %original_dimensions.0,
                height = %original_dimensions.1
            )
            .entered();
            let start = Instant::now();
            let mask = Self::tensor_to_mask(&output_tensor, original_dimensions)?;
            let cutout = mask.apply_to_image(&image.to_rgba8())?;
            timings.postprocessing_ms = start.elapsed().as_millis() as u64;
            (mask, cutout)
        };

        timings.total_ms = total_start.elapsed().as_millis() as u64;
        Ok(RemovalResult::new(cutout, mask, original_dimensions, timings))
    }

    /// Remove the background and return the cut-out as PNG bytes
    ///
    /// # Errors
    /// - Any pipeline failure
    /// - PNG encoding failures
    pub fn remove_background_png(&self, image_bytes: &[u8]) -> Result<Vec<u8>> {
        let mut result = self.process_bytes(image_bytes)?;

        let encode_start = Instant::now();
        let png = result.to_png_bytes()?;
        result.timings.image_encode_ms = encode_start.elapsed().as_millis() as u64;
        result.timings.total_ms += result.timings.image_encode_ms;

        let stats = result.mask.statistics();
        debug!(
            width = result.original_dimensions.0,
            height = result.original_dimensions.1,
            output_bytes = png.len(),
            foreground_ratio = %format!("{:.3}", stats.foreground_ratio),
            timings = ?result.timings,
            "✅ Background removed in {}ms",
            result.timings.total_ms
        );

        Ok(png)
    }

    /// Convert the model's first output channel to a mask at the original size
    ///
    /// The prediction is min-max normalized; a constant prediction yields an
    /// all-background mask.
    fn tensor_to_mask(
        tensor: &Array4<f32>,
        original_dimensions: (u32, u32),
    ) -> Result<SegmentationMask> {
        let (batch, channels, height, width) = tensor.dim();
        if batch == 0 || channels == 0 || height == 0 || width == 0 {
            return Err(BgRemovalError::processing_stage_error(
                "postprocessing",
                "model output is empty",
                Some(&format!("{:?}", tensor.shape())),
            ));
        }

        let prediction = tensor.slice(s![0, 0, .., ..]);
        let (min, max) = prediction
            .iter()
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
                (lo.min(v), hi.max(v))
            });
        let range = max - min;

        let data: Vec<u8> = if range > f32::EPSILON && range.is_finite() {
            prediction
                .iter()
                .map(|&v| (((v - min) / range) * 255.0) as u8)
                .collect()
        } else {
            vec![0; height * width]
        };

        let mask = SegmentationMask::new(data, (width as u32, height as u32));
        mask.resize(original_dimensions.0, original_dimensions.1)
    }

    fn lock_backend(&self) -> MutexGuard<'_, Box<dyn InferenceBackend>> {
        self.backend.lock().unwrap_or_else(|poisoned| {
            warn!(
                backend = %self.backend_type,
                "Recovering inference backend after a panicked request"
            );
            self.backend.clear_poison();
            PoisonError::into_inner(poisoned)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::test_utils::{encode_image, split_image, MockBackend};
    use image::{ImageFormat, Rgba, RgbaImage};

    fn mock_processor() -> BackgroundRemovalProcessor {
        BackgroundRemovalProcessor::from_backend(Box::new(MockBackend::new()), BackendType::Onnx)
    }

    #[test]
    fn test_process_bytes_cuts_out_foreground() {
        let processor = mock_processor();
        let png = encode_image(&split_image(64, 40), ImageFormat::Png);

        let result = processor.process_bytes(&png).unwrap();

        assert_eq!(result.dimensions(), (64, 40));
        assert_eq!(result.original_dimensions, (64, 40));
        let left = result.image.get_pixel(4, 20);
        assert!(left[0] >= 250 && left[3] >= 250);
        assert_eq!(&left.0[1..3], &[0, 0]);
        assert_eq!(result.image.get_pixel(60, 20), &Rgba([0, 0, 0, 0]));
    }

    #[test]
    fn test_process_jpeg_input() {
        let processor = mock_processor();
        let jpeg = encode_image(&split_image(50, 30), ImageFormat::Jpeg);

        let result = processor.process_bytes(&jpeg).unwrap();

        assert_eq!(result.dimensions(), (50, 30));
    }

    #[test]
    fn test_constant_prediction_is_fully_transparent() {
        let processor = mock_processor();
        let uniform = RgbaImage::from_pixel(16, 16, Rgba([90, 90, 90, 255]));

        let result = processor
            .process_image(&DynamicImage::ImageRgba8(uniform))
            .unwrap();

        assert!(result.image.pixels().all(|p| *p == Rgba([0, 0, 0, 0])));
        assert_eq!(result.mask.statistics().foreground_pixels, 0);
    }

    #[test]
    fn test_remove_background_png_returns_png() {
        let processor = mock_processor();
        let png = encode_image(&split_image(20, 10), ImageFormat::Png);

        let output = processor.remove_background_png(&png).unwrap();

        assert_eq!(&output[..8], b"\x89PNG\r\n\x1a\n");
        let decoded = image::load_from_memory_with_format(&output, ImageFormat::Png).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (20, 10));
    }

    /// JPEG whose EXIF block carries the given orientation tag
    fn jpeg_with_orientation(image: &RgbaImage, orientation: u8) -> Vec<u8> {
        let jpeg = encode_image(image, ImageFormat::Jpeg);

        let mut tiff = b"MM\0*\0\0\0\x08".to_vec();
        tiff.extend_from_slice(&[0x00, 0x01]);
        tiff.extend_from_slice(&[0x01, 0x12, 0x00, 0x03, 0x00, 0x00, 0x00, 0x01]);
        tiff.extend_from_slice(&[0x00, orientation, 0x00, 0x00]);
        tiff.extend_from_slice(&[0x00; 4]);

        let mut payload = b"Exif\0\0".to_vec();
        payload.extend_from_slice(&tiff);
        let segment_len = u16::try_from(payload.len() + 2).unwrap();

        let mut out = jpeg[..2].to_vec();
        out.extend_from_slice(&[0xFF, 0xE1]);
        out.extend_from_slice(&segment_len.to_be_bytes());
        out.extend_from_slice(&payload);
        out.extend_from_slice(&jpeg[2..]);
        out
    }

    #[test]
    fn test_decode_applies_exif_rotation() {
        let jpeg = jpeg_with_orientation(&split_image(40, 20), 6);

        let decoded = BackgroundRemovalProcessor::decode_image(&jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (20, 40));

        let result = mock_processor().process_bytes(&jpeg).unwrap();
        assert_eq!(result.dimensions(), (20, 40));
        assert_eq!(result.original_dimensions, (20, 40));
    }

    #[test]
    fn test_decode_keeps_upright_exif_orientation() {
        let jpeg = jpeg_with_orientation(&split_image(40, 20), 1);

        let decoded = BackgroundRemovalProcessor::decode_image(&jpeg).unwrap();

        assert_eq!((decoded.width(), decoded.height()), (40, 20));
    }

    #[test]
    fn test_corrupt_and_empty_input_fail() {
        let processor = mock_processor();

        let err = processor.process_bytes(b"definitely not an image").unwrap_err();
        assert!(err.to_string().contains("decode"));

        let err = processor.process_bytes(&[]).unwrap_err();
        assert!(err.to_string().contains("empty"));
    }

    #[test]
    fn test_inference_failure_propagates() {
        let processor = BackgroundRemovalProcessor::from_backend(
            Box::new(MockBackend::new_failing_inference()),
            BackendType::Tract,
        );
        let png = encode_image(&split_image(8, 8), ImageFormat::Png);

        let err = processor.process_bytes(&png).unwrap_err();
        assert!(matches!(err, BgRemovalError::Inference(_)));
    }

    #[test]
    fn test_warm_up_loads_once() {
        let backend = MockBackend::new();
        let history = backend.call_history();
        let processor = BackgroundRemovalProcessor::from_backend(Box::new(backend), BackendType::Onnx);

        assert!(!processor.is_initialized());
        assert!(processor.warm_up().unwrap().is_some());
        assert!(processor.warm_up().unwrap().is_none());
        assert!(processor.is_initialized());

        let png = encode_image(&split_image(8, 8), ImageFormat::Png);
        let result = processor.process_bytes(&png).unwrap();
        assert_eq!(result.timings.model_load_ms, 0);
        assert_eq!(history.lock().unwrap().iter().filter(|c| *c == "infer").count(), 1);
    }

    #[test]
    fn test_warm_up_failure() {
        let processor = BackgroundRemovalProcessor::from_backend(
            Box::new(MockBackend::new_failing_init()),
            BackendType::Onnx,
        );

        assert!(processor.warm_up().is_err());
        assert!(!processor.is_initialized());
    }

    #[test]
    fn test_panicked_inference_does_not_break_later_requests() {
        let processor = BackgroundRemovalProcessor::from_backend(
            Box::new(MockBackend::new_panicking_once()),
            BackendType::Onnx,
        );
        let png = encode_image(&split_image(16, 12), ImageFormat::Png);

        let panicking = processor.clone();
        let input = png.clone();
        let first = std::thread::spawn(move || panicking.process_bytes(&input)).join();
        assert!(first.is_err());

        for _ in 0..3 {
            let result = processor.process_bytes(&png).unwrap();
            assert_eq!(result.dimensions(), (16, 12));
        }
        assert!(processor.is_initialized());
        assert!(!processor.backend.is_poisoned());
    }

    #[test]
    fn test_concurrent_requests_keep_their_own_dimensions() {
        let processor = mock_processor();
        let sizes = [(12, 9), (40, 16), (7, 31), (64, 64)];

        std::thread::scope(|scope| {
            let handles: Vec<_> = sizes
                .iter()
                .map(|&(w, h)| {
                    let processor = processor.clone();
                    scope.spawn(move || {
                        let png = encode_image(&split_image(w, h), ImageFormat::Png);
                        processor.process_bytes(&png).unwrap().dimensions()
                    })
                })
                .collect();

            for (handle, expected) in handles.into_iter().zip(sizes) {
                assert_eq!(handle.join().unwrap(), expected);
            }
        });
    }

    #[test]
    fn test_tensor_to_mask_normalizes_range() {
        let mut tensor = Array4::<f32>::from_elem((1, 1, 2, 2), 2.0);
        tensor[[0, 0, 0, 0]] = 4.0;
        tensor[[0, 0, 1, 1]] = 3.0;

        let mask = BackgroundRemovalProcessor::tensor_to_mask(&tensor, (2, 2)).unwrap();

        assert_eq!(mask.dimensions, (2, 2));
        assert_eq!(mask.data, vec![255, 0, 0, 127]);
    }

    #[test]
    fn test_tensor_to_mask_rejects_empty_output() {
        let tensor = Array4::<f32>::zeros((1, 0, 4, 4));
        assert!(BackgroundRemovalProcessor::tensor_to_mask(&tensor, (4, 4)).is_err());
    }

    #[test]
    fn test_default_factory_lists_compiled_backends() {
        let backends = DefaultBackendFactory.available_backends();
        #[cfg(feature = "onnx")]
        assert!(backends.contains(&BackendType::Onnx));
        #[cfg(feature = "tract")]
        assert!(backends.contains(&BackendType::Tract));
        let _ = backends;
    }

    #[cfg(feature = "tract")]
    #[test]
    fn test_new_does_not_load_model() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let config = ServiceConfig::builder()
            .model_dir(temp_dir.path())
            .backend_type(BackendType::Tract)
            .build()
            .unwrap();

        let processor = BackgroundRemovalProcessor::new(&config).unwrap();

        assert!(!processor.is_initialized());
        assert_eq!(processor.backend_type(), BackendType::Tract);
        assert!(processor.warm_up().is_err());
    }
}
