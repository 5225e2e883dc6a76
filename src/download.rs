//! Model weights download
//!
//! When the configured model directory does not contain `u2net.onnx`, the weights
//! are streamed from the configured URL into a temporary file next to the final
//! location, optionally verified against a SHA-256 digest, and then renamed into
//! place. A failed download never leaves a partial weights file behind.

use crate::config::ServiceConfig;
use crate::error::{BgRemovalError, Result};
use crate::models::{ModelStore, MODEL_FILE_NAME};
use futures_util::stream::TryStreamExt;
#[cfg(feature = "cli")]
use indicatif::{ProgressBar, ProgressStyle};
use reqwest::Client;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio_util::io::StreamReader;

/// Model downloader with progress reporting
#[derive(Debug)]
pub struct ModelDownloader {
    client: Client,
}

/// Progress bar abstraction that works with and without CLI features
#[derive(Debug)]
pub enum ProgressIndicator {
    #[cfg(feature = "cli")]
    Indicatif(ProgressBar),
    NoOp,
}

impl ProgressIndicator {
    /// Set message for progress indicator
    pub fn set_message(&self, msg: String) {
        match self {
            #[cfg(feature = "cli")]
            Self::Indicatif(pb) => pb.set_message(msg),
            Self::NoOp => {
                let _ = msg;
            },
        }
    }

    /// Set length for progress indicator
    pub fn set_length(&self, len: u64) {
        match self {
            #[cfg(feature = "cli")]
            Self::Indicatif(pb) => pb.set_length(len),
            Self::NoOp => {
                let _ = len;
            },
        }
    }

    /// Set position for progress indicator
    pub fn set_position(&self, pos: u64) {
        match self {
            #[cfg(feature = "cli")]
            Self::Indicatif(pb) => pb.set_position(pos),
            Self::NoOp => {
                let _ = pos;
            },
        }
    }

    /// Finish progress indicator with message
    pub fn finish_with_message(&self, msg: String) {
        match self {
            #[cfg(feature = "cli")]
            Self::Indicatif(pb) => pb.finish_with_message(msg),
            Self::NoOp => {
                let _ = msg;
            },
        }
    }
}

impl ModelDownloader {
    /// Create a new model downloader
    ///
    /// # Errors
    /// - Failed to create HTTP client
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(300))
            .build()
            .map_err(|e| BgRemovalError::network_error("Failed to create HTTP client", e))?;

        Ok(Self { client })
    }

    /// Make sure the weights are present in the configured model directory
    ///
    /// Creates the directory, downloads the weights if they are missing (and the
    /// configuration allows it) and verifies the optional SHA-256 digest.
    ///
    /// # Errors
    /// - Model directory cannot be created
    /// - Weights missing while downloads are disabled
    /// - Network errors or non-success HTTP status during download
    /// - Digest mismatch
    pub async fn ensure_model(
        &self,
        store: &ModelStore,
        config: &ServiceConfig,
        show_progress: bool,
    ) -> Result<PathBuf> {
        store.ensure_dir()?;
        let model_path = store.model_path();
        let expected_hash = config.model_sha256.as_deref();

        if store.is_model_available() {
            tracing::info!(path = %model_path.display(), "Model weights already present");
            if !Self::verify_file_integrity(&model_path, expected_hash)? {
                return Err(BgRemovalError::model_error_with_context(
                    "verify",
                    &model_path,
                    "SHA-256 digest does not match",
                    &["delete the file to download it again", "check MODEL_SHA256"],
                ));
            }
            return Ok(model_path);
        }

        if !config.allow_download {
            return Err(BgRemovalError::model_error_with_context(
                "locate",
                &model_path,
                "file not found and downloads are disabled",
                &["copy u2net.onnx into the model directory", "unset MODEL_NO_DOWNLOAD"],
            ));
        }

        self.download_model(&config.model_url, &model_path, expected_hash, show_progress)
            .await?;
        Ok(model_path)
    }

    /// Download the weights from `url` to `model_path` atomically
    ///
    /// # Errors
    /// - Network errors during download
    /// - File system errors while writing or renaming
    /// - Digest mismatch
    pub async fn download_model(
        &self,
        url: &str,
        model_path: &Path,
        expected_hash: Option<&str>,
        show_progress: bool,
    ) -> Result<()> {
        tracing::info!(%url, path = %model_path.display(), "Downloading model weights");

        let temp_path = Self::temp_path_for(model_path);
        let progress = if show_progress {
            Some(Self::create_progress_indicator())
        } else {
            None
        };

        let outcome = match self.download_file(url, &temp_path, progress.as_ref()).await {
            Ok(bytes) => match Self::verify_file_integrity(&temp_path, expected_hash) {
                Ok(true) => Ok(bytes),
                Ok(false) => Err(BgRemovalError::model_error_with_context(
                    "verify",
                    model_path,
                    "SHA-256 digest of the download does not match",
                    &["check MODEL_URL", "check MODEL_SHA256"],
                )),
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };

        match outcome {
            Ok(bytes) => {
                fs::rename(&temp_path, model_path).map_err(|e| {
                    BgRemovalError::file_io_error("move downloaded model into place", model_path, &e)
                })?;

                if let Some(pb) = progress {
                    pb.finish_with_message(format!("✅ Downloaded {}", MODEL_FILE_NAME));
                }

                #[allow(clippy::cast_precision_loss)]
                let size_mb = bytes as f64 / (1024.0 * 1024.0);
                tracing::info!(size_mb = %format!("{size_mb:.1}"), "Model download complete");
                Ok(())
            },
            Err(e) => {
                if temp_path.exists() {
                    if let Err(cleanup_err) = fs::remove_file(&temp_path) {
                        tracing::warn!("Failed to remove partial download: {}", cleanup_err);
                    }
                }

                if let Some(pb) = progress {
                    pb.finish_with_message("❌ Download failed".to_string());
                }

                Err(e)
            },
        }
    }

    /// Temporary file used while downloading, in the same directory as the target
    fn temp_path_for(model_path: &Path) -> PathBuf {
        let file_name = model_path
            .file_name()
            .map_or_else(|| MODEL_FILE_NAME.into(), std::ffi::OsStr::to_os_string);
        let mut temp_name = std::ffi::OsString::from(".");
        temp_name.push(file_name);
        temp_name.push(".part");
        model_path.with_file_name(temp_name)
    }

    /// Create a progress indicator for download reporting
    fn create_progress_indicator() -> ProgressIndicator {
        #[cfg(feature = "cli")]
        {
            let pb = ProgressBar::new(100);
            if let Ok(style) = ProgressStyle::default_bar().template(
                "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}",
            ) {
                pb.set_style(style.progress_chars("#>-"));
            }
            ProgressIndicator::Indicatif(pb)
        }
        #[cfg(not(feature = "cli"))]
        {
            ProgressIndicator::NoOp
        }
    }

    /// Download a single file with progress reporting, returning the byte count
    async fn download_file(
        &self,
        url: &str,
        local_path: &Path,
        progress: Option<&ProgressIndicator>,
    ) -> Result<u64> {
        tracing::debug!("Downloading: {} -> {}", url, local_path.display());

        if let Some(parent) = local_path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| BgRemovalError::file_io_error("create directory", parent, &e))?;
        }

        let response =
            self.client.get(url).send().await.map_err(|e| {
                BgRemovalError::network_error(format!("Failed to download {}", url), e)
            })?;

        if !response.status().is_success() {
            return Err(BgRemovalError::network_error(
                format!("Failed to download {}", url),
                format!("HTTP status {}", response.status()),
            ));
        }

        let total_size = response.content_length();
        if let (Some(pb), Some(total)) = (progress, total_size) {
            pb.set_length(total);
        }

        let mut file = tokio::fs::File::create(local_path)
            .await
            .map_err(|e| BgRemovalError::file_io_error("create file", local_path, &e))?;

        let mut stream = StreamReader::new(
            response
                .bytes_stream()
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)),
        );

        let mut downloaded = 0u64;
        let mut buffer = vec![0; 64 * 1024];

        loop {
            let bytes_read = tokio::io::AsyncReadExt::read(&mut stream, &mut buffer)
                .await
                .map_err(|e| BgRemovalError::network_error("Failed to read download stream", e))?;

            if bytes_read == 0 {
                break;
            }

            file.write_all(buffer.get(..bytes_read).unwrap_or(&[]))
                .await
                .map_err(|e| BgRemovalError::file_io_error("write to file", local_path, &e))?;

            downloaded += bytes_read as u64;

            if let Some(pb) = progress {
                if total_size.is_some() {
                    pb.set_position(downloaded);
                } else {
                    pb.set_message(format!(
                        "Downloaded {:.1} MB",
                        downloaded as f64 / 1_048_576.0
                    ));
                }
            }
        }

        file.flush()
            .await
            .map_err(|e| BgRemovalError::file_io_error("flush file", local_path, &e))?;

        if downloaded == 0 {
            return Err(BgRemovalError::network_error(
                format!("Failed to download {}", url),
                "empty response body",
            ));
        }

        tracing::debug!(
            "Downloaded {} bytes to {}",
            downloaded,
            local_path.display()
        );
        Ok(downloaded)
    }

    /// Verify a file against a SHA-256 digest; `None` skips the check
    ///
    /// # Errors
    /// - File cannot be read
    pub fn verify_file_integrity(file_path: &Path, expected_hash: Option<&str>) -> Result<bool> {
        let Some(expected) = expected_hash else {
            return Ok(true);
        };

        let mut file = fs::File::open(file_path).map_err(|e| {
            BgRemovalError::file_io_error("read file for verification", file_path, &e)
        })?;

        let mut hasher = Sha256::new();
        std::io::copy(&mut file, &mut hasher).map_err(|e| {
            BgRemovalError::file_io_error("read file for verification", file_path, &e)
        })?;
        let actual_hash = format!("{:x}", hasher.finalize());

        if actual_hash.eq_ignore_ascii_case(expected) {
            Ok(true)
        } else {
            tracing::warn!(
                "File integrity check failed for {}: expected {}, got {}",
                file_path.display(),
                expected,
                actual_hash
            );
            Ok(false)
        }
    }
}
