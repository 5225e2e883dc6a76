//! Service configuration
//!
//! `ServiceConfig` is built once at process start and then shared read-only by the
//! HTTP layer and the model adapter. Nothing in the library reads the process
//! environment; the binary resolves flags and environment variables and hands the
//! finished value down.

use crate::error::{BgRemovalError, Result};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

/// Service name reported by the liveness endpoint
pub const SERVICE_NAME: &str = "rebag-ml-service";

/// Default TCP port (`ML_SERVICE_PORT`)
pub const DEFAULT_PORT: u16 = 5050;

/// Default model weights directory (`MODEL_DIR`)
pub const DEFAULT_MODEL_DIR: &str = "./model";

/// Public release location of the U2Net weights
pub const DEFAULT_MODEL_URL: &str =
    "https://github.com/danielgatis/rembg/releases/download/v0.0.0/u2net.onnx";

/// Default request body limit (25 MiB)
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 25 * 1024 * 1024;

/// Execution provider options for ONNX Runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ExecutionProvider {
    /// Auto-detect best available provider (CUDA > `CoreML` > CPU)
    #[default]
    Auto,
    /// CPU execution (always available)
    Cpu,
    /// NVIDIA CUDA GPU acceleration
    Cuda,
    /// Apple Silicon acceleration
    CoreMl,
}

impl std::fmt::Display for ExecutionProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda => write!(f, "cuda"),
            Self::CoreMl => write!(f, "coreml"),
        }
    }
}

/// Inference engine used to run the segmentation model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum BackendType {
    /// ONNX Runtime backend (supports GPU acceleration)
    #[default]
    Onnx,
    /// Tract backend (pure Rust, no external dependencies)
    Tract,
}

impl std::fmt::Display for BackendType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Onnx => write!(f, "onnx"),
            Self::Tract => write!(f, "tract"),
        }
    }
}

/// Process-wide, immutable service configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Address the HTTP server binds to
    pub host: IpAddr,
    /// TCP port the HTTP server binds to
    pub port: u16,
    /// Directory holding the model weights
    pub model_dir: PathBuf,
    /// Where to fetch the weights when they are missing
    pub model_url: String,
    /// Optional SHA-256 (hex) the weights file must match
    pub model_sha256: Option<String>,
    /// Whether a missing weights file may be downloaded
    pub allow_download: bool,
    /// Inference engine
    pub backend_type: BackendType,
    /// Execution provider for the ONNX backend
    pub execution_provider: ExecutionProvider,
    /// Number of intra-op threads (0 = auto)
    pub intra_threads: usize,
    /// Maximum accepted request body size in bytes
    pub max_upload_bytes: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            model_dir: PathBuf::from(DEFAULT_MODEL_DIR),
            model_url: DEFAULT_MODEL_URL.to_string(),
            model_sha256: None,
            allow_download: true,
            backend_type: BackendType::default(),
            execution_provider: ExecutionProvider::default(),
            intra_threads: 0,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
        }
    }
}

impl ServiceConfig {
    /// Create a new configuration builder
    #[must_use]
    pub fn builder() -> ServiceConfigBuilder {
        ServiceConfigBuilder::new()
    }

    /// Socket address the server binds to
    #[must_use]
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    /// Model directory as a path
    #[must_use]
    pub fn model_dir(&self) -> &Path {
        &self.model_dir
    }

    /// Validate the configuration
    ///
    /// # Errors
    /// - Port 0
    /// - Empty model directory
    /// - Zero upload limit
    /// - Model URL that is not http(s)
    /// - Malformed SHA-256 digest
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(BgRemovalError::invalid_config(
                "Port must be between 1 and 65535",
            ));
        }

        if self.model_dir.as_os_str().is_empty() {
            return Err(BgRemovalError::invalid_config(
                "Model directory must not be empty",
            ));
        }

        if self.max_upload_bytes == 0 {
            return Err(BgRemovalError::invalid_config(
                "Maximum upload size must be greater than 0",
            ));
        }

        if !(self.model_url.starts_with("https://") || self.model_url.starts_with("http://")) {
            return Err(BgRemovalError::invalid_config(format!(
                "Unsupported model URL: {}. Expected an http(s) URL",
                self.model_url
            )));
        }

        if let Some(ref digest) = self.model_sha256 {
            if digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(BgRemovalError::invalid_config(format!(
                    "Invalid model SHA-256 digest: {digest}"
                )));
            }
        }

        Ok(())
    }
}

/// Builder for `ServiceConfig`
#[derive(Debug, Default)]
pub struct ServiceConfigBuilder {
    config: ServiceConfig,
}

impl ServiceConfigBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn host(mut self, host: IpAddr) -> Self {
        self.config.host = host;
        self
    }

    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    #[must_use]
    pub fn model_dir<P: Into<PathBuf>>(mut self, model_dir: P) -> Self {
        self.config.model_dir = model_dir.into();
        self
    }

    #[must_use]
    pub fn model_url<S: Into<String>>(mut self, url: S) -> Self {
        self.config.model_url = url.into();
        self
    }

    #[must_use]
    pub fn model_sha256(mut self, digest: Option<String>) -> Self {
        self.config.model_sha256 = digest.map(|d| d.to_ascii_lowercase());
        self
    }

    #[must_use]
    pub fn allow_download(mut self, allow: bool) -> Self {
        self.config.allow_download = allow;
        self
    }

    #[must_use]
    pub fn backend_type(mut self, backend_type: BackendType) -> Self {
        self.config.backend_type = backend_type;
        self
    }

    #[must_use]
    pub fn execution_provider(mut self, provider: ExecutionProvider) -> Self {
        self.config.execution_provider = provider;
        self
    }

    #[must_use]
    pub fn intra_threads(mut self, threads: usize) -> Self {
        self.config.intra_threads = threads;
        self
    }

    #[must_use]
    pub fn max_upload_bytes(mut self, bytes: usize) -> Self {
        self.config.max_upload_bytes = bytes;
        self
    }

    /// Build and validate the configuration
    ///
    /// # Errors
    /// Returns `BgRemovalError::InvalidConfig` when validation fails
    pub fn build(self) -> Result<ServiceConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
