//! Configuration conversion utilities for CLI arguments

use crate::cli::main_impl::{Cli, CliBackend, CliExecutionProvider, CliLogFormat};
use crate::{
    config::{BackendType, ExecutionProvider, ServiceConfig},
    tracing_config::{TracingConfig, TracingFormat},
};
use anyhow::{Context, Result};

/// Convert CLI arguments to the service configuration
pub(crate) struct CliConfigBuilder;

impl CliConfigBuilder {
    /// Build a validated `ServiceConfig` from CLI arguments
    pub(crate) fn from_cli(cli: &Cli) -> Result<ServiceConfig> {
        ServiceConfig::builder()
            .host(cli.host)
            .port(cli.port)
            .model_dir(&cli.model_dir)
            .model_url(cli.model_url.clone())
            .model_sha256(cli.model_sha256.clone())
            .allow_download(!cli.no_download)
            .backend_type(Self::convert_backend(cli.backend))
            .execution_provider(Self::convert_execution_provider(cli.execution_provider))
            .intra_threads(cli.threads)
            .max_upload_bytes(cli.max_upload_bytes)
            .build()
            .context("Invalid service configuration")
    }

    /// Build the tracing configuration from CLI arguments
    pub(crate) fn tracing_config(cli: &Cli) -> TracingConfig {
        let mut config = TracingConfig::new()
            .with_verbosity(cli.verbose)
            .with_format(Self::convert_log_format(cli.log_format));
        if let Some(filter) = &cli.log_filter {
            config = config.with_env_filter(filter.clone());
        }
        config
    }

    fn convert_backend(backend: CliBackend) -> BackendType {
        match backend {
            CliBackend::Onnx => BackendType::Onnx,
            CliBackend::Tract => BackendType::Tract,
        }
    }

    fn convert_execution_provider(provider: CliExecutionProvider) -> ExecutionProvider {
        match provider {
            CliExecutionProvider::Auto => ExecutionProvider::Auto,
            CliExecutionProvider::Cpu => ExecutionProvider::Cpu,
            CliExecutionProvider::Cuda => ExecutionProvider::Cuda,
            CliExecutionProvider::CoreMl => ExecutionProvider::CoreMl,
        }
    }

    fn convert_log_format(format: CliLogFormat) -> TracingFormat {
        match format {
            CliLogFormat::Console => TracingFormat::Console,
            CliLogFormat::Compact => TracingFormat::Compact,
            #[cfg(feature = "tracing-json")]
            CliLogFormat::Json => TracingFormat::Json,
        }
    }
}
