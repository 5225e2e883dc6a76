//! Service entry point
//!
//! Parses arguments (with environment fallbacks), binds the port and serves the
//! HTTP API until shutdown. Model weights are fetched and loaded in the
//! background so `/health` answers from the start.

use super::config::CliConfigBuilder;
use crate::{
    config::{
        ServiceConfig, DEFAULT_MAX_UPLOAD_BYTES, DEFAULT_MODEL_DIR, DEFAULT_MODEL_URL,
        DEFAULT_PORT, SERVICE_NAME,
    },
    download::ModelDownloader,
    models::ModelStore,
    processor::BackgroundRemovalProcessor,
    server::{self, AppState},
};
use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use tokio::net::TcpListener;
use tracing::{error, info};

/// Background removal HTTP microservice
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(name = "rebag-ml-service")]
pub struct Cli {
    /// TCP port to listen on
    #[arg(long, env = "ML_SERVICE_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Address to bind
    #[arg(long, env = "ML_SERVICE_HOST", default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub host: IpAddr,

    /// Directory holding u2net.onnx (created if missing)
    #[arg(long, env = "MODEL_DIR", default_value = DEFAULT_MODEL_DIR)]
    pub model_dir: PathBuf,

    /// Where to download u2net.onnx from when it is missing
    #[arg(long, env = "MODEL_URL", default_value = DEFAULT_MODEL_URL)]
    pub model_url: String,

    /// Expected SHA-256 of the model file
    #[arg(long, env = "MODEL_SHA256")]
    pub model_sha256: Option<String>,

    /// Fail at startup instead of downloading missing weights
    #[arg(long, env = "MODEL_NO_DOWNLOAD")]
    pub no_download: bool,

    /// Inference backend
    #[arg(long, value_enum, env = "INFERENCE_BACKEND", default_value_t = CliBackend::Onnx)]
    pub backend: CliBackend,

    /// ONNX Runtime execution provider
    #[arg(long, value_enum, env = "EXECUTION_PROVIDER", default_value_t = CliExecutionProvider::Auto)]
    pub execution_provider: CliExecutionProvider,

    /// Intra-op threads (0 = auto-detect)
    #[arg(short, long, env = "INFERENCE_THREADS", default_value_t = 0)]
    pub threads: usize,

    /// Maximum accepted request body in bytes
    #[arg(long, env = "MAX_UPLOAD_BYTES", default_value_t = DEFAULT_MAX_UPLOAD_BYTES)]
    pub max_upload_bytes: usize,

    /// Enable verbose logging (-v: DEBUG, -vv: TRACE)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Log output format
    #[arg(long, value_enum, default_value_t = CliLogFormat::Console)]
    pub log_format: CliLogFormat,

    /// Filter directives, overriding -v
    #[arg(long, env = "RUST_LOG")]
    pub log_filter: Option<String>,

    /// Show execution provider diagnostics and exit
    #[arg(long)]
    pub show_providers: bool,

    /// Download the model weights and exit
    #[arg(long)]
    pub only_download: bool,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum, Debug)]
pub enum CliBackend {
    Onnx,
    Tract,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum, Debug)]
pub enum CliExecutionProvider {
    Auto,
    Cpu,
    Cuda,
    #[value(name = "coreml")]
    CoreMl,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum, Debug)]
pub enum CliLogFormat {
    Console,
    Compact,
    #[cfg(feature = "tracing-json")]
    Json,
}

/// Main entry point
pub async fn main() -> Result<()> {
    let cli = Cli::parse();

    CliConfigBuilder::tracing_config(&cli)
        .init()
        .context("Failed to initialize tracing")?;

    if cli.show_providers {
        show_provider_diagnostics();
        return Ok(());
    }

    let config = CliConfigBuilder::from_cli(&cli)?;
    info!(
        backend = %config.backend_type,
        provider = %config.execution_provider,
        model_dir = %config.model_dir().display(),
        "Starting {SERVICE_NAME}"
    );

    if cli.only_download {
        let store = ModelStore::from_config(&config);
        let model_path = ModelDownloader::new()
            .context("Failed to create HTTP client")?
            .ensure_model(&store, &config, true)
            .await
            .context("Failed to prepare model weights")?;
        println!("✅ Model ready at {}", model_path.display());
        return Ok(());
    }

    let processor = BackgroundRemovalProcessor::new(&config)
        .context("Failed to create background removal processor")?;

    let listener = TcpListener::bind(config.socket_addr())
        .await
        .with_context(|| format!("Failed to bind {}", config.socket_addr()))?;
    let local_addr = listener.local_addr()?;
    print_startup_banner(&config, local_addr);

    let preparation = tokio::spawn({
        let processor = processor.clone();
        let config = config.clone();
        async move {
            match crate::prepare_model(&processor, &config, true).await {
                Ok(_) => info!("✅ Model ready, accepting background removal requests"),
                Err(e) => error!(
                    error = %e,
                    "Model preparation failed, /remove-bg will answer 500 until the weights load"
                ),
            }
        }
    });

    let state = AppState::new(config, processor);
    let served = server::serve(listener, state, server::shutdown_signal()).await;
    preparation.abort();
    served.context("Server error")?;

    info!("👋 Server stopped");
    Ok(())
}

fn print_startup_banner(config: &ServiceConfig, local_addr: SocketAddr) {
    let display_host = if local_addr.ip().is_unspecified() {
        "localhost".to_string()
    } else {
        local_addr.ip().to_string()
    };
    let port = local_addr.port();

    println!("🚀 {SERVICE_NAME} listening on {local_addr}");
    println!("📁 Model directory: {}", config.model_dir().display());
    println!("🩺 Health endpoint: http://{display_host}:{port}/health");
    println!("✂️  Remove BG endpoint: POST http://{display_host}:{port}/remove-bg");
}

fn show_provider_diagnostics() {
    println!("🔍 Backend and Execution Provider Diagnostics");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let cpu_count = std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(1);
    println!("💻 System: {cpu_count} CPU cores detected");

    #[cfg(feature = "onnx")]
    {
        println!("\n🚀 onnx (default):");
        for (name, available, description) in crate::backends::OnnxBackend::list_providers() {
            let status = if available { "✅" } else { "❌" };
            println!("  {status} {name}: {description}");
        }
    }

    #[cfg(feature = "tract")]
    {
        println!("\n🦀 tract:");
        for (name, available, description) in crate::backends::TractBackend::list_providers() {
            let status = if available { "✅" } else { "❌" };
            println!("  {status} {name}: {description}");
        }
    }
}
