//! rebag-ml-service binary
//!
//! HTTP microservice that removes image backgrounds with the U2Net model.

#[cfg(feature = "cli")]
use rebag_ml_service::cli;

#[cfg(feature = "cli")]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    cli::main().await
}

#[cfg(not(feature = "cli"))]
fn main() {
    panic!("CLI feature not enabled. Please rebuild with --features cli");
}
