//! hcloud-k8s-ctl
//!
//! Create, patch and delete Kubernetes clusters on Hetzner Cloud.

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use hkctl_cli::{Cli, Result};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    cli.run().await
}
