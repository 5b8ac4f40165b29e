use clap::Parser;
use code_sandbox::{IsolationPolicy, SandboxConfig};
use code_sandbox_server::{create_app_from_config, run_server};
use std::{net::SocketAddr, path::PathBuf};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to listen on
    #[arg(short, long, default_value = "0.0.0.0:3000")]
    addr: SocketAddr,

    /// Sandbox configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Isolation policy: container-only, prefer-container or local-only
    #[arg(short, long)]
    isolation: Option<IsolationPolicy>,

    /// Maximum number of concurrent executions
    #[arg(short, long)]
    max_concurrent: Option<usize>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => SandboxConfig::from_file(path)?,
        None => SandboxConfig::default(),
    };
    if let Some(isolation) = args.isolation {
        config.isolation = isolation;
    }
    if let Some(max_concurrent) = args.max_concurrent {
        config.max_concurrent = max_concurrent;
    }
    config.validate()?;

    info!(
        "Sandbox isolation {:?}, {} concurrent executions",
        config.isolation, config.max_concurrent
    );

    let app = create_app_from_config(config).await?;
    run_server(app, args.addr).await?;

    Ok(())
}
