use std::net::SocketAddr;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use planvm_config::Config;

#[derive(Debug, Parser)]
#[command(name = "planvm-server", about = "Plan execution engine HTTP API")]
struct Args {
    #[arg(long, default_value = "127.0.0.1:5000")]
    listen: SocketAddr,
    /// Number of task execution workers.
    #[arg(long, default_value_t = 4)]
    workers: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = Config::from_env().context("failed to load configuration")?;

    let state = planvm_server::bootstrap(&config, args.workers).await?;
    let router = planvm_server::router(state, &config.cors_origins);

    tracing::info!(listen = %args.listen, "server listening");
    let listener = tokio::net::TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("failed to bind {}", args.listen))?;
    axum::serve(listener, router).await?;
    Ok(())
}
