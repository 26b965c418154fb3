use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use machinist_service::{app, ServiceState};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "machinist-service")]
#[command(about = "HTTP service for Machinist machine records")]
struct Args {
    #[arg(long, default_value = "./machinist.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:8080")]
    bind: SocketAddr,
    #[arg(long, default_value_t = 2500)]
    operation_timeout_ms: u64,
    /// Used when `RUST_LOG` is not set.
    #[arg(long, default_value = "info")]
    log_filter: String,
}

fn init_tracing(fallback_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback_filter));
    tracing_subscriber::registry().with(filter).with(tracing_subscriber::fmt::layer()).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_filter);

    let state = ServiceState::new(args.db.clone(), Duration::from_millis(args.operation_timeout_ms));
    state.migrate()?;
    info!(db = %args.db.display(), "machines schema ready");

    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    info!(bind = %args.bind, "machinist service listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}
