//! BuildIt API Server

use buildit_api::{AppState, routes};
use clap::Parser;
use std::path::PathBuf;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "buildit-server")]
#[command(about = "BuildIt build server", long_about = None)]
struct Args {
    /// System configuration file (KDL)
    #[arg(short, long, env = "BUILDIT_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address, overriding the configuration file
    #[arg(short, long)]
    listen: Option<String>,

    /// Log output as JSON
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if args.json_logs {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let mut config = buildit_config::load_system_config(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        config.listen = listen;
    }

    info!(
        root = %config.root.display(),
        executors = config.executors.len(),
        grants = config.authorization.grants.len(),
        "Opening build root"
    );
    let state = AppState::open(&config)?;
    let scheduler = state.scheduler.clone();
    scheduler.start();

    let app = routes::router(state).layer(TraceLayer::new_for_http());

    let listener = TcpListener::bind(&config.listen).await?;
    info!("Starting server on {}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down");
        })
        .await?;

    scheduler.shutdown().await;
    Ok(())
}
