use anyhow::{anyhow, Result};
use clap::Parser;
use quicksend::{
    api::{self, AppState},
    network::{self, LanAddress},
};
use quicksend_core::{config::AppConfig, events::EventName};
use serde_json::json;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "quicksend")]
#[command(about = "Share files and text with devices on the local network")]
struct Cli {
    /// Directory holding metadata, settings and accounts
    #[arg(long, env = "QUICKSEND_DATA_DIR", default_value = "data")]
    data_dir: PathBuf,

    /// First port to try; the next free one within 100 is used
    #[arg(short, long, env = "PORT", default_value_t = 5000)]
    port: u16,

    #[arg(long, default_value = "0.0.0.0")]
    host: IpAddr,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    std::fs::create_dir_all(&cli.data_dir)?;
    let config = AppConfig::from_env(&cli.data_dir);
    if !config.telemetry.enabled() {
        info!("telemetry disabled");
    }

    let (state, installed) = AppState::open(&config, Arc::new(LanAddress))?;
    if installed {
        state.track(EventName::Install, json!({}));
    }
    state.track(EventName::AppOpen, json!({}));

    let port = network::find_free_port(cli.host, cli.port)
        .ok_or_else(|| anyhow!("no free port in {}..={}", cli.port, cli.port.saturating_add(100)))?;
    let app = api::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let listener = TcpListener::bind((cli.host, port)).await?;
    info!(addr = %listener.local_addr()?, data_dir = %config.data_dir.display(), "listening");
    if let Some(lan) = network::lan_ip() {
        println!("QuickSend running at http://{lan}:{port}");
    }
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}
