use clap::Parser;
use std::net::SocketAddr;
use stratum::cli::Cli;
use stratum::config::{LogFormat, Settings};
use stratum::{create_app, AppContext};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let settings = Settings::new_with_cli(&cli)?;

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("stratum=info,tower_http=info"));
    match settings.logging.format {
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
        LogFormat::Pretty => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }

    info!(
        "Starting Stratum on {}:{} (upstream {})",
        settings.server.host,
        settings.server.port,
        settings.upstream.endpoint()
    );

    let ctx = AppContext::from_settings(&settings).await?;
    let store = ctx.store.clone();
    let app = create_app(&ctx);

    // Start server
    let addr: SocketAddr = format!("{}:{}", settings.server.host, settings.server.port).parse()?;
    info!("Listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await?;

    if let Some(store) = store {
        store.close().await;
    }

    Ok(())
}
