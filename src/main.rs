use clap::Parser;
use tracing::info;

use livefeed::config::{AppConfig, Cli};
use livefeed::{build_state, router};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let filter = match &cli.log_level {
        Some(level) => tracing_subscriber::EnvFilter::new(level),
        None => tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = AppConfig::from_env();

    info!(
        "source={} kind={:?} fps={} crf={} max_clients={}",
        config.video.file_path,
        config.video.source_kind(),
        config.video.fps,
        config.video.quality_knobs.effective_crf(),
        config.server.max_clients,
    );

    let state = build_state(&config, cli.transcoder);
    let broadcaster = state.broadcaster.clone();
    let app = router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    info!("listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(broadcaster))
        .await?;
    Ok(())
}

/// Waits for Ctrl-C, then stops the broadcaster (killing its transcoder
/// child and joining the reader task) before letting the server finish
/// draining in-flight responses.
async fn shutdown_signal(broadcaster: std::sync::Arc<livefeed::broadcaster::Broadcaster>) {
    if tokio::signal::ctrl_c().await.is_err() {
        return;
    }
    info!("shutdown signal received, stopping broadcaster");
    broadcaster.stop().await;
}
