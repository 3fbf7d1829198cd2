pub mod broadcaster;
pub mod buffer;
pub mod config;
pub mod connection;
pub mod init_parser;
pub mod static_files;
pub mod stats;
pub mod stream;

use std::sync::Arc;

use axum::routing::get;
use axum::Router;

use broadcaster::Broadcaster;
use config::AppConfig;
use connection::ConnectionManager;

/// Shared application state, handed to every handler via axum's `State`
/// extractor. Cheap to clone: everything of substance lives behind an `Arc`.
#[derive(Clone)]
pub struct AppState {
    pub connection_manager: Arc<ConnectionManager>,
    pub broadcaster: Arc<Broadcaster>,
    pub buffer_capacity: usize,
}

/// Builds the shared application state without wiring it into a router.
/// Split out from [`create_app`] so callers that need the [`Broadcaster`]
/// handle after startup (e.g. to stop it on graceful shutdown) can hold
/// onto it instead of it being buried inside the returned `Router`.
pub fn build_state(config: &AppConfig, transcoder_bin: String) -> AppState {
    let connection_manager = ConnectionManager::new(config.server.max_clients);
    let broadcaster = Broadcaster::new(
        Arc::clone(&connection_manager),
        config.video.clone(),
        transcoder_bin,
    );

    AppState {
        connection_manager,
        broadcaster,
        buffer_capacity: config.video.chunk_buffer_size,
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(static_files::index_handler))
        .route("/stream", get(stream::stream_handler))
        .route("/stats", get(stats::stats_handler))
        .route("/{*file}", get(static_files::file_handler))
        .with_state(state)
}

pub fn create_app(config: &AppConfig, transcoder_bin: String) -> Router {
    router(build_state(config, transcoder_bin))
}
