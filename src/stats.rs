//! `GET /stats` — a snapshot of supervisor and connection counters, always
//! available regardless of whether the source is currently producing data.

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::AppState;

#[derive(Debug, Serialize)]
pub struct BroadcasterSnapshot {
    pub state: &'static str,
    pub running: bool,
}

#[derive(Debug, Serialize)]
pub struct StreamSnapshot {
    pub elapsed_seconds: f64,
    pub chunks_sent: u64,
    pub bytes_sent: u64,
}

#[derive(Debug, Serialize)]
pub struct ConfigSnapshot {
    pub fps: u32,
    pub crf: u32,
    pub audio_bitrate: String,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub broadcaster: BroadcasterSnapshot,
    pub stream: StreamSnapshot,
    pub connections: crate::connection::ConnectionStats,
    pub config: ConfigSnapshot,
}

pub async fn stats_handler(State(state): State<AppState>) -> Json<StatsResponse> {
    let broadcaster_stats = state.broadcaster.stats();
    let connections = state.connection_manager.stats().await;
    let video = state.broadcaster.video_config();

    Json(StatsResponse {
        broadcaster: BroadcasterSnapshot {
            state: broadcaster_stats.state.name(),
            running: broadcaster_stats.running,
        },
        stream: StreamSnapshot {
            elapsed_seconds: broadcaster_stats.stream.elapsed_seconds,
            chunks_sent: broadcaster_stats.stream.chunks_sent,
            bytes_sent: broadcaster_stats.stream.bytes_sent,
        },
        connections,
        config: ConfigSnapshot {
            fps: video.fps,
            crf: video.quality_knobs.effective_crf(),
            audio_bitrate: video.audio_bitrate.clone(),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcaster::Broadcaster;
    use crate::config::{QualityKnobs, VideoConfig};
    use crate::connection::ConnectionManager;
    use axum::body::Body;
    use axum::routing::get;
    use axum::Router;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_state() -> AppState {
        let connection_manager = ConnectionManager::new(4);
        let video = VideoConfig {
            file_path: "video.mp4".to_string(),
            fps: 25,
            audio_bitrate: "96k".to_string(),
            resolution: None,
            chunk_buffer_size: 8,
            quality_knobs: QualityKnobs { crf: 20, quality: None },
            growing_file_hint: false,
        };
        let broadcaster = Broadcaster::new(connection_manager.clone(), video, "ffmpeg".to_string());
        AppState {
            connection_manager,
            broadcaster,
            buffer_capacity: 8,
        }
    }

    #[tokio::test]
    async fn stats_available_with_no_clients_and_stopped_broadcaster() {
        let state = test_state();
        let app = Router::new()
            .route("/stats", get(stats_handler))
            .with_state(state);

        let response = app
            .oneshot(axum::http::Request::get("/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();

        assert_eq!(parsed["broadcaster"]["running"], false);
        assert_eq!(parsed["connections"]["live"], 0);
        assert_eq!(parsed["config"]["fps"], 25);
        assert_eq!(parsed["config"]["crf"], 20);
    }

    #[tokio::test]
    async fn stats_reflect_registered_clients() {
        let state = test_state();
        let _handle = state.connection_manager.register(4).await.unwrap();

        let app = Router::new()
            .route("/stats", get(stats_handler))
            .with_state(state);

        let response = app
            .oneshot(axum::http::Request::get("/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();

        assert_eq!(parsed["connections"]["live"], 1);
        assert_eq!(parsed["connections"]["max"], 4);
    }
}
