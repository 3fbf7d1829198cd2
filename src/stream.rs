//! Per-connection HTTP streaming protocol: admission, then an immediately
//! open `200` response whose body waits for the cached init segment before
//! forwarding media chunks for the life of the response.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use tracing::{info, warn};

use crate::connection::ConnectionManager;
use crate::AppState;

const INIT_WAIT_TIMEOUT: Duration = Duration::from_secs(10);
const INIT_POLL_INTERVAL: Duration = Duration::from_millis(100);
const DEQUEUE_TIMEOUT: Duration = Duration::from_secs(5);

/// Keeps a client's registration alive for as long as the response body is
/// alive. Dropped when the body is dropped — by normal end-of-stream or,
/// more commonly, because the HTTP layer stopped polling it on client
/// disconnect. `unregister` is async, so the drop hands off to a detached
/// task rather than blocking.
struct ConnectionGuard {
    id: u64,
    manager: std::sync::Arc<ConnectionManager>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let manager = std::sync::Arc::clone(&self.manager);
        let id = self.id;
        tokio::spawn(async move {
            manager.unregister(id).await;
        });
    }
}

/// Phase of the per-connection state machine the body stream drives once
/// the `200` response has already gone out: wait for the cached init
/// segment (bounded), then forward media chunks until the buffer closes.
enum Phase {
    AwaitingInit { waited: Duration },
    Streaming,
}

pub async fn stream_handler(State(state): State<AppState>) -> Response {
    state.broadcaster.start();

    let handle = match state.connection_manager.register(state.buffer_capacity).await {
        Ok(handle) => handle,
        Err(_) => {
            warn!("stream request rejected: at capacity");
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                "stream at capacity, try again later",
            )
                .into_response();
        }
    };

    info!("client {} admitted", handle.id);

    let guard = ConnectionGuard {
        id: handle.id,
        manager: Arc::clone(&state.connection_manager),
    };
    let client_id = handle.id;
    let buffer = handle.buffer;
    let connection_manager = Arc::clone(&state.connection_manager);

    // The body stream is lazy: nothing below runs until the HTTP layer
    // starts polling the body, which happens only after these headers have
    // already gone out. The init wait (and its timeout) therefore happens
    // against an already-open 200 response, not before it.
    let body_stream = futures::stream::unfold(
        (Phase::AwaitingInit { waited: Duration::ZERO }, buffer, connection_manager, client_id),
        |(phase, buffer, connection_manager, client_id)| async move {
            match phase {
                Phase::AwaitingInit { mut waited } => loop {
                    if let Some(segment) = connection_manager.init_segment().await {
                        let next = (Phase::Streaming, buffer, connection_manager, client_id);
                        return Some((Ok::<Bytes, std::io::Error>(segment), next));
                    }
                    if waited >= INIT_WAIT_TIMEOUT {
                        warn!("client {} timed out waiting for init segment", client_id);
                        return None;
                    }
                    tokio::time::sleep(INIT_POLL_INTERVAL).await;
                    waited += INIT_POLL_INTERVAL;
                },
                Phase::Streaming => loop {
                    match buffer.dequeue(DEQUEUE_TIMEOUT).await {
                        Some(chunk) => {
                            let next = (Phase::Streaming, buffer, connection_manager, client_id);
                            return Some((Ok(chunk), next));
                        }
                        None => {
                            if buffer.is_closed() {
                                return None;
                            }
                            // Timed out with no data: source is quiet, keep waiting.
                            continue;
                        }
                    }
                },
            }
        },
    );

    // Moving `guard` into the stream ties its lifetime to the response body.
    let guarded = GuardedBodyStream {
        _guard: guard,
        inner: Box::pin(body_stream),
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "video/mp4")
        .header(header::CACHE_CONTROL, "no-cache, no-store")
        .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        .body(Body::from_stream(guarded))
        .expect("response with a streamed body is always well-formed")
}

struct GuardedBodyStream {
    _guard: ConnectionGuard,
    inner: std::pin::Pin<Box<dyn futures::Stream<Item = Result<Bytes, std::io::Error>> + Send>>,
}

impl futures::Stream for GuardedBodyStream {
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}
