use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::buffer::ClientBuffer;

/// Handle returned to a stream handler on successful admission. Dropping it
/// does not unregister the buffer — callers must call
/// [`ConnectionManager::unregister`] explicitly so unregistration happens
/// exactly once, on the handler's own terms (see the per-connection state
/// machine in the stream handler).
pub struct BufferHandle {
    pub id: u64,
    pub buffer: Arc<ClientBuffer>,
}

pub struct Rejected;

#[derive(Debug, Clone, serde::Serialize)]
pub struct ConnectionStats {
    pub live: usize,
    pub max: usize,
    pub chunks_dropped: u64,
    pub init_cached: bool,
}

/// Process-wide registry of client buffers plus the one-shot init-segment
/// cache. Registration/unregistration/init-publish are serialized by a
/// single lock; `broadcast` takes a snapshot and fans out without holding it.
pub struct ConnectionManager {
    buffers: RwLock<HashMap<u64, Arc<ClientBuffer>>>,
    next_id: AtomicU64,
    max_clients: usize,
    init_segment: RwLock<Option<Bytes>>,
}

impl ConnectionManager {
    pub fn new(max_clients: usize) -> Arc<Self> {
        Arc::new(ConnectionManager {
            buffers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            max_clients: max_clients.max(1),
            init_segment: RwLock::new(None),
        })
    }

    /// Atomic admission: if live buffer count < `max_clients`, allocate a
    /// buffer, assign a unique id, register it, return its handle.
    pub async fn register(&self, buffer_capacity: usize) -> Result<BufferHandle, Rejected> {
        let mut buffers = self.buffers.write().await;
        if buffers.len() >= self.max_clients {
            warn!(
                "connection rejected: at capacity (max_clients={})",
                self.max_clients
            );
            return Err(Rejected);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let buffer = ClientBuffer::new(id, buffer_capacity);
        buffers.insert(id, buffer.clone());
        debug!("client {} registered (live={})", id, buffers.len());

        Ok(BufferHandle { id, buffer })
    }

    /// Mark the buffer closed and remove it from the registry. Idempotent.
    pub async fn unregister(&self, id: u64) {
        let mut buffers = self.buffers.write().await;
        if let Some(buffer) = buffers.remove(&id) {
            buffer.close();
            debug!(
                "client {} unregistered (sent {} chunks, {} bytes, live={})",
                id,
                buffer.stats.chunks_sent.load(Ordering::Relaxed),
                buffer.stats.bytes_sent.load(Ordering::Relaxed),
                buffers.len()
            );
        }
    }

    /// Fan a media chunk out to every registered buffer. Returns the count
    /// of successful enqueues. Buffers observed closed are collected and
    /// swept from the registry afterward.
    pub async fn broadcast(&self, chunk: Bytes) -> usize {
        let snapshot: Vec<Arc<ClientBuffer>> = {
            let buffers = self.buffers.read().await;
            buffers.values().cloned().collect()
        };

        let mut sent = 0usize;
        let mut dead = Vec::new();
        for buffer in &snapshot {
            if buffer.enqueue(chunk.clone()).await {
                sent += 1;
            } else {
                dead.push(buffer.id);
            }
        }

        if !dead.is_empty() {
            let mut buffers = self.buffers.write().await;
            for id in dead {
                buffers.remove(&id);
            }
        }

        sent
    }

    /// Store the one-shot init segment. Subsequent calls are no-ops (I5).
    pub async fn publish_init(&self, segment: Bytes) {
        let mut slot = self.init_segment.write().await;
        if slot.is_none() {
            *slot = Some(segment);
        }
    }

    pub async fn init_segment(&self) -> Option<Bytes> {
        self.init_segment.read().await.clone()
    }

    pub async fn stats(&self) -> ConnectionStats {
        let buffers = self.buffers.read().await;
        let chunks_dropped: u64 = buffers
            .values()
            .map(|b| b.stats.chunks_dropped.load(Ordering::Relaxed))
            .sum();
        let init_cached = self.init_segment.read().await.is_some();

        ConnectionStats {
            live: buffers.len(),
            max: self.max_clients,
            chunks_dropped,
            init_cached,
        }
    }
}
