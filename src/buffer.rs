use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use tokio::sync::{Mutex, Notify};

fn now_epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Per-client counters, read by the stats endpoint.
#[derive(Debug, Default)]
pub struct ClientStats {
    pub chunks_sent: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub chunks_dropped: AtomicU64,
    pub connected_at: AtomicU64,
    pub last_activity: AtomicU64,
}

impl ClientStats {
    fn new() -> Self {
        let now = now_epoch_millis();
        ClientStats {
            chunks_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            chunks_dropped: AtomicU64::new(0),
            connected_at: AtomicU64::new(now),
            last_activity: AtomicU64::new(now),
        }
    }

    fn record_delivery(&self, len: usize) {
        self.chunks_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(len as u64, Ordering::Relaxed);
        self.last_activity.store(now_epoch_millis(), Ordering::Relaxed);
    }

    fn record_drop(&self) {
        self.chunks_dropped.fetch_add(1, Ordering::Relaxed);
    }
}

/// A bounded FIFO of media chunks with ring-buffer, drop-oldest backpressure.
///
/// One writer (the broadcast fan-out) and one reader (the client's stream
/// handler) share this buffer; both sides are safe to call concurrently.
pub struct ClientBuffer {
    pub id: u64,
    capacity: usize,
    queue: Mutex<VecDeque<Bytes>>,
    closed: AtomicBool,
    notify: Notify,
    pub stats: ClientStats,
}

impl ClientBuffer {
    pub fn new(id: u64, capacity: usize) -> Arc<Self> {
        Arc::new(ClientBuffer {
            id,
            capacity: capacity.max(1),
            queue: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
            closed: AtomicBool::new(false),
            notify: Notify::new(),
            stats: ClientStats::new(),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Mark the buffer closed; further `enqueue` calls are rejected and the
    /// reader unblocks with `None`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    /// Non-blocking enqueue. Returns `false` if the buffer is closed.
    /// If full, drops the oldest element and retries once (ring-buffer
    /// semantics), incrementing the drop counter.
    pub async fn enqueue(&self, chunk: Bytes) -> bool {
        if self.is_closed() {
            return false;
        }

        let mut queue = self.queue.lock().await;
        if queue.len() >= self.capacity {
            queue.pop_front();
            self.stats.record_drop();
        }
        queue.push_back(chunk);
        drop(queue);
        self.notify.notify_one();
        true
    }

    /// Dequeue with a timeout. Returns `None` on timeout (keeps the caller
    /// alive during source silence) or once the buffer is closed and empty.
    pub async fn dequeue(&self, timeout: Duration) -> Option<Bytes> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            {
                let mut queue = self.queue.lock().await;
                if let Some(chunk) = queue.pop_front() {
                    drop(queue);
                    self.stats.record_delivery(chunk.len());
                    return Some(chunk);
                }
                if self.is_closed() {
                    return None;
                }
            }

            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return None;
            }

            let notified = self.notify.notified();
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(remaining) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn enqueue_dequeue_preserves_order() {
        let buf = ClientBuffer::new(1, 4);
        for i in 0..3u8 {
            assert!(buf.enqueue(Bytes::from(vec![i])).await);
        }
        for i in 0..3u8 {
            let chunk = buf.dequeue(Duration::from_millis(100)).await.unwrap();
            assert_eq!(chunk[0], i);
        }
    }

    #[tokio::test]
    async fn drop_oldest_on_overflow() {
        let buf = ClientBuffer::new(1, 2);
        assert!(buf.enqueue(Bytes::from_static(b"a")).await);
        assert!(buf.enqueue(Bytes::from_static(b"b")).await);
        assert!(buf.enqueue(Bytes::from_static(b"c")).await); // drops "a"

        assert_eq!(buf.stats.chunks_dropped.load(Ordering::Relaxed), 1);
        let first = buf.dequeue(Duration::from_millis(100)).await.unwrap();
        assert_eq!(&first[..], b"b");
        let second = buf.dequeue(Duration::from_millis(100)).await.unwrap();
        assert_eq!(&second[..], b"c");
    }

    #[tokio::test]
    async fn dequeue_times_out_on_empty_buffer() {
        let buf = ClientBuffer::new(1, 4);
        let start = tokio::time::Instant::now();
        let result = buf.dequeue(Duration::from_millis(50)).await;
        assert!(result.is_none());
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[tokio::test]
    async fn closed_buffer_rejects_writes_and_drains_to_none() {
        let buf = ClientBuffer::new(1, 4);
        assert!(buf.enqueue(Bytes::from_static(b"a")).await);
        buf.close();
        assert!(!buf.enqueue(Bytes::from_static(b"b")).await);

        // Still drains what was queued before close...
        let chunk = buf.dequeue(Duration::from_millis(100)).await.unwrap();
        assert_eq!(&chunk[..], b"a");
        // ...then reports end-of-stream.
        assert!(buf.dequeue(Duration::from_millis(100)).await.is_none());
    }

    #[tokio::test]
    async fn slow_consumer_drop_count_grows_unbounded_while_fast_consumer_stays_zero() {
        let slow = ClientBuffer::new(1, 4);
        let fast = ClientBuffer::new(2, 4);

        for i in 0u32..100 {
            let chunk = Bytes::from(i.to_be_bytes().to_vec());
            slow.enqueue(chunk.clone()).await;
            fast.enqueue(chunk).await;
            // Fast consumer keeps up with every arrival; slow consumer never reads.
            let _ = fast.dequeue(Duration::from_millis(1)).await;
        }

        assert!(slow.stats.chunks_dropped.load(Ordering::Relaxed) >= 90);
        assert_eq!(fast.stats.chunks_dropped.load(Ordering::Relaxed), 0);
    }
}
