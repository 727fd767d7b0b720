//! Live transfer tracker.
//!
//! Every delivering response registers a transfer; the body stream
//! reports bytes as chunks flow. Instantaneous speed is sampled every
//! 0.5 s into a 10-slot ring whose mean is the transfer's smoothed
//! speed. Terminal entries are removed 5 s after they finish; entries
//! with no update for 30 s are pruned on read. Transfers too short to
//! ever produce a smoothed sample report their average speed instead
//! of a misleading zero.

use bytes::Bytes;
use dashmap::DashMap;
use futures::Stream;
use serde_json::json;
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tracing::debug;
use uuid::Uuid;

const SPEED_SAMPLE_INTERVAL_SECS: f64 = 0.5;
const SPEED_HISTORY_LEN: usize = 10;
/// Completed transfers stay in the aggregate for this long.
const COMPLETED_WINDOW_SECS: f64 = 2.0;
/// Below this age the smoothed speed has no samples yet.
const INITIAL_WINDOW_SECS: f64 = 0.5;
const STALE_AFTER_SECS: f64 = 30.0;
const REMOVE_DELAY: Duration = Duration::from_secs(5);
const MAX_DETAILED: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Active,
    Completed,
    Disconnected,
    Error,
}

impl TransferStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::Active => "active",
            TransferStatus::Completed => "completed",
            TransferStatus::Disconnected => "disconnected",
            TransferStatus::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransferStatus::Active)
    }
}

#[derive(Debug, Clone)]
pub struct TransferInfo {
    pub file_path: String,
    pub full_path: String,
    pub uid: Option<String>,
    pub session_id: Option<String>,
    pub client_ip: String,
    pub file_type: String,
    pub start_byte: u64,
    pub end_byte: Option<u64>,
    pub total_size: Option<u64>,
    pub bytes_transferred: u64,
    pub speed_bps: f64,
    pub status: TransferStatus,
    pub start_time: Instant,
    pub last_update: Instant,
    pub first_byte_time: Option<Instant>,
    speed_history: VecDeque<f64>,
    last_bytes: u64,
    last_speed_update: Instant,
}

/// Speed shown for one transfer: smoothed when available, average for
/// transfers too new/short/fast for the ring to have caught up.
fn display_speed(info: &TransferInfo, now: Instant) -> f64 {
    let elapsed = now.duration_since(info.start_time).as_secs_f64();
    let average = if elapsed > 0.0 {
        info.bytes_transferred as f64 / elapsed
    } else {
        0.0
    };

    if info.status == TransferStatus::Completed || elapsed < INITIAL_WINDOW_SECS {
        average
    } else if info.speed_bps == 0.0 && elapsed > 0.0 {
        average
    } else if info.total_size.is_some_and(|t| t < 1_048_576) || elapsed < 2.0 {
        info.speed_bps.max(average)
    } else {
        info.speed_bps
    }
}

#[derive(Clone)]
pub struct TransferTracker {
    transfers: Arc<DashMap<String, TransferInfo>>,
}

impl TransferTracker {
    pub fn new() -> Self {
        Self { transfers: Arc::new(DashMap::new()) }
    }

    /// Register a transfer at byte-stream entry. Returns its id.
    #[allow(clippy::too_many_arguments)]
    pub fn register(
        &self,
        full_path: &str,
        uid: Option<String>,
        session_id: Option<String>,
        client_ip: &str,
        file_type: &str,
        start_byte: u64,
        end_byte: Option<u64>,
        total_size: Option<u64>,
    ) -> String {
        let id = Uuid::new_v4().to_string();
        let now = Instant::now();
        let file_path = full_path.rsplit('/').next().unwrap_or(full_path).to_string();

        self.transfers.insert(
            id.clone(),
            TransferInfo {
                file_path,
                full_path: full_path.to_string(),
                uid,
                session_id,
                client_ip: client_ip.to_string(),
                file_type: file_type.to_string(),
                start_byte,
                end_byte,
                total_size,
                bytes_transferred: 0,
                speed_bps: 0.0,
                status: TransferStatus::Active,
                start_time: now,
                last_update: now,
                first_byte_time: None,
                speed_history: VecDeque::with_capacity(SPEED_HISTORY_LEN),
                last_bytes: 0,
                last_speed_update: now,
            },
        );
        id
    }

    /// Account a delivered chunk and resample the smoothed speed.
    pub fn record_bytes(&self, id: &str, n: u64) {
        let Some(mut info) = self.transfers.get_mut(id) else {
            return;
        };
        let now = Instant::now();

        if info.first_byte_time.is_none() {
            info.first_byte_time = Some(now);
        }
        info.bytes_transferred += n;
        info.last_update = now;

        let since_sample = now.duration_since(info.last_speed_update).as_secs_f64();
        if since_sample >= SPEED_SAMPLE_INTERVAL_SECS {
            let instant_speed = (info.bytes_transferred - info.last_bytes) as f64 / since_sample;
            info.speed_history.push_back(instant_speed);
            if info.speed_history.len() > SPEED_HISTORY_LEN {
                info.speed_history.pop_front();
            }
            info.speed_bps =
                info.speed_history.iter().sum::<f64>() / info.speed_history.len() as f64;
            let transferred = info.bytes_transferred;
            info.last_bytes = transferred;
            info.last_speed_update = now;
        }
    }

    /// Move a transfer into a terminal state; the entry is removed
    /// 5 s later.
    pub fn finish(&self, id: &str, status: TransferStatus) {
        if let Some(mut info) = self.transfers.get_mut(id) {
            info.status = status;
            info.last_update = Instant::now();
        }

        if status.is_terminal()
            && let Ok(handle) = tokio::runtime::Handle::try_current()
        {
            let transfers = Arc::clone(&self.transfers);
            let id = id.to_string();
            handle.spawn(async move {
                tokio::time::sleep(REMOVE_DELAY).await;
                transfers.remove(&id);
                debug!(transfer = %id, "Transfer record removed");
            });
        }
    }

    pub fn len(&self) -> usize {
        self.transfers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transfers.is_empty()
    }

    /// Aggregate statistics for the monitoring surface. Prunes stale
    /// entries as a side effect.
    pub fn stats(&self) -> serde_json::Value {
        let now = Instant::now();

        self.transfers
            .retain(|_, info| now.duration_since(info.last_update).as_secs_f64() <= STALE_AFTER_SECS);

        let mut active_count = 0usize;
        let mut completed_count = 0usize;
        let mut total_speed = 0.0f64;
        let mut details = Vec::new();

        for entry in self.transfers.iter() {
            let info = entry.value();
            let elapsed = now.duration_since(info.start_time).as_secs_f64();
            let average = if elapsed > 0.0 {
                info.bytes_transferred as f64 / elapsed
            } else {
                0.0
            };

            match info.status {
                TransferStatus::Active => {
                    active_count += 1;
                    let mut speed = info.speed_bps;
                    if speed == 0.0 && info.bytes_transferred > 0 && elapsed > 0.0 {
                        speed = average;
                    }
                    total_speed += speed;
                }
                TransferStatus::Completed => {
                    completed_count += 1;
                    let since_complete = now.duration_since(info.last_update).as_secs_f64();
                    if since_complete < COMPLETED_WINDOW_SECS && elapsed > 0.0 {
                        total_speed += average;
                    }
                }
                _ => {}
            }

            if details.len() < MAX_DETAILED {
                let first_byte_latency_ms = info
                    .first_byte_time
                    .map(|t| t.duration_since(info.start_time).as_secs_f64() * 1000.0);
                let mut detail = json!({
                    "transfer_id": entry.key(),
                    "file_path": info.file_path,
                    "full_path": info.full_path,
                    "uid": info.uid,
                    "session_id": info.session_id,
                    "status": info.status.as_str(),
                    "bytes_transferred": info.bytes_transferred,
                    "total_size": info.total_size,
                    "speed_bps": display_speed(info, now),
                    "elapsed": elapsed,
                    "client_ip": info.client_ip,
                    "file_type": info.file_type,
                    "first_byte_latency_ms": first_byte_latency_ms,
                });
                if let Some(total) = info.total_size
                    && total > 0
                {
                    detail["progress_percent"] =
                        json!((info.bytes_transferred as f64 / total as f64) * 100.0);
                }
                details.push(detail);
            }
        }

        json!({
            "active_transfers": active_count,
            "completed_transfers": completed_count,
            "total_speed_bps": total_speed,
            "total_speed_mbps": (total_speed * 8.0) / (1024.0 * 1024.0),
            "transfers": details,
            "timestamp": chrono::Utc::now().timestamp(),
            "total_tracked_transfers": self.transfers.len(),
        })
    }
}

impl Default for TransferTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Body stream wrapper that accounts bytes into the tracker and
/// finalises the transfer on exhaustion, error, or drop.
///
/// A client disconnect surfaces as the response body being dropped
/// mid-stream: the `Drop` impl marks the transfer `disconnected` when
/// it never reached a terminal state.
pub struct TrackedStream<S> {
    inner: S,
    tracker: TransferTracker,
    transfer_id: String,
    finished: bool,
}

impl<S> TrackedStream<S> {
    pub fn new(inner: S, tracker: TransferTracker, transfer_id: String) -> Self {
        Self { inner, tracker, transfer_id, finished: false }
    }
}

impl<S> Stream for TrackedStream<S>
where
    S: Stream<Item = std::io::Result<Bytes>> + Unpin,
{
    type Item = std::io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                this.tracker.record_bytes(&this.transfer_id, chunk.len() as u64);
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.finished = true;
                let status = if hlsgate_core::error::is_disconnect_io(&e) {
                    TransferStatus::Disconnected
                } else {
                    TransferStatus::Error
                };
                this.tracker.finish(&this.transfer_id, status);
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.finished = true;
                this.tracker.finish(&this.transfer_id, TransferStatus::Completed);
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<S> Drop for TrackedStream<S> {
    fn drop(&mut self) {
        if !self.finished {
            self.tracker.finish(&self.transfer_id, TransferStatus::Disconnected);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn register_simple(tracker: &TransferTracker, total: Option<u64>) -> String {
        tracker.register("video/a/seg0.ts", Some("315".into()), None, "203.0.113.9", "ts", 0, None, total)
    }

    #[tokio::test]
    async fn short_completed_transfer_reports_nonzero_speed() {
        // >= 1 byte and elapsed > 0 must never show 0 bps
        let tracker = TransferTracker::new();
        let id = register_simple(&tracker, Some(1000));
        tracker.record_bytes(&id, 1000);
        tokio::time::sleep(Duration::from_millis(5)).await;
        tracker.finish(&id, TransferStatus::Completed);

        let stats = tracker.stats();
        let detail = &stats["transfers"][0];
        assert_eq!(detail["status"], "completed");
        assert!(detail["speed_bps"].as_f64().unwrap() > 0.0);
    }

    #[tokio::test]
    async fn recently_completed_transfers_count_toward_bandwidth() {
        let tracker = TransferTracker::new();
        let id = register_simple(&tracker, Some(4096));
        tracker.record_bytes(&id, 4096);
        tokio::time::sleep(Duration::from_millis(5)).await;
        tracker.finish(&id, TransferStatus::Completed);

        let stats = tracker.stats();
        assert!(stats["total_speed_bps"].as_f64().unwrap() > 0.0);
        assert_eq!(stats["completed_transfers"], 1);
    }

    #[tokio::test]
    async fn disconnected_transfers_do_not_count_toward_bandwidth() {
        let tracker = TransferTracker::new();
        let id = register_simple(&tracker, None);
        tracker.record_bytes(&id, 100);
        tracker.finish(&id, TransferStatus::Disconnected);

        let stats = tracker.stats();
        assert_eq!(stats["total_speed_bps"].as_f64().unwrap(), 0.0);
    }

    #[tokio::test]
    async fn progress_percent_present_with_known_size() {
        let tracker = TransferTracker::new();
        let id = register_simple(&tracker, Some(200));
        tracker.record_bytes(&id, 50);

        let stats = tracker.stats();
        let pct = stats["transfers"][0]["progress_percent"].as_f64().unwrap();
        assert!((pct - 25.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn first_byte_latency_is_recorded() {
        let tracker = TransferTracker::new();
        let id = register_simple(&tracker, None);
        tokio::time::sleep(Duration::from_millis(2)).await;
        tracker.record_bytes(&id, 1);

        let stats = tracker.stats();
        let latency = stats["transfers"][0]["first_byte_latency_ms"].as_f64().unwrap();
        assert!(latency > 0.0);
    }

    #[tokio::test]
    async fn tracked_stream_completes_transfer_on_exhaustion() {
        let tracker = TransferTracker::new();
        let id = register_simple(&tracker, Some(6));
        let chunks: Vec<std::io::Result<Bytes>> =
            vec![Ok(Bytes::from_static(b"abc")), Ok(Bytes::from_static(b"def"))];
        let mut stream =
            TrackedStream::new(futures::stream::iter(chunks), tracker.clone(), id.clone());

        let mut collected = 0usize;
        while let Some(chunk) = stream.next().await {
            collected += chunk.unwrap().len();
        }
        assert_eq!(collected, 6);

        let info = tracker.transfers.get(&id).unwrap();
        assert_eq!(info.status, TransferStatus::Completed);
        assert_eq!(info.bytes_transferred, 6);
    }

    #[tokio::test]
    async fn dropping_mid_stream_marks_disconnected() {
        let tracker = TransferTracker::new();
        let id = register_simple(&tracker, Some(6));
        let chunks: Vec<std::io::Result<Bytes>> = vec![Ok(Bytes::from_static(b"abc"))];
        let mut stream =
            TrackedStream::new(futures::stream::iter(chunks), tracker.clone(), id.clone());

        // Consume one chunk, then drop the stream as axum does when
        // the client goes away
        let _ = stream.next().await;
        drop(stream);

        let info = tracker.transfers.get(&id).unwrap();
        assert_eq!(info.status, TransferStatus::Disconnected);
    }

    #[tokio::test]
    async fn stale_entries_are_pruned_on_read() {
        let tracker = TransferTracker::new();
        let id = register_simple(&tracker, None);
        {
            let mut info = tracker.transfers.get_mut(&id).unwrap();
            info.last_update = Instant::now() - Duration::from_secs(31);
        }
        let stats = tracker.stats();
        assert_eq!(stats["total_tracked_transfers"], 0);
    }
}
