//! Transfer identity and progress reporting.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Direction of a transfer relative to the local endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    Send,
    Receive,
}

/// Unique identifier for a transfer within this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferId(u64);

impl TransferId {
    pub(crate) fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Numeric form, as used in log fields.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for TransferId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "transfer-{}", self.0)
    }
}

/// Percentage of `transferred` out of `total`.
///
/// Rounds to the nearest integer but reports 100 only when exactly
/// `total` bytes have arrived; an overshoot is not completion. An empty
/// file is complete from the start.
pub fn percent(transferred: u64, total: u64) -> u8 {
    if transferred == total {
        return 100;
    }
    if total == 0 {
        return 99;
    }
    let pct = ((transferred as f64 / total as f64) * 100.0).round();
    pct.min(99.0) as u8
}

/// Snapshot of a transfer's progress.
#[derive(Debug, Clone)]
pub struct TransferProgress {
    pub transfer_id: TransferId,
    pub direction: TransferDirection,
    pub file_name: Arc<str>,
    pub total_bytes: u64,
    pub transferred_bytes: u64,
    pub started_at: Instant,
    pub speed_bps: u64,
}

impl TransferProgress {
    pub(crate) fn new(
        transfer_id: TransferId,
        direction: TransferDirection,
        file_name: Arc<str>,
        total_bytes: u64,
    ) -> Self {
        Self {
            transfer_id,
            direction,
            file_name,
            total_bytes,
            transferred_bytes: 0,
            started_at: Instant::now(),
            speed_bps: 0,
        }
    }

    /// Records `bytes` more transferred and refreshes the throughput.
    pub(crate) fn advance(&mut self, bytes: u64) {
        self.transferred_bytes = self.transferred_bytes.saturating_add(bytes);
        let elapsed = self.started_at.elapsed();
        if elapsed > Duration::ZERO {
            self.speed_bps = (self.transferred_bytes as f64 / elapsed.as_secs_f64()) as u64;
        }
    }

    pub fn percent(&self) -> u8 {
        percent(self.transferred_bytes, self.total_bytes)
    }

    pub fn is_complete(&self) -> bool {
        self.transferred_bytes == self.total_bytes
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Seconds left at the current throughput, if it is known.
    pub fn eta_seconds(&self) -> Option<u64> {
        if self.speed_bps == 0 || self.transferred_bytes >= self.total_bytes {
            return None;
        }
        let remaining = self.total_bytes - self.transferred_bytes;
        Some(remaining / self.speed_bps)
    }
}
