//! File metadata and progress accounting.

use std::time::{Duration, Instant};

use crate::constants::CHUNK_SIZE;
use crate::protocol::FileId;

/// Descriptive metadata of a single file transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMeta {
    pub id: FileId,
    pub name: String,
    pub size: u64,
    pub mime_type: String,
}

impl FileMeta {
    /// Create metadata with a fresh transfer id.
    pub fn new(name: impl Into<String>, size: u64, mime_type: impl Into<String>) -> Self {
        FileMeta {
            id: FileId::generate(),
            name: name.into(),
            size,
            mime_type: mime_type.into(),
        }
    }

    /// Number of chunks this file occupies: `ceil(size / CHUNK_SIZE)`.
    ///
    /// A zero-byte file has zero chunks; the protocol still brackets it with
    /// `file-start` and `file-end`.
    pub fn total_chunks(&self) -> u32 {
        self.size.div_ceil(CHUNK_SIZE as u64) as u32
    }
}

/// Phase of a single file transfer, on either side.
///
/// The request/accept wait, active streaming and terminal states are
/// disjoint; invalid sequences (acknowledging a chunk before acceptance)
/// are unrepresentable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferPhase {
    /// Sender only: `file-request` sent, waiting for `file-response`.
    AwaitingResponse { deadline: Instant },
    /// Chunks are flowing.
    Streaming,
    /// All chunks delivered (possibly with a missing-chunk warning).
    Done,
    /// Cancelled by either side.
    Cancelled { reason: String },
}

/// A progress snapshot surfaced to the observer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progress {
    /// Bytes transferred so far.
    pub sent: u64,
    /// Total bytes expected.
    pub total: u64,
    /// Completion in percent, 0–100.
    pub percent: f64,
    /// Throughput in bytes per second since the transfer started.
    pub speed: f64,
}

/// Computes [`Progress`] snapshots against a start instant.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    total: u64,
    sent: u64,
    started_at: Instant,
}

impl ProgressTracker {
    pub fn new(total: u64, now: Instant) -> Self {
        ProgressTracker {
            total,
            sent: 0,
            started_at: now,
        }
    }

    /// Record `bytes` more transferred and return the updated snapshot.
    pub fn advance(&mut self, bytes: u64, now: Instant) -> Progress {
        self.sent += bytes;
        self.snapshot(now)
    }

    /// Current snapshot without recording new bytes.
    pub fn snapshot(&self, now: Instant) -> Progress {
        let percent = if self.total == 0 {
            100.0
        } else {
            (self.sent as f64 / self.total as f64) * 100.0
        };
        let elapsed = now.saturating_duration_since(self.started_at);
        let speed = if elapsed > Duration::ZERO {
            self.sent as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };
        Progress {
            sent: self.sent,
            total: self.total,
            percent,
            speed,
        }
    }
}
