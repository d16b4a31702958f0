//! Relay-path sender flow control.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::constants::{ACK_TIMEOUT, MAX_CHUNK_RETRIES, RELAY_WINDOW_SIZE, TRANSFER_TIMEOUT};
use crate::error::{Error, Result};

/// One unacknowledged chunk in flight.
#[derive(Debug, Clone)]
struct PendingChunk {
    /// Base64 payload, kept for retransmission.
    payload: String,
    /// Retransmissions performed so far.
    retries: u32,
    /// When the chunk was last (re)sent.
    sent_at: Instant,
}

/// Windowed, acknowledged, retransmitting send state for one relay transfer.
///
/// At most `window_size` chunks are outstanding. The oldest pending chunk is
/// retransmitted when its ACK deadline passes; a chunk that exhausts its
/// retry budget fails the transfer. A transfer with pending chunks and no
/// ACK progress for the stall timeout is declared stalled.
#[derive(Debug)]
pub struct SendWindow {
    window_size: usize,
    max_retries: u32,
    ack_timeout: Duration,
    stall_timeout: Duration,
    pending: BTreeMap<u32, PendingChunk>,
    last_ack: Instant,
}

impl SendWindow {
    /// Window with the protocol default parameters.
    pub fn new(now: Instant) -> Self {
        Self::with_config(
            RELAY_WINDOW_SIZE,
            MAX_CHUNK_RETRIES,
            ACK_TIMEOUT,
            TRANSFER_TIMEOUT,
            now,
        )
    }

    /// Window with explicit parameters (tests shrink the timeouts).
    pub fn with_config(
        window_size: usize,
        max_retries: u32,
        ack_timeout: Duration,
        stall_timeout: Duration,
        now: Instant,
    ) -> Self {
        SendWindow {
            window_size,
            max_retries,
            ack_timeout,
            stall_timeout,
            pending: BTreeMap::new(),
            last_ack: now,
        }
    }

    /// True when no more chunks may be offered until an ACK or timeout.
    pub fn is_full(&self) -> bool {
        self.pending.len() >= self.window_size
    }

    /// True when every offered chunk has been acknowledged.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Track a freshly sent chunk. Callers must check [`is_full`] first.
    pub fn offer(&mut self, index: u32, payload: String, now: Instant) {
        debug_assert!(!self.is_full(), "offered a chunk into a full window");
        self.pending.insert(
            index,
            PendingChunk {
                payload,
                retries: 0,
                sent_at: now,
            },
        );
    }

    /// Retire acknowledged chunks. Unknown indices (already retired) are
    /// ignored. Returns how many chunks the ACK actually retired.
    pub fn ack(&mut self, indices: &[u32], now: Instant) -> usize {
        let mut retired = 0;
        for index in indices {
            if self.pending.remove(index).is_some() {
                retired += 1;
            }
        }
        if retired > 0 {
            self.last_ack = now;
        }
        retired
    }

    /// Deadline at which the oldest pending chunk must be retransmitted, if
    /// any chunk is pending.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.oldest_pending()
            .map(|(_, chunk)| chunk.sent_at + self.ack_timeout)
    }

    /// If the oldest pending chunk has passed its ACK deadline, mark it
    /// retransmitted and return `(index, payload)` for the resend (with
    /// `retry = true` on the wire). Exceeding the retry budget fails with
    /// [`Error::RelayRetransmitExhausted`].
    pub fn take_expired(&mut self, now: Instant) -> Result<Option<(u32, String)>> {
        let Some((index, chunk)) = self.oldest_pending() else {
            return Ok(None);
        };
        if now < chunk.sent_at + self.ack_timeout {
            return Ok(None);
        }
        let index = *index;
        let chunk = self.pending.get_mut(&index).expect("pending chunk");
        if chunk.retries >= self.max_retries {
            return Err(Error::RelayRetransmitExhausted { index });
        }
        chunk.retries += 1;
        chunk.sent_at = now;
        Ok(Some((index, chunk.payload.clone())))
    }

    /// True when chunks are pending and nothing has been ACKed for the
    /// stall timeout.
    pub fn is_stalled(&self, now: Instant) -> bool {
        !self.pending.is_empty() && now.saturating_duration_since(self.last_ack) >= self.stall_timeout
    }

    fn oldest_pending(&self) -> Option<(&u32, &PendingChunk)> {
        self.pending
            .iter()
            .min_by_key(|(_, chunk)| chunk.sent_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(now: Instant) -> SendWindow {
        SendWindow::with_config(
            3,
            2,
            Duration::from_secs(5),
            Duration::from_secs(30),
            now,
        )
    }

    #[test]
    fn window_fills_and_drains() {
        let now = Instant::now();
        let mut w = window(now);
        w.offer(0, "a".into(), now);
        w.offer(1, "b".into(), now);
        assert!(!w.is_full());
        w.offer(2, "c".into(), now);
        assert!(w.is_full());

        assert_eq!(w.ack(&[0, 1], now), 2);
        assert!(!w.is_full());
        assert_eq!(w.pending_count(), 1);
    }

    #[test]
    fn duplicate_acks_are_ignored() {
        let now = Instant::now();
        let mut w = window(now);
        w.offer(0, "a".into(), now);
        assert_eq!(w.ack(&[0], now), 1);
        assert_eq!(w.ack(&[0], now), 0);
        assert!(w.is_empty());
    }

    #[test]
    fn expired_chunk_is_retransmitted() {
        let now = Instant::now();
        let mut w = window(now);
        w.offer(5, "payload".into(), now);

        // Before the deadline: nothing to do.
        assert!(w.take_expired(now + Duration::from_secs(4)).unwrap().is_none());

        // After: the chunk comes back for resend.
        let resend = w.take_expired(now + Duration::from_secs(5)).unwrap();
        assert_eq!(resend, Some((5, "payload".into())));

        // The resend resets the clock.
        assert!(w
            .take_expired(now + Duration::from_secs(6))
            .unwrap()
            .is_none());
    }

    #[test]
    fn oldest_chunk_expires_first() {
        let now = Instant::now();
        let mut w = window(now);
        w.offer(0, "a".into(), now);
        w.offer(1, "b".into(), now + Duration::from_secs(1));

        let resend = w.take_expired(now + Duration::from_secs(5)).unwrap();
        assert_eq!(resend.unwrap().0, 0);
    }

    #[test]
    fn retry_budget_exhaustion_fails() {
        let now = Instant::now();
        let mut w = window(now);
        w.offer(3, "x".into(), now);

        let mut t = now;
        for _ in 0..2 {
            t += Duration::from_secs(5);
            assert!(w.take_expired(t).unwrap().is_some());
        }
        t += Duration::from_secs(5);
        let err = w.take_expired(t).unwrap_err();
        assert!(matches!(
            err,
            Error::RelayRetransmitExhausted { index: 3 }
        ));
    }

    #[test]
    fn stall_requires_pending_chunks() {
        let now = Instant::now();
        let mut w = window(now);
        let much_later = now + Duration::from_secs(60);

        // Empty window never stalls.
        assert!(!w.is_stalled(much_later));

        w.offer(0, "a".into(), now);
        assert!(!w.is_stalled(now + Duration::from_secs(29)));
        assert!(w.is_stalled(now + Duration::from_secs(30)));

        // An ACK resets the stall clock.
        let ack_time = now + Duration::from_secs(29);
        w.ack(&[0], ack_time);
        w.offer(1, "b".into(), ack_time);
        assert!(!w.is_stalled(now + Duration::from_secs(31)));
    }

    #[test]
    fn lost_chunk_scenario() {
        // Chunks 0..10 sent, chunk 5 lost; ACKs for the rest arrive. Chunk 5
        // is the only retransmission candidate.
        let now = Instant::now();
        let mut w = SendWindow::with_config(
            10,
            3,
            Duration::from_secs(5),
            Duration::from_secs(30),
            now,
        );
        for i in 0..10u32 {
            w.offer(i, format!("c{i}"), now);
        }
        let acked: Vec<u32> = (0..10).filter(|i| *i != 5).collect();
        w.ack(&acked, now + Duration::from_secs(1));
        assert_eq!(w.pending_count(), 1);

        let resend = w.take_expired(now + Duration::from_secs(5)).unwrap();
        assert_eq!(resend, Some((5, "c5".into())));

        w.ack(&[5], now + Duration::from_secs(6));
        assert!(w.is_empty());
    }
}
