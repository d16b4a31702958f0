//! Observer events surfaced to the UI layer.

use bytes::Bytes;
use tokio::sync::oneshot;

use clouddrop_core::protocol::{FileId, PeerId, PeerInfo, TransferMode};
use clouddrop_core::transfer::Progress;

/// Per-peer connection status shown as a badge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// A direct attempt is underway.
    Connecting,
    /// The direct attempt passed the slow threshold.
    Slow,
    /// Committed to the hub relay path.
    Relay,
    /// Direct data channel open and keyed.
    Connected,
}

/// Everything the engine reports to its observer.
///
/// Delivered on an unbounded channel; the UI layer drains it. Events are
/// not replayed; a late subscriber starts from the present.
#[derive(Debug)]
pub enum Event {
    /// The hub accepted our join.
    RoomJoined {
        room_code: String,
        local_id: PeerId,
        peers: Vec<PeerInfo>,
    },
    /// Membership delta.
    PeerJoined { peer: PeerInfo },
    /// Membership delta. All keys, transfers and timers for the peer are
    /// discarded before this fires.
    PeerLeft { peer_id: PeerId },
    /// A peer renamed itself.
    PeerRenamed { peer_id: PeerId, name: String },

    /// Connection badge update for one peer.
    ConnectionState {
        peer_id: PeerId,
        status: ConnectionStatus,
        message: Option<String>,
    },

    /// A peer asks to send us a file. Send the decision on `respond`;
    /// dropping it declines. The trusted-device short-circuit lives in the
    /// subscriber, not here.
    FileRequest {
        peer_id: PeerId,
        file_id: FileId,
        file_name: String,
        file_size: u64,
        mime_type: String,
        total_chunks: u32,
        mode: TransferMode,
        respond: oneshot::Sender<bool>,
    },

    /// Periodic transfer progress, both directions.
    TransferProgress {
        peer_id: PeerId,
        file_id: FileId,
        file_name: String,
        file_size: u64,
        progress: Progress,
    },

    /// A file finished assembling. `missing` is non-empty when a relay
    /// transfer completed short and partial delivery is configured.
    FileReceived {
        peer_id: PeerId,
        file_id: FileId,
        file_name: String,
        mime_type: String,
        bytes: Bytes,
        missing: Vec<u32>,
    },

    /// An encrypted text message arrived.
    TextReceived { peer_id: PeerId, text: String },

    /// A transfer was cancelled by either side.
    TransferCancelled {
        peer_id: PeerId,
        file_id: FileId,
        reason: String,
    },

    /// The hub connection dropped; the client clears peer state and
    /// reconnects after a delay.
    Disconnected,

    /// The hub rejected our password; the stored room password was cleared.
    PasswordRejected { required: bool },

    /// Non-fatal error worth surfacing.
    Error { message: String },
}
