//! The file transfer protocol.
//!
//! Each transfer runs as its own task so a 60-second acceptance wait or a
//! windowed relay stream never blocks the owning peer actor. The actor
//! routes incoming ACKs, chunks and cancellations into the task through a
//! feed channel and owns all registration state; tasks report back with a
//! single `TransferClosed` command when they finish.

pub(crate) mod incoming;
pub(crate) mod outgoing;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, watch, Notify};

use clouddrop_core::protocol::{FileId, PeerId, TransferFrame, TransferMode};
use clouddrop_core::transfer::FileMeta;

use crate::client::Shared;
use crate::engine::peer::{ConnMode, PeerCommand};

/// Phase-2 resolution of a `file-request`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ResponseOutcome {
    Accepted,
    Declined,
    Cancelled(String),
}

/// One item routed into a receiving transfer task.
#[derive(Debug)]
pub(crate) enum IncomingItem {
    /// An encrypted chunk. On the direct path the index is assigned by the
    /// actor from the channel's ordering.
    Chunk { index: u32, payload: Bytes },
    /// End-of-stream marker.
    End,
    /// Remote or local cancellation.
    Cancel { reason: String },
}

/// Everything an outgoing transfer task needs, captured at spawn.
pub(crate) struct OutgoingCtx {
    pub shared: Arc<Shared>,
    pub peer_id: PeerId,
    pub meta: FileMeta,
    pub bytes: Bytes,
    /// Commands back to the owning actor.
    pub cmd: mpsc::UnboundedSender<PeerCommand>,
    /// Mode decided by the connection engine.
    pub mode_rx: watch::Receiver<ConnMode>,
    /// ACKs and cancels routed in by the actor.
    pub feed: mpsc::UnboundedReceiver<TransferFrame>,
    /// Resolution of the acceptance wait.
    pub response: oneshot::Receiver<ResponseOutcome>,
    /// Set by either side's cancel; checked at every suspension point.
    pub cancelled: Arc<AtomicBool>,
    /// Data channel slot, populated once the direct path opens.
    pub dc_slot: Arc<std::sync::RwLock<Option<Arc<webrtc::data_channel::RTCDataChannel>>>>,
    /// Signalled whenever a key for this peer is imported.
    pub key_ready: Arc<Notify>,
    /// Completion signal back to the caller of `send_file`.
    pub done: oneshot::Sender<clouddrop_core::Result<()>>,
}

/// Context for sending one encrypted text message.
pub(crate) struct TextCtx {
    pub shared: Arc<Shared>,
    pub peer_id: PeerId,
    pub cmd: mpsc::UnboundedSender<PeerCommand>,
    pub mode_rx: watch::Receiver<ConnMode>,
    pub key_ready: Arc<Notify>,
    pub dc_slot: Arc<std::sync::RwLock<Option<Arc<webrtc::data_channel::RTCDataChannel>>>>,
    pub text: String,
    pub done: oneshot::Sender<clouddrop_core::Result<()>>,
}

/// Everything a receiving transfer task needs, captured at acceptance.
pub(crate) struct IncomingCtx {
    pub shared: Arc<Shared>,
    pub peer_id: PeerId,
    pub file_id: FileId,
    pub file_name: String,
    pub file_size: u64,
    pub mime_type: String,
    pub total_chunks: u32,
    pub mode: TransferMode,
    pub cmd: mpsc::UnboundedSender<PeerCommand>,
    pub feed: mpsc::UnboundedReceiver<IncomingItem>,
    pub cancelled: Arc<AtomicBool>,
}
