//! Transfer state machines.
//!
//! Pure state, no I/O: the client crate drives these from its per-peer
//! tasks. [`SendWindow`] is the relay-path sender's flow-control and
//! retransmission state; [`Assembly`] is the receiver's chunk store and ACK
//! batcher. Both are deterministic functions of the events fed to them,
//! which keeps the windowing and integrity rules unit-testable without a
//! network.

mod assembly;
mod meta;
mod window;

pub use assembly::{Assembled, Assembly, IngestOutcome};
pub use meta::{FileMeta, Progress, ProgressTracker, TransferPhase};
pub use window::SendWindow;
