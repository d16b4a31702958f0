//! CloudDrop signaling and transfer protocol definitions.
//!
//! Two planes share these types:
//!
//! - **Signaling plane**: [`SignalFrame`], UTF-8 JSON frames on the hub
//!   WebSocket. Frames carrying a `to` field are forwarded verbatim by the
//!   hub with `from` filled in; the rest are handled by the hub itself.
//! - **Transfer plane**: [`TransferFrame`], control and chunk messages for
//!   a single file or text transfer. Sent as JSON text frames on the direct
//!   data channel, or wrapped in `relay-data` signal frames on the relay
//!   path.

mod frame;
mod transfer;
mod types;

pub use frame::{ErrorCode, FramePayload, IceServerEntry, SignalFrame};
pub use transfer::{ChunkAck, TransferFrame};
pub use types::{DeviceClass, FileId, PeerId, PeerInfo, TransferMode};
