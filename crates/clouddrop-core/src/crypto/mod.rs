//! The dual-layer cryptographic envelope.
//!
//! Every payload chunk is encrypted end-to-end with a per-peer AES-256-GCM
//! key derived via ECDH (P-256). When the local user has entered the room
//! password, an inner room-key layer (PBKDF2-derived) is applied first, so
//! even a peer-key compromise does not expose password-protected rooms.
//!
//! Wire layout of an encrypted chunk:
//!
//! ```text
//! ┌──────────┬──────────────────┬──────────────┬────────────────┐
//! │ 1 byte   │ roomIvLen bytes  │  12 bytes    │ ciphertext ... │
//! │ roomIvLen│ roomIv (optional)│ peerIv       │                │
//! └──────────┴──────────────────┴──────────────┴────────────────┘
//! ```

mod envelope;
mod keys;

pub use envelope::{open_chunk, seal_chunk};
pub use keys::{hash_password_for_server, KeyManager};
