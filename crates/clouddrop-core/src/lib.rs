//! clouddrop-core: shared protocol, crypto, and state machines for CloudDrop.
//!
//! This crate provides:
//! - Signaling and transfer-plane frame definitions
//! - The dual-layer cryptographic envelope (ECDH P-256 + AES-256-GCM,
//!   optional PBKDF2 room layer)
//! - Room codes and password helpers
//! - Pure state machines for the connection engine (candidate quality,
//!   Perfect Negotiation, ICE restart, background recovery) and the relay
//!   transfer protocol (send window, chunk assembly)
//! - Logging setup and the error taxonomy

pub mod constants;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod room;
pub mod transfer;

pub use error::{Error, Result};
pub use logging::{init_logging, LogFormat};
