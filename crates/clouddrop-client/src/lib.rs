//! clouddrop-client: the CloudDrop per-peer transfer engine.
//!
//! This crate provides:
//! - The hub session (WebSocket signaling with automatic reconnect)
//! - The per-peer connection engine: direct-connection racing against the
//!   relay fallback timer, Perfect Negotiation, ICE restart, and silent
//!   background P2P recovery
//! - The file transfer protocol over both paths: backpressured streaming on
//!   the data channel, and the windowed, acknowledged, retransmitting
//!   stream over the hub relay
//! - The observer event surface the UI layer consumes
//!
//! All per-peer state lives in that peer's actor task; cross-task
//! communication is explicit message passing.

pub mod client;
pub mod config;
pub mod engine;
pub mod events;
pub mod hub;
pub mod transfer;

pub use client::{Client, SendHandle};
pub use config::ClientConfig;
pub use events::{ConnectionStatus, Event};
