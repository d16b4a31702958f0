//! The connection engine: ICE server selection, webrtc plumbing, and the
//! per-peer actor that races direct establishment against relay fallback.

pub(crate) mod ice;
pub(crate) mod peer;
pub(crate) mod rtc;

pub use ice::IceProvider;
