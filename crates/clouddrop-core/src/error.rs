//! Error types for clouddrop-core.

use thiserror::Error;

use crate::protocol::PeerId;

/// Main error type for CloudDrop operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from underlying system calls.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Protocol violation or malformed frame.
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// Frame (de)serialization failure.
    #[error("codec error: {message}")]
    Codec { message: String },

    /// Transport layer error (hub socket or peer connection).
    #[error("transport error: {message}")]
    Transport { message: String },

    /// No remote peer with the given id.
    #[error("peer not found: {0}")]
    PeerNotFound(PeerId),

    /// No ECDH shared secret established with this peer yet.
    #[error("no shared key for peer {0}")]
    NoSharedKey(PeerId),

    /// Chunk carries a room layer but no room password has been entered.
    #[error("chunk requires a room key that is not set")]
    RoomKeyMissing,

    /// AEAD authentication failure: data tampered or key wrong.
    #[error("decryption failed")]
    DecryptionFailed,

    /// Key import or derivation failure.
    #[error("crypto error: {message}")]
    Crypto { message: String },

    /// Room password shorter than the minimum length.
    #[error("password too short (minimum {minimum} characters)")]
    PasswordTooShort { minimum: usize },

    /// The room requires a password and none was supplied.
    #[error("room password required")]
    PasswordRequired,

    /// The supplied room password hash did not match.
    #[error("room password incorrect")]
    PasswordIncorrect,

    /// Receiver never answered the file request.
    #[error("peer did not respond to the file request")]
    PeerDidNotRespond,

    /// Receiver declined the file request.
    #[error("peer declined the file request")]
    PeerDeclined,

    /// The remote peer cancelled the transfer.
    #[error("peer cancelled the transfer")]
    PeerCancelled,

    /// The local user cancelled the transfer.
    #[error("transfer cancelled")]
    UserCancelled,

    /// A relay chunk exhausted its retransmission budget.
    #[error("relay retransmission exhausted for chunk {index}")]
    RelayRetransmitExhausted { index: u32 },

    /// The receiver stopped acknowledging relay chunks.
    #[error("relay transfer stalled")]
    RelayStalled,

    /// ICE restarts exhausted; the engine commits to relay instead.
    #[error("ICE restarts exhausted")]
    IceRestartExhausted,

    /// Assembled file is missing chunks and strict integrity is enabled.
    #[error("transfer integrity failed: {missing} chunks missing")]
    IntegrityFailed { missing: usize },

    /// The hub connection was lost.
    #[error("network disconnected")]
    NetworkDisconnected,

    /// The connection was closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// Operation timed out.
    #[error("operation timed out")]
    Timeout,
}

impl Error {
    /// Returns true if this error is transient and retrying may help.
    ///
    /// Transient errors cover transport failures where the peer or hub may
    /// still be reachable after a reconnect.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Transport { .. }
                | Error::ConnectionClosed
                | Error::NetworkDisconnected
                | Error::Timeout
                | Error::Io(_)
        )
    }

    /// Returns true if this error is fatal for the operation that raised it.
    ///
    /// Crypto authentication failures are never retried; protocol errors
    /// indicate a peer speaking a different dialect.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::DecryptionFailed
                | Error::RoomKeyMissing
                | Error::Protocol { .. }
                | Error::PasswordIncorrect
                | Error::PeerDeclined
                | Error::IntegrityFailed { .. }
        )
    }

    /// Shorthand constructor for transport errors.
    pub fn transport(message: impl Into<String>) -> Self {
        Error::Transport {
            message: message.into(),
        }
    }

    /// Shorthand constructor for protocol errors.
    pub fn protocol(message: impl Into<String>) -> Self {
        Error::Protocol {
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Codec {
            message: e.to_string(),
        }
    }
}

/// Convenience result type for CloudDrop operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_no_shared_key() {
        let err = Error::NoSharedKey(PeerId::from("abc123"));
        assert_eq!(err.to_string(), "no shared key for peer abc123");
    }

    #[test]
    fn error_display_password_too_short() {
        let err = Error::PasswordTooShort { minimum: 6 };
        assert_eq!(err.to_string(), "password too short (minimum 6 characters)");
    }

    #[test]
    fn transient_errors() {
        assert!(Error::transport("hub closed").is_transient());
        assert!(Error::NetworkDisconnected.is_transient());
        assert!(Error::Timeout.is_transient());

        assert!(!Error::DecryptionFailed.is_transient());
        assert!(!Error::PeerDeclined.is_transient());
    }

    #[test]
    fn fatal_errors() {
        assert!(Error::DecryptionFailed.is_fatal());
        assert!(Error::RoomKeyMissing.is_fatal());
        assert!(Error::PasswordIncorrect.is_fatal());
        assert!(Error::IntegrityFailed { missing: 2 }.is_fatal());

        assert!(!Error::RelayStalled.is_fatal());
        assert!(!Error::NetworkDisconnected.is_fatal());
    }

    #[test]
    fn json_error_conversion() {
        let json_err = serde_json::from_str::<u32>("not json").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Codec { .. }));
    }
}
