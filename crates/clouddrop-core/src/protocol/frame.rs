//! The hub signaling frame envelope.
//!
//! Every non-binary frame on the hub socket is UTF-8 JSON of the shape
//! `{type, from?, to?, ...payload}`. The `type` discriminant and payload
//! fields are flattened into the envelope, matching the wire format the
//! browser clients speak.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::transfer::TransferFrame;
use super::types::{DeviceClass, FileId, PeerId, PeerInfo, TransferMode};
use crate::error::Result;

/// A single signaling frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalFrame {
    /// Originating peer; filled in by the hub when forwarding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<PeerId>,
    /// Addressed peer; presence means "forward verbatim".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<PeerId>,
    #[serde(flatten)]
    pub payload: FramePayload,
}

impl SignalFrame {
    /// Frame handled by the hub itself (no addressing).
    pub fn local(payload: FramePayload) -> Self {
        SignalFrame {
            from: None,
            to: None,
            payload,
        }
    }

    /// Frame addressed to a specific peer, to be forwarded by the hub.
    pub fn addressed(to: PeerId, payload: FramePayload) -> Self {
        SignalFrame {
            from: None,
            to: Some(to),
            payload,
        }
    }

    /// Serialize to the JSON wire form.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse from the JSON wire form.
    pub fn decode(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Frame payload, discriminated by the `type` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum FramePayload {
    /// Client registers its attachment with the room.
    #[serde(rename_all = "camelCase")]
    Join {
        name: String,
        device_type: DeviceClass,
        browser_info: String,
    },
    /// Hub reply to `join`.
    #[serde(rename_all = "camelCase")]
    Joined {
        peer_id: PeerId,
        room_code: String,
        peers: Vec<PeerInfo>,
    },
    /// Membership delta: a peer entered the room.
    PeerJoined { peer: PeerInfo },
    /// Membership delta: a peer left the room.
    #[serde(rename_all = "camelCase")]
    PeerLeft { peer_id: PeerId },

    /// WebRTC offer, with the sender's SPKI public key piggybacked so the
    /// receiver can derive the shared secret without an extra round-trip.
    #[serde(rename_all = "camelCase")]
    Offer {
        description: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        public_key: Option<String>,
    },
    /// WebRTC answer.
    #[serde(rename_all = "camelCase")]
    Answer {
        description: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        public_key: Option<String>,
    },
    /// Trickled ICE candidate.
    IceCandidate { candidate: Value },

    /// Explicit ECDH public key exchange for relay-mode encryption.
    #[serde(rename_all = "camelCase")]
    KeyExchange { public_key: String },

    /// Relay-mode application payload; never inspected by the hub.
    RelayData { data: TransferFrame },

    /// Transfer control: ask the peer to accept a file.
    #[serde(rename_all = "camelCase")]
    FileRequest {
        file_id: FileId,
        name: String,
        size: u64,
        mime_type: String,
        total_chunks: u32,
        transfer_mode: TransferMode,
    },
    /// Transfer control: accept or decline.
    #[serde(rename_all = "camelCase")]
    FileResponse { file_id: FileId, accepted: bool },
    /// Transfer control: abort from either side.
    #[serde(rename_all = "camelCase")]
    FileCancel { file_id: FileId, reason: String },

    /// Sender renamed itself; hub updates the attachment and broadcasts.
    NameChanged { name: String },

    /// Opaque small message (chat); base64 of the encrypted envelope.
    Text { data: String },

    /// Keep-alive; the hub answers with `pong`.
    Ping,
    Pong,

    /// Hub-reported error, sent before an application close.
    Error { error: ErrorCode },
}

/// Hub error codes surfaced in `error` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    PasswordRequired,
    PasswordIncorrect,
}

/// One entry of the `/api/ice-servers` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerEntry {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_wire_shape() {
        let frame = SignalFrame::local(FramePayload::Join {
            name: "Swift Falcon".into(),
            device_type: DeviceClass::Desktop,
            browser_info: "Firefox on Linux".into(),
        });
        let json = frame.encode().unwrap();
        assert!(json.contains(r#""type":"join""#));
        assert!(json.contains(r#""deviceType":"desktop""#));
        assert!(json.contains(r#""browserInfo":"Firefox on Linux""#));
        assert!(!json.contains("from"));
    }

    #[test]
    fn forwarded_frame_round_trip() {
        let frame = SignalFrame {
            from: Some(PeerId::from("aaa")),
            to: Some(PeerId::from("bbb")),
            payload: FramePayload::KeyExchange {
                public_key: "BASE64KEY".into(),
            },
        };
        let decoded = SignalFrame::decode(&frame.encode().unwrap()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn file_request_wire_fields() {
        let frame = SignalFrame::addressed(
            PeerId::from("bbb"),
            FramePayload::FileRequest {
                file_id: FileId::generate(),
                name: "hello.bin".into(),
                size: 102_400,
                mime_type: "application/octet-stream".into(),
                total_chunks: 2,
                transfer_mode: TransferMode::Direct,
            },
        );
        let json = frame.encode().unwrap();
        assert!(json.contains(r#""type":"file-request""#));
        assert!(json.contains(r#""totalChunks":2"#));
        assert!(json.contains(r#""transferMode":"direct""#));
        assert!(json.contains(r#""mimeType":"application/octet-stream""#));
    }

    #[test]
    fn error_codes_screaming_snake() {
        let frame = SignalFrame::local(FramePayload::Error {
            error: ErrorCode::PasswordIncorrect,
        });
        assert!(frame
            .encode()
            .unwrap()
            .contains(r#""error":"PASSWORD_INCORRECT""#));
    }

    #[test]
    fn ping_has_no_payload_fields() {
        let frame = SignalFrame::local(FramePayload::Ping);
        assert_eq!(frame.encode().unwrap(), r#"{"type":"ping"}"#);
        let decoded = SignalFrame::decode(r#"{"type":"pong"}"#).unwrap();
        assert_eq!(decoded.payload, FramePayload::Pong);
    }

    #[test]
    fn unknown_type_is_a_codec_error() {
        assert!(SignalFrame::decode(r#"{"type":"mystery"}"#).is_err());
    }
}
