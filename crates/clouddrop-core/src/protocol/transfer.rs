//! Transfer-plane messages.
//!
//! One enum serves both paths. On the direct path these travel as JSON text
//! frames on the data channel (chunks themselves go as raw binary frames and
//! never appear here). On the relay path every message, chunks included, is
//! wrapped in a `relay-data` signal frame; chunk bytes are base64-encoded to
//! survive the JSON channel.

use serde::{Deserialize, Serialize};

use super::types::FileId;

/// A message of the transfer plane for a single file or text payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum TransferFrame {
    /// Stream header, sent after acceptance and before the first chunk.
    #[serde(rename_all = "camelCase")]
    FileStart {
        file_id: FileId,
        name: String,
        size: u64,
        mime_type: String,
        total_chunks: u32,
    },
    /// One encrypted chunk (relay path only; base64 of the envelope bytes).
    #[serde(rename_all = "camelCase")]
    Chunk {
        file_id: FileId,
        index: u32,
        data: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        retry: bool,
    },
    /// Batched receiver acknowledgment (relay path only).
    #[serde(rename_all = "camelCase")]
    Ack { file_id: FileId, acks: Vec<u32> },
    /// Stream trailer.
    #[serde(rename_all = "camelCase")]
    FileEnd { file_id: FileId, total_chunks: u32 },
    /// Encrypted text message (base64 of the envelope bytes).
    Text { data: String },
    /// Cooperative cancellation, mirrored on both paths.
    #[serde(rename_all = "camelCase")]
    Cancel { file_id: FileId, reason: String },
}

/// A single acknowledged chunk index paired with its transfer.
///
/// Convenience for routing ACKs out of the receive loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkAck {
    pub file_id: FileId,
    pub index: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_omits_retry_when_false() {
        let frame = TransferFrame::Chunk {
            file_id: FileId::generate(),
            index: 4,
            data: "QUJD".into(),
            retry: false,
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(!json.contains("retry"));
        assert!(json.contains(r#""type":"chunk""#));
    }

    #[test]
    fn chunk_carries_retry_when_true() {
        let frame = TransferFrame::Chunk {
            file_id: FileId::generate(),
            index: 5,
            data: "QUJD".into(),
            retry: true,
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains(r#""retry":true"#));
    }

    #[test]
    fn ack_round_trip() {
        let frame = TransferFrame::Ack {
            file_id: FileId::generate(),
            acks: vec![0, 1, 2, 4],
        };
        let json = serde_json::to_string(&frame).unwrap();
        let decoded: TransferFrame = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn file_end_wire_shape() {
        let json = serde_json::to_string(&TransferFrame::FileEnd {
            file_id: FileId::generate(),
            total_chunks: 7,
        })
        .unwrap();
        assert!(json.contains(r#""type":"file-end""#));
        assert!(json.contains(r#""totalChunks":7"#));
    }
}
