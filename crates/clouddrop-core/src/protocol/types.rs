//! Identity and peer types shared by both protocol planes.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque peer identifier issued by the hub on join.
///
/// 128 bits, hex-encoded. Ordering is lexicographic on the encoded form;
/// the *smaller* peer id is the polite side in Perfect Negotiation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Generate a fresh peer id (hub side).
    pub fn generate() -> Self {
        PeerId(Uuid::new_v4().simple().to_string())
    }

    /// View the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True if the local id is the polite side against `remote`.
    pub fn is_polite_towards(&self, remote: &PeerId) -> bool {
        self < remote
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        PeerId(s.to_string())
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        PeerId(s)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a single file transfer (UUID v4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileId(Uuid);

impl FileId {
    /// Generate a fresh transfer id.
    pub fn generate() -> Self {
        FileId(Uuid::new_v4())
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Broad device classification, used for UI badges and trust fingerprints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    #[default]
    Desktop,
    Mobile,
    Tablet,
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceClass::Desktop => f.write_str("desktop"),
            DeviceClass::Mobile => f.write_str("mobile"),
            DeviceClass::Tablet => f.write_str("tablet"),
        }
    }
}

/// A room participant as announced by the hub.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub id: PeerId,
    pub name: String,
    pub device_type: DeviceClass,
    pub browser_info: String,
}

/// Which path a transfer is using.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferMode {
    /// End-to-end data channel between the peers.
    Direct,
    /// Hub-forwarded `relay-data` frames.
    Relay,
}

impl fmt::Display for TransferMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferMode::Direct => f.write_str("direct"),
            TransferMode::Relay => f.write_str("relay"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_politeness_is_lexicographic() {
        let a = PeerId::from("aaa");
        let b = PeerId::from("bbb");
        assert!(a.is_polite_towards(&b));
        assert!(!b.is_polite_towards(&a));
    }

    #[test]
    fn peer_id_serializes_transparently() {
        let id = PeerId::from("deadbeef");
        assert_eq!(serde_json::to_string(&id).unwrap(), r#""deadbeef""#);
    }

    #[test]
    fn generated_peer_ids_are_distinct() {
        assert_ne!(PeerId::generate(), PeerId::generate());
    }

    #[test]
    fn device_class_wire_names() {
        assert_eq!(
            serde_json::to_string(&DeviceClass::Mobile).unwrap(),
            r#""mobile""#
        );
        let parsed: DeviceClass = serde_json::from_str(r#""tablet""#).unwrap();
        assert_eq!(parsed, DeviceClass::Tablet);
    }

    #[test]
    fn transfer_mode_wire_names() {
        assert_eq!(
            serde_json::to_string(&TransferMode::Relay).unwrap(),
            r#""relay""#
        );
    }
}
