//! Room registry: membership, attachments, and the password gate.

use std::collections::HashMap;

use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};

use clouddrop_core::protocol::{PeerId, PeerInfo};

/// Outbound frame queue handle for one connected session. Writes are
/// serialized by the session's writer task.
pub type SessionSender = mpsc::UnboundedSender<warp::ws::Message>;

/// One participant: the announced attachment plus its outbound queue.
#[derive(Debug, Clone)]
pub struct Participant {
    pub info: PeerInfo,
    pub sender: SessionSender,
}

/// One room: the immutable-once-set password hash and current membership.
#[derive(Debug, Default)]
struct Room {
    password_hash: Option<String>,
    peers: HashMap<PeerId, Participant>,
}

/// Process-wide registry of rooms, keyed by canonical room code.
///
/// Rooms without a password are dropped when their last peer leaves;
/// password-protected rooms persist so the hash stays immutable for the
/// room's lifetime.
#[derive(Debug, Default)]
pub struct RoomRegistry {
    rooms: RwLock<HashMap<String, Room>>,
}

/// Result of a set-password request.
#[derive(Debug, PartialEq, Eq)]
pub enum SetPasswordOutcome {
    Set,
    AlreadySet,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The stored password hash for a room, if any.
    pub async fn password_hash(&self, room: &str) -> Option<String> {
        self.rooms
            .read()
            .await
            .get(room)
            .and_then(|r| r.password_hash.clone())
    }

    /// Whether the room currently has a password set.
    pub async fn has_password(&self, room: &str) -> bool {
        self.password_hash(room).await.is_some()
    }

    /// Store a password hash. Once set, the hash is immutable: later
    /// attempts fail without mutating it.
    pub async fn set_password(&self, room: &str, hash: String) -> SetPasswordOutcome {
        let mut rooms = self.rooms.write().await;
        let entry = rooms.entry(room.to_string()).or_default();
        if entry.password_hash.is_some() {
            return SetPasswordOutcome::AlreadySet;
        }
        info!(room, "room password set");
        entry.password_hash = Some(hash);
        SetPasswordOutcome::Set
    }

    /// Register a joined peer and return the attachments that were already
    /// present (for the `joined` reply).
    pub async fn join(&self, room: &str, participant: Participant) -> Vec<PeerInfo> {
        let mut rooms = self.rooms.write().await;
        let entry = rooms.entry(room.to_string()).or_default();
        let existing: Vec<PeerInfo> = entry.peers.values().map(|p| p.info.clone()).collect();
        info!(room, peer_id = %participant.info.id, name = %participant.info.name, "peer joined");
        entry.peers.insert(participant.info.id.clone(), participant);
        existing
    }

    /// Remove a peer; drops the room when it empties and holds no password.
    pub async fn leave(&self, room: &str, peer_id: &PeerId) {
        let mut rooms = self.rooms.write().await;
        if let Some(entry) = rooms.get_mut(room) {
            entry.peers.remove(peer_id);
            info!(room, %peer_id, "peer left");
            if entry.peers.is_empty() && entry.password_hash.is_none() {
                rooms.remove(room);
                debug!(room, "empty room dropped");
            }
        }
    }

    /// Update a peer's display name, returning the refreshed attachment.
    pub async fn rename(&self, room: &str, peer_id: &PeerId, name: String) -> Option<PeerInfo> {
        let mut rooms = self.rooms.write().await;
        let participant = rooms.get_mut(room)?.peers.get_mut(peer_id)?;
        participant.info.name = name;
        Some(participant.info.clone())
    }

    /// Sender handle for one specific peer. Frames with a `to` field go
    /// here and nowhere else.
    pub async fn sender_to(&self, room: &str, peer_id: &PeerId) -> Option<SessionSender> {
        self.rooms
            .read()
            .await
            .get(room)?
            .peers
            .get(peer_id)
            .map(|p| p.sender.clone())
    }

    /// Sender handles for every peer in the room except `exclude`.
    pub async fn senders_except(&self, room: &str, exclude: &PeerId) -> Vec<SessionSender> {
        match self.rooms.read().await.get(room) {
            Some(entry) => entry
                .peers
                .iter()
                .filter(|(id, _)| *id != exclude)
                .map(|(_, p)| p.sender.clone())
                .collect(),
            None => Vec::new(),
        }
    }

    /// Number of peers currently in the room.
    pub async fn peer_count(&self, room: &str) -> usize {
        self.rooms
            .read()
            .await
            .get(room)
            .map_or(0, |r| r.peers.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clouddrop_core::protocol::DeviceClass;

    fn participant(id: &str) -> Participant {
        let (tx, _rx) = mpsc::unbounded_channel();
        Participant {
            info: PeerInfo {
                id: PeerId::from(id),
                name: format!("peer-{id}"),
                device_type: DeviceClass::Desktop,
                browser_info: "test".into(),
            },
            sender: tx,
        }
    }

    #[tokio::test]
    async fn join_returns_existing_peers() {
        let registry = RoomRegistry::new();
        let existing = registry.join("ABC234", participant("aaa")).await;
        assert!(existing.is_empty());

        let existing = registry.join("ABC234", participant("bbb")).await;
        assert_eq!(existing.len(), 1);
        assert_eq!(existing[0].id, PeerId::from("aaa"));
        assert_eq!(registry.peer_count("ABC234").await, 2);
    }

    #[tokio::test]
    async fn password_is_immutable_once_set() {
        let registry = RoomRegistry::new();
        assert_eq!(
            registry.set_password("SECUR3", "aaaa".into()).await,
            SetPasswordOutcome::Set
        );
        assert_eq!(
            registry.set_password("SECUR3", "bbbb".into()).await,
            SetPasswordOutcome::AlreadySet
        );
        assert_eq!(registry.password_hash("SECUR3").await.as_deref(), Some("aaaa"));
    }

    #[tokio::test]
    async fn empty_passwordless_room_is_dropped() {
        let registry = RoomRegistry::new();
        registry.join("ABC234", participant("aaa")).await;
        registry.leave("ABC234", &PeerId::from("aaa")).await;
        assert_eq!(registry.peer_count("ABC234").await, 0);
        assert!(!registry.has_password("ABC234").await);
    }

    #[tokio::test]
    async fn password_room_survives_emptying() {
        let registry = RoomRegistry::new();
        registry.set_password("SECUR3", "hash".into()).await;
        registry.join("SECUR3", participant("aaa")).await;
        registry.leave("SECUR3", &PeerId::from("aaa")).await;
        assert!(registry.has_password("SECUR3").await);
    }

    #[tokio::test]
    async fn sender_to_targets_only_the_addressee() {
        let registry = RoomRegistry::new();
        registry.join("ABC234", participant("aaa")).await;
        registry.join("ABC234", participant("bbb")).await;

        assert!(registry.sender_to("ABC234", &PeerId::from("bbb")).await.is_some());
        assert!(registry.sender_to("ABC234", &PeerId::from("zzz")).await.is_none());
        assert_eq!(
            registry.senders_except("ABC234", &PeerId::from("aaa")).await.len(),
            1
        );
    }

    #[tokio::test]
    async fn rename_updates_attachment() {
        let registry = RoomRegistry::new();
        registry.join("ABC234", participant("aaa")).await;
        let updated = registry
            .rename("ABC234", &PeerId::from("aaa"), "Renamed".into())
            .await
            .unwrap();
        assert_eq!(updated.name, "Renamed");
    }
}
