//! Key agreement and key storage.

use std::collections::HashMap;

use aes_gcm::{Aes256Gcm, KeyInit};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use p256::ecdh::EphemeralSecret;
use p256::pkcs8::{DecodePublicKey, EncodePublicKey};
use p256::PublicKey;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

use crate::constants::{
    AES_KEY_LEN, MIN_PASSWORD_LEN, PASSWORD_HASH_DOMAIN, PBKDF2_ITERATIONS, ROOM_KEY_SALT_PREFIX,
};
use crate::error::{Error, Result};
use crate::protocol::PeerId;
use crate::room::RoomCode;

use super::envelope;

/// Per-session key material: the local ECDH keypair, one shared AES-256-GCM
/// key per remote peer, and the optional PBKDF2-derived room key.
///
/// Peer keys are derived once per peer-pair session and never exported;
/// `remove_peer` discards them on peer-left. The room key is held in memory
/// only and cleared on leave.
pub struct KeyManager {
    local_secret: EphemeralSecret,
    peer_keys: HashMap<PeerId, Aes256Gcm>,
    room_key: Option<Aes256Gcm>,
}

impl KeyManager {
    /// Generate a fresh local P-256 keypair for this session.
    pub fn generate() -> Self {
        KeyManager {
            local_secret: EphemeralSecret::random(&mut OsRng),
            peer_keys: HashMap::new(),
            room_key: None,
        }
    }

    /// Export the local public key as base64-encoded SPKI, the form the
    /// signaling plane carries in `offer`, `answer` and `key-exchange`.
    pub fn export_public_key(&self) -> Result<String> {
        let der = self
            .local_secret
            .public_key()
            .to_public_key_der()
            .map_err(|e| Error::Crypto {
                message: format!("SPKI export failed: {e}"),
            })?;
        Ok(BASE64.encode(der.as_bytes()))
    }

    /// Import a peer's SPKI public key and derive the shared AES-256-GCM key.
    ///
    /// The agreement is symmetric: both sides derive the same key with no
    /// further round-trips. Re-importing the same peer replaces the key.
    pub fn import_peer_public_key(&mut self, peer_id: PeerId, spki_b64: &str) -> Result<()> {
        let der = BASE64.decode(spki_b64).map_err(|e| Error::Crypto {
            message: format!("public key is not valid base64: {e}"),
        })?;
        let peer_public = PublicKey::from_public_key_der(&der).map_err(|e| Error::Crypto {
            message: format!("public key is not valid SPKI: {e}"),
        })?;

        let shared = self.local_secret.diffie_hellman(&peer_public);
        let key_bytes = shared.raw_secret_bytes();
        debug_assert_eq!(key_bytes.len(), AES_KEY_LEN);

        let cipher = Aes256Gcm::new_from_slice(key_bytes).map_err(|e| Error::Crypto {
            message: format!("derived key has wrong length: {e}"),
        })?;
        self.peer_keys.insert(peer_id, cipher);
        Ok(())
    }

    /// Whether a shared key exists for this peer.
    pub fn has_peer_key(&self, peer_id: &PeerId) -> bool {
        self.peer_keys.contains_key(peer_id)
    }

    /// Discard the shared key for a departed peer.
    pub fn remove_peer(&mut self, peer_id: &PeerId) {
        self.peer_keys.remove(peer_id);
    }

    /// Derive and store the room key from the room password.
    ///
    /// PBKDF2-HMAC-SHA256, 100 000 iterations, salted with
    /// `clouddrop-room-<roomCode>`.
    pub fn set_room_password(&mut self, password: &str, room: &RoomCode) -> Result<()> {
        if password.len() < MIN_PASSWORD_LEN {
            return Err(Error::PasswordTooShort {
                minimum: MIN_PASSWORD_LEN,
            });
        }
        let salt = format!("{ROOM_KEY_SALT_PREFIX}{room}");
        let mut key = [0u8; AES_KEY_LEN];
        pbkdf2::pbkdf2_hmac::<Sha256>(
            password.as_bytes(),
            salt.as_bytes(),
            PBKDF2_ITERATIONS,
            &mut key,
        );
        self.room_key = Some(Aes256Gcm::new_from_slice(&key).expect("32-byte key"));
        Ok(())
    }

    /// Drop the room key (on leaving the room or after a password rejection).
    pub fn clear_room_password(&mut self) {
        self.room_key = None;
    }

    /// Whether a room key is currently held.
    pub fn has_room_key(&self) -> bool {
        self.room_key.is_some()
    }

    /// Encrypt one chunk for `peer_id` with the dual-layer envelope.
    pub fn encrypt_chunk(&self, peer_id: &PeerId, plaintext: &[u8]) -> Result<Vec<u8>> {
        let peer_cipher = self
            .peer_keys
            .get(peer_id)
            .ok_or_else(|| Error::NoSharedKey(peer_id.clone()))?;
        envelope::seal_chunk(peer_cipher, self.room_key.as_ref(), plaintext)
    }

    /// Decrypt one chunk from `peer_id`, unwrapping both layers.
    pub fn decrypt_chunk(&self, peer_id: &PeerId, data: &[u8]) -> Result<Vec<u8>> {
        let peer_cipher = self
            .peer_keys
            .get(peer_id)
            .ok_or_else(|| Error::NoSharedKey(peer_id.clone()))?;
        envelope::open_chunk(peer_cipher, self.room_key.as_ref(), data)
    }
}

/// Hex SHA-256 of `"<password>:<roomCode>:clouddrop"`, the hash presented
/// to the hub's password gate. Distinct from the PBKDF2 room key so the hub
/// never learns anything usable for decryption.
pub fn hash_password_for_server(password: &str, room: &RoomCode) -> String {
    let composite = format!("{password}:{room}:{PASSWORD_HASH_DOMAIN}");
    hex::encode(Sha256::digest(composite.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exchanged_pair() -> (KeyManager, KeyManager, PeerId, PeerId) {
        let mut alice = KeyManager::generate();
        let mut bob = KeyManager::generate();
        let alice_id = PeerId::from("aaa");
        let bob_id = PeerId::from("bbb");
        alice
            .import_peer_public_key(bob_id.clone(), &bob.export_public_key().unwrap())
            .unwrap();
        bob.import_peer_public_key(alice_id.clone(), &alice.export_public_key().unwrap())
            .unwrap();
        (alice, bob, alice_id, bob_id)
    }

    #[test]
    fn ecdh_agreement_is_symmetric() {
        let (alice, bob, alice_id, bob_id) = exchanged_pair();
        let sealed = alice.encrypt_chunk(&bob_id, b"attack at dawn").unwrap();
        let opened = bob.decrypt_chunk(&alice_id, &sealed).unwrap();
        assert_eq!(opened, b"attack at dawn");
    }

    #[test]
    fn encrypt_without_key_fails() {
        let alice = KeyManager::generate();
        let err = alice.encrypt_chunk(&PeerId::from("zzz"), b"x").unwrap_err();
        assert!(matches!(err, Error::NoSharedKey(_)));
    }

    #[test]
    fn tampered_chunk_fails_authentication() {
        let (alice, bob, alice_id, bob_id) = exchanged_pair();
        let mut sealed = alice.encrypt_chunk(&bob_id, b"payload").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        let err = bob.decrypt_chunk(&alice_id, &sealed).unwrap_err();
        assert!(matches!(err, Error::DecryptionFailed));
    }

    #[test]
    fn spki_export_is_base64_der() {
        let alice = KeyManager::generate();
        let b64 = alice.export_public_key().unwrap();
        let der = BASE64.decode(b64).unwrap();
        // P-256 SPKI is 91 bytes: SEQUENCE header + AlgorithmIdentifier +
        // uncompressed point.
        assert_eq!(der.len(), 91);
    }

    #[test]
    fn bad_public_key_is_rejected() {
        let mut alice = KeyManager::generate();
        assert!(alice
            .import_peer_public_key(PeerId::from("bbb"), "!!!not-base64!!!")
            .is_err());
        assert!(alice
            .import_peer_public_key(PeerId::from("bbb"), &BASE64.encode(b"not spki"))
            .is_err());
    }

    #[test]
    fn remove_peer_discards_key() {
        let (alice, _bob, _alice_id, bob_id) = exchanged_pair();
        let mut alice = alice;
        assert!(alice.has_peer_key(&bob_id));
        alice.remove_peer(&bob_id);
        assert!(!alice.has_peer_key(&bob_id));
        assert!(alice.encrypt_chunk(&bob_id, b"x").is_err());
    }

    #[test]
    fn short_password_is_rejected() {
        let mut alice = KeyManager::generate();
        let room = RoomCode::parse("ABC234").unwrap();
        let err = alice.set_room_password("five5", &room).unwrap_err();
        assert!(matches!(err, Error::PasswordTooShort { minimum: 6 }));
        assert!(alice.set_room_password("sixsix", &room).is_ok());
        assert!(alice.has_room_key());
    }

    #[test]
    fn clear_room_password_drops_key() {
        let mut alice = KeyManager::generate();
        let room = RoomCode::parse("ABC234").unwrap();
        alice.set_room_password("secret-password", &room).unwrap();
        alice.clear_room_password();
        assert!(!alice.has_room_key());
    }

    #[test]
    fn server_hash_is_salted_by_room() {
        let room_a = RoomCode::parse("ABC234").unwrap();
        let room_b = RoomCode::parse("XYZ789").unwrap();
        let h1 = hash_password_for_server("hunter2hunter", &room_a);
        let h2 = hash_password_for_server("hunter2hunter", &room_a);
        let h3 = hash_password_for_server("hunter2hunter", &room_b);
        assert_eq!(h1, h2);
        assert_ne!(h1, h3);
        assert_eq!(h1.len(), 64);
        assert!(h1.bytes().all(|b| b.is_ascii_hexdigit()));
    }
}
