//! Chunk sealing and opening for the dual-layer envelope.
//!
//! Encrypt order: plaintext → (optional) room layer → peer layer. Decrypt is
//! the exact reverse. The room layer is optional from the receiver's side
//! too: a chunk with `roomIvLen == 0` is accepted even when the receiver
//! holds a room key, because the *sender* may legitimately not have entered
//! the password. The reverse is an error: a room-layered chunk cannot be
//! opened without the room key.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, Nonce};

use crate::constants::GCM_IV_LEN;
use crate::error::{Error, Result};

/// Seal one chunk: room layer (if a room key is present) then peer layer.
/// Fresh random 12-byte IV per AES-GCM operation.
pub fn seal_chunk(
    peer_cipher: &Aes256Gcm,
    room_cipher: Option<&Aes256Gcm>,
    plaintext: &[u8],
) -> Result<Vec<u8>> {
    let (room_iv, inner): (Option<[u8; GCM_IV_LEN]>, Vec<u8>) = match room_cipher {
        Some(cipher) => {
            let iv: [u8; GCM_IV_LEN] = rand::random();
            let sealed = cipher
                .encrypt(Nonce::from_slice(&iv), plaintext)
                .map_err(|_| Error::DecryptionFailed)?;
            (Some(iv), sealed)
        }
        None => (None, plaintext.to_vec()),
    };

    let peer_iv: [u8; GCM_IV_LEN] = rand::random();
    let sealed = peer_cipher
        .encrypt(Nonce::from_slice(&peer_iv), inner.as_slice())
        .map_err(|_| Error::DecryptionFailed)?;

    let room_iv_len = room_iv.map_or(0, |_| GCM_IV_LEN);
    let mut out = Vec::with_capacity(1 + room_iv_len + GCM_IV_LEN + sealed.len());
    out.push(room_iv_len as u8);
    if let Some(iv) = room_iv {
        out.extend_from_slice(&iv);
    }
    out.extend_from_slice(&peer_iv);
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Open one chunk: peer layer, then the room layer if the header says one
/// is present.
///
/// AEAD authentication failure is terminal for the chunk; the plaintext is
/// never partially recovered.
pub fn open_chunk(
    peer_cipher: &Aes256Gcm,
    room_cipher: Option<&Aes256Gcm>,
    data: &[u8],
) -> Result<Vec<u8>> {
    let (&room_iv_len, rest) = data
        .split_first()
        .ok_or_else(|| Error::protocol("empty chunk frame"))?;
    let room_iv_len = room_iv_len as usize;
    if room_iv_len != 0 && room_iv_len != GCM_IV_LEN {
        return Err(Error::protocol(format!(
            "invalid room IV length {room_iv_len}"
        )));
    }
    if rest.len() < room_iv_len + GCM_IV_LEN {
        return Err(Error::protocol("chunk frame shorter than its header"));
    }

    let (room_iv, rest) = rest.split_at(room_iv_len);
    let (peer_iv, ciphertext) = rest.split_at(GCM_IV_LEN);

    let inner = peer_cipher
        .decrypt(Nonce::from_slice(peer_iv), ciphertext)
        .map_err(|_| Error::DecryptionFailed)?;

    if room_iv_len == 0 {
        return Ok(inner);
    }

    let room_cipher = room_cipher.ok_or(Error::RoomKeyMissing)?;
    room_cipher
        .decrypt(Nonce::from_slice(room_iv), inner.as_slice())
        .map_err(|_| Error::DecryptionFailed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use aes_gcm::KeyInit;

    fn cipher(byte: u8) -> Aes256Gcm {
        Aes256Gcm::new_from_slice(&[byte; 32]).unwrap()
    }

    #[test]
    fn round_trip_without_room_layer() {
        let peer = cipher(1);
        let sealed = seal_chunk(&peer, None, b"hello").unwrap();
        assert_eq!(sealed[0], 0);
        assert_eq!(open_chunk(&peer, None, &sealed).unwrap(), b"hello");
    }

    #[test]
    fn round_trip_with_room_layer() {
        let peer = cipher(1);
        let room = cipher(2);
        let sealed = seal_chunk(&peer, Some(&room), b"hello").unwrap();
        assert_eq!(sealed[0], GCM_IV_LEN as u8);
        assert_eq!(open_chunk(&peer, Some(&room), &sealed).unwrap(), b"hello");
    }

    #[test]
    fn plain_chunk_accepted_by_receiver_with_room_key() {
        // Sender has no room password; receiver does. The room layer is
        // optional from the receiver's perspective as well.
        let peer = cipher(1);
        let room = cipher(2);
        let sealed = seal_chunk(&peer, None, b"hello").unwrap();
        assert_eq!(open_chunk(&peer, Some(&room), &sealed).unwrap(), b"hello");
    }

    #[test]
    fn room_chunk_without_room_key_fails() {
        let peer = cipher(1);
        let room = cipher(2);
        let sealed = seal_chunk(&peer, Some(&room), b"hello").unwrap();
        let err = open_chunk(&peer, None, &sealed).unwrap_err();
        assert!(matches!(err, Error::RoomKeyMissing));
    }

    #[test]
    fn wrong_room_key_fails_authentication() {
        let peer = cipher(1);
        let sealed = seal_chunk(&peer, Some(&cipher(2)), b"hello").unwrap();
        let err = open_chunk(&peer, Some(&cipher(3)), &sealed).unwrap_err();
        assert!(matches!(err, Error::DecryptionFailed));
    }

    #[test]
    fn empty_plaintext_round_trips() {
        let peer = cipher(1);
        let sealed = seal_chunk(&peer, None, b"").unwrap();
        assert_eq!(open_chunk(&peer, None, &sealed).unwrap(), b"");
    }

    #[test]
    fn large_plaintext_round_trips() {
        // Upper bound of the round-trip property: 1 MiB.
        let peer = cipher(1);
        let room = cipher(2);
        let payload: Vec<u8> = (0..1024 * 1024).map(|i| (i % 251) as u8).collect();
        let sealed = seal_chunk(&peer, Some(&room), &payload).unwrap();
        assert_eq!(open_chunk(&peer, Some(&room), &sealed).unwrap(), payload);
    }

    #[test]
    fn truncated_frames_are_protocol_errors() {
        let peer = cipher(1);
        assert!(matches!(
            open_chunk(&peer, None, &[]).unwrap_err(),
            Error::Protocol { .. }
        ));
        assert!(matches!(
            open_chunk(&peer, None, &[0, 1, 2]).unwrap_err(),
            Error::Protocol { .. }
        ));
        // roomIvLen of 7 is neither 0 nor 12.
        assert!(matches!(
            open_chunk(&peer, None, &[7; 64]).unwrap_err(),
            Error::Protocol { .. }
        ));
    }

    #[test]
    fn ivs_are_fresh_per_seal() {
        let peer = cipher(1);
        let a = seal_chunk(&peer, None, b"same").unwrap();
        let b = seal_chunk(&peer, None, b"same").unwrap();
        assert_ne!(a, b);
    }
}
