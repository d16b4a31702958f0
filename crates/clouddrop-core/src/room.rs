//! Room codes and room-related helpers.
//!
//! A room is keyed by a 6-character code. User-supplied codes are drawn from
//! an unambiguous 32-symbol alphabet; codes auto-derived from a client's
//! network prefix are hex-shaped and treated as opaque (they never pass
//! through user entry, so ambiguity does not apply).

use std::fmt;
use std::net::IpAddr;

use rand::Rng;
use sha2::{Digest, Sha256};

use crate::constants::{ROOM_CODE_ALPHABET, ROOM_CODE_LEN};
use crate::error::{Error, Result};

/// Canonical room code: exactly 6 characters, stored upper-cased.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct RoomCode(String);

impl RoomCode {
    /// Parse and canonicalize a user-supplied room code.
    ///
    /// Accepts lower- or upper-case input; rejects wrong lengths and symbols
    /// outside the unambiguous alphabet.
    pub fn parse(input: &str) -> Result<Self> {
        let canonical = input.trim().to_ascii_uppercase();
        if canonical.len() != ROOM_CODE_LEN {
            return Err(Error::protocol(format!(
                "room code must be {} characters, got {}",
                ROOM_CODE_LEN,
                canonical.len()
            )));
        }
        if let Some(bad) = canonical
            .bytes()
            .find(|b| !ROOM_CODE_ALPHABET.contains(b))
        {
            return Err(Error::protocol(format!(
                "room code contains invalid character '{}'",
                bad as char
            )));
        }
        Ok(RoomCode(canonical))
    }

    /// Draw a random code from the unambiguous alphabet.
    pub fn generate<R: Rng>(rng: &mut R) -> Self {
        let code: String = (0..ROOM_CODE_LEN)
            .map(|_| ROOM_CODE_ALPHABET[rng.gen_range(0..ROOM_CODE_ALPHABET.len())] as char)
            .collect();
        RoomCode(code)
    }

    /// Derive the deterministic room code for a client address.
    ///
    /// Clients on the same network land in the same room: the network part is
    /// the first three octets for IPv4 and the first four groups for IPv6;
    /// loopback and unspecified addresses map to the literal `localhost`.
    /// The code is the upper-cased prefix of the SHA-256 of that string.
    pub fn from_network(addr: IpAddr) -> Self {
        let network = network_prefix(addr);
        let digest = Sha256::digest(network.as_bytes());
        let hex = hex::encode(digest);
        RoomCode(hex[..ROOM_CODE_LEN].to_ascii_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn network_prefix(addr: IpAddr) -> String {
    match addr {
        _ if addr.is_loopback() || addr.is_unspecified() => "localhost".to_string(),
        IpAddr::V4(v4) => {
            let [a, b, c, _] = v4.octets();
            format!("{a}.{b}.{c}")
        }
        IpAddr::V6(v6) => {
            let groups = v6.segments();
            format!(
                "{:x}:{:x}:{:x}:{:x}",
                groups[0], groups[1], groups[2], groups[3]
            )
        }
    }
}

/// Advisory password strength, surfaced in the UI only, never enforced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PasswordStrength {
    Weak,
    Fair,
    Strong,
}

/// Score a room password against the advisory heuristic: length ≥ 10,
/// mixed case, a digit, and a non-alphanumeric symbol.
pub fn password_strength(password: &str) -> PasswordStrength {
    let mut score = 0u8;
    if password.len() >= 10 {
        score += 1;
    }
    if password.chars().any(|c| c.is_ascii_lowercase())
        && password.chars().any(|c| c.is_ascii_uppercase())
    {
        score += 1;
    }
    if password.chars().any(|c| c.is_ascii_digit()) {
        score += 1;
    }
    if password.chars().any(|c| !c.is_ascii_alphanumeric()) {
        score += 1;
    }
    match score {
        0 | 1 => PasswordStrength::Weak,
        2 | 3 => PasswordStrength::Fair,
        _ => PasswordStrength::Strong,
    }
}

/// Stable device fingerprint used by the trusted-device store.
///
/// SHA-256 hex of `"<name>|<deviceType>|<browserInfo>"`.
pub fn device_fingerprint(name: &str, device_type: &str, browser_info: &str) -> String {
    let composite = format!("{name}|{device_type}|{browser_info}");
    hex::encode(Sha256::digest(composite.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn parse_canonicalizes_case() {
        let code = RoomCode::parse("abc234").unwrap();
        assert_eq!(code.as_str(), "ABC234");
    }

    #[test]
    fn parse_rejects_wrong_length() {
        assert!(RoomCode::parse("ABC23").is_err());
        assert!(RoomCode::parse("ABC2345").is_err());
    }

    #[test]
    fn parse_rejects_ambiguous_symbols() {
        assert!(RoomCode::parse("ABC230").is_err()); // 0
        assert!(RoomCode::parse("ABCO34").is_err()); // O
        assert!(RoomCode::parse("ABC1XY").is_err()); // 1
        assert!(RoomCode::parse("ABCIXY").is_err()); // I
    }

    #[test]
    fn generated_codes_are_well_formed() {
        let mut rng = rand::thread_rng();
        for _ in 0..32 {
            let code = RoomCode::generate(&mut rng);
            assert!(RoomCode::parse(code.as_str()).is_ok());
        }
    }

    #[test]
    fn same_subnet_same_room() {
        let a = RoomCode::from_network(IpAddr::V4(Ipv4Addr::new(192, 168, 7, 10)));
        let b = RoomCode::from_network(IpAddr::V4(Ipv4Addr::new(192, 168, 7, 200)));
        let c = RoomCode::from_network(IpAddr::V4(Ipv4Addr::new(192, 168, 8, 10)));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.as_str().len(), ROOM_CODE_LEN);
    }

    #[test]
    fn ipv6_uses_first_four_groups() {
        let a = RoomCode::from_network("2001:db8:aaaa:bbbb::1".parse::<Ipv6Addr>().unwrap().into());
        let b = RoomCode::from_network("2001:db8:aaaa:bbbb::ffff".parse::<Ipv6Addr>().unwrap().into());
        let c = RoomCode::from_network("2001:db8:aaaa:cccc::1".parse::<Ipv6Addr>().unwrap().into());
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn loopback_maps_to_localhost_room() {
        let v4 = RoomCode::from_network(IpAddr::V4(Ipv4Addr::LOCALHOST));
        let v6 = RoomCode::from_network(IpAddr::V6(Ipv6Addr::LOCALHOST));
        assert_eq!(v4, v6);
    }

    #[test]
    fn strength_heuristic() {
        assert_eq!(password_strength("abc"), PasswordStrength::Weak);
        assert_eq!(password_strength("abcdefgHij"), PasswordStrength::Fair);
        assert_eq!(password_strength("Abcdefghi7!"), PasswordStrength::Strong);
    }

    #[test]
    fn fingerprint_is_stable_and_distinct() {
        let a = device_fingerprint("Falcon", "desktop", "Firefox on Linux");
        let b = device_fingerprint("Falcon", "desktop", "Firefox on Linux");
        let c = device_fingerprint("Falcon", "mobile", "Firefox on Linux");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }
}
