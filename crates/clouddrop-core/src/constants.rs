//! Protocol and configuration constants for CloudDrop.

use std::time::Duration;

// =============================================================================
// Protocol Constants
// =============================================================================

/// Current signaling protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// File payload chunk size (64 KiB).
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Direct-path backpressure threshold on the data channel (1 MiB).
pub const MAX_BUFFERED_AMOUNT: usize = 1024 * 1024;

/// Poll interval while the data channel buffer is above threshold.
pub const BUFFER_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// AES-GCM IV length in bytes.
pub const GCM_IV_LEN: usize = 12;

/// Derived AES key length in bytes (AES-256).
pub const AES_KEY_LEN: usize = 32;

/// PBKDF2-HMAC-SHA256 iteration count for room keys.
pub const PBKDF2_ITERATIONS: u32 = 100_000;

/// Domain separator appended to the salted server password hash.
pub const PASSWORD_HASH_DOMAIN: &str = "clouddrop";

/// Salt prefix for PBKDF2 room-key derivation.
pub const ROOM_KEY_SALT_PREFIX: &str = "clouddrop-room-";

// =============================================================================
// Room Constants
// =============================================================================

/// Room code length in characters.
pub const ROOM_CODE_LEN: usize = 6;

/// Unambiguous room code alphabet (32 symbols, excluding `0 O 1 I`).
pub const ROOM_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Minimum room password length.
pub const MIN_PASSWORD_LEN: usize = 6;

/// WebSocket close code: room requires a password, none supplied.
pub const CLOSE_PASSWORD_REQUIRED: u16 = 4001;

/// WebSocket close code: supplied password hash did not match.
pub const CLOSE_PASSWORD_INCORRECT: u16 = 4002;

// =============================================================================
// Connection Engine Timing
// =============================================================================

/// After this long without a direct connection, notify the UI "slow".
pub const SLOW_THRESHOLD: Duration = Duration::from_secs(3);

/// Fast-fallback decision point: consult the quality prediction here.
pub const FAST_FALLBACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Unconditional relay commit for a direct attempt.
pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Grace period after `disconnected` before committing to relay.
pub const DISCONNECTED_TIMEOUT: Duration = Duration::from_secs(3);

/// Pause before issuing an ICE-restart offer.
pub const ICE_RESTART_DELAY: Duration = Duration::from_millis(500);

/// Maximum ICE restarts before committing to relay.
pub const MAX_ICE_RESTARTS: u32 = 2;

/// Candidate gathering warning threshold.
pub const GATHERING_WARN_THRESHOLD: Duration = Duration::from_secs(3);

// =============================================================================
// Background P2P Recovery
// =============================================================================

/// Delay before the first silent background direct-connection retry.
pub const P2P_RETRY_INITIAL_DELAY: Duration = Duration::from_secs(10);

/// Interval between subsequent background retries.
pub const P2P_RETRY_INTERVAL: Duration = Duration::from_secs(30);

/// Maximum background retry attempts per relay commitment.
pub const P2P_RETRY_MAX_ATTEMPTS: u32 = 10;

/// Prewarm delay bounds after peer discovery.
pub const PREWARM_DELAY_MIN: Duration = Duration::from_millis(300);
pub const PREWARM_DELAY_MAX: Duration = Duration::from_millis(600);

// =============================================================================
// ICE Server Selection
// =============================================================================

/// Per-server cap on a STUN health probe.
pub const STUN_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// How long a ranked ICE server list stays valid.
pub const ICE_CACHE_TTL: Duration = Duration::from_secs(300);

// =============================================================================
// Transfer Protocol Timing
// =============================================================================

/// How long the sender waits for `file-response`.
pub const FILE_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Relay path: ACK deadline for the oldest pending chunk.
pub const ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Relay path: retransmissions per chunk before the transfer fails.
pub const MAX_CHUNK_RETRIES: u32 = 3;

/// Relay path: maximum outstanding unacknowledged chunks.
pub const RELAY_WINDOW_SIZE: usize = 10;

/// Relay path: distinct chunks received per batched ACK.
pub const ACK_BATCH_SIZE: usize = 5;

/// Relay path: pacing delay between successive chunk sends.
pub const CHUNK_INTERVAL: Duration = Duration::from_millis(5);

/// Relay path: fail the transfer when no ACK arrives for this long.
pub const TRANSFER_TIMEOUT: Duration = Duration::from_secs(30);

/// Wait for in-flight chunks after `file-end` before reporting missing.
pub const LATE_CHUNK_GRACE: Duration = Duration::from_secs(3);

/// Key-exchange fallback: wait for the counterparty's public key.
pub const KEY_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(5);

// =============================================================================
// Hub Session
// =============================================================================

/// Delay before reconnecting to the hub after an unexpected close.
pub const HUB_RECONNECT_DELAY: Duration = Duration::from_secs(3);

/// Hub keep-alive ping interval.
pub const HUB_PING_INTERVAL: Duration = Duration::from_secs(30);
