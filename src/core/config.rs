//! Centralized configuration constants for DropSync.
//!
//! All tunable parameters live here so they can be reviewed and adjusted
//! in a single place. Wire-format constants (frame labels, crypto sizes)
//! stay in their respective modules.

use std::time::Duration;
use webrtc::ice_transport::ice_server::RTCIceServer;

// ── Transfer / Chunking ──────────────────────────────────────────────────────

/// File chunk size in bytes (16 KiB).
///
/// Sized to fit comfortably inside the 64 KiB SCTP receive window used by
/// browser and webrtc-rs endpoints, with room for the AES-256-GCM envelope
/// (12-byte IV + 16-byte tag).
pub const CHUNK_SIZE: usize = 16 * 1024;

/// High water mark for a file channel's SCTP send buffer (bytes).
/// When `buffered_amount` exceeds this value the sender suspends until the
/// buffered-amount-low callback fires. Doubles as the low threshold.
pub const BUFFERED_AMOUNT_LOW_THRESHOLD: usize = 64 * 1024;

/// Maximum time to wait for the send buffer to drain below the low
/// threshold before the transfer fails with `buffer-timeout`.
pub const BUFFER_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout waiting for a freshly opened file channel to reach `Open`.
pub const CHANNEL_OPEN_TIMEOUT: Duration = Duration::from_secs(5);

/// Grace period between sending `file-end` and closing the substream,
/// giving the receiver time to drain in-flight chunks.
pub const SUBSTREAM_LINGER: Duration = Duration::from_secs(1);

// ── Channels ─────────────────────────────────────────────────────────────────

/// Label of the reliable ordered control channel (auth + chat).
pub const CONTROL_CHANNEL_LABEL: &str = "signaling";

/// Label prefix for per-file substreams: `file-<uuid>`.
pub const FILE_CHANNEL_PREFIX: &str = "file-";

// ── Signaling carrier ────────────────────────────────────────────────────────

/// Keepalive ping cadence on the signaling WebSocket. Defeats 60-second
/// idle timeouts at intermediaries.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);

/// Deadline for the relay's pong after a keepalive ping.
pub const PONG_DEADLINE: Duration = Duration::from_secs(5);

/// Delays (in seconds) between signaling reconnect attempts.
pub const RECONNECT_RETRY_DELAYS: [u64; 5] = [1, 2, 5, 10, 30];

// ── Liveness / Stats ─────────────────────────────────────────────────────────

/// Interval for sampling the nominated ICE candidate pair (round-trip
/// time, remote IP) while connected.
pub const STATS_INTERVAL: Duration = Duration::from_secs(2);

// ── Authentication ───────────────────────────────────────────────────────────

/// Length of the random auth challenge in bytes.
pub const CHALLENGE_LEN: usize = 32;

// ── Key derivation ───────────────────────────────────────────────────────────

/// PBKDF2-HMAC-SHA-256 iteration count for password key derivation.
pub const KDF_ITERATIONS: u32 = 100_000;

/// Fixed domain-separation salt for key derivation. A deployment may
/// substitute a room-scoped salt without any protocol change.
pub const KDF_SALT: &[u8] = b"dropsync-key-derivation-v1";

// ── Rooms ────────────────────────────────────────────────────────────────────

/// Length of a generated room id (36-ary digits).
pub const ROOM_ID_LEN: usize = 7;

// ── ICE ──────────────────────────────────────────────────────────────────────

/// Default ICE servers: one public STUN server plus a TURN fallback for
/// symmetric NAT and restrictive firewalls.
pub fn default_ice_servers() -> Vec<RTCIceServer> {
    vec![
        RTCIceServer {
            urls: vec!["stun:stun.l.google.com:19302".into()],
            username: String::new(),
            credential: String::new(),
            credential_type: Default::default(),
        },
        RTCIceServer {
            urls: vec!["turn:openrelay.metered.ca:80".into()],
            username: "openrelayproject".into(),
            credential: "openrelayproject".into(),
            credential_type: Default::default(),
        },
    ]
}
