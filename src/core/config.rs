//! Centralized configuration constants for roomdrop.
//!
//! All tunable parameters live here so they can be reviewed and adjusted
//! in a single place. Wire-format details (message tags, frame kinds) stay
//! in their respective modules.

// ── Transfer / Chunking ──────────────────────────────────────────────────────

/// Maximum file chunk size in bytes (200 KiB).
///
/// One chunk is one binary data-channel message. The channel is ordered and
/// reliable, and the sender never has more than one unacknowledged chunk in
/// flight, so chunks carry no sequence numbers.
pub const MAX_CHUNK_SIZE: usize = 200 * 1024;

// ── Connection / Network ─────────────────────────────────────────────────────

/// Label used for the per-peer data channel.
pub const DATA_CHANNEL_LABEL: &str = "transfer";

/// STUN servers offered to the ICE agent.
pub const STUN_SERVERS: [&str; 2] = [
    "stun:stun1.l.google.com:19302",
    "stun:stun3.l.google.com:19302",
];

/// Explicit large SCTP max message size (1 MiB).
///
/// The webrtc crate's default send cap is 64 KB, smaller than one file
/// chunk. A concrete bound is used instead of Unbounded (0) because some
/// WebRTC implementations interpret 0 as "use default 64 KB".
pub const SCTP_MAX_MESSAGE_SIZE: u32 = 1024 * 1024;
