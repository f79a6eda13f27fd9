//! Chunked file transfer: consent handshake, stop-and-wait flow control,
//! and receiver-side reassembly.
//!
//! # Protocol overview
//!
//! - Consent travels over signaling: `send-file-request` →
//!   `request-accepted` / `request-cancelled` → `transfer-finished`.
//! - File bytes travel over the data channel as raw binary messages of at
//!   most [`MAX_CHUNK_SIZE`] bytes each.
//! - Flow control is stop-and-wait: the receiver acknowledges every chunk
//!   except the final one with a text control frame, and the sender never
//!   emits chunk *n+1* before the acknowledgment for chunk *n*.
//! - Frame kind is distinguished by payload type (binary vs. text), not by
//!   a shared envelope.
//!
//! [`MAX_CHUNK_SIZE`]: crate::core::config::MAX_CHUNK_SIZE

pub mod protocol;
pub mod reassembly;
pub mod session;
pub mod source;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

// ── Data-channel frames ──────────────────────────────────────────────────────

/// Control messages multiplexed onto the data channel as text frames.
///
/// The only defined control message is the per-chunk acknowledgment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ControlFrame {
    /// Acknowledges receipt of the most recent chunk.
    Ack { peer_id: String },
}

/// An outbound data-channel message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelFrame {
    /// A raw file chunk (≤ [`MAX_CHUNK_SIZE`] bytes).
    ///
    /// [`MAX_CHUNK_SIZE`]: crate::core::config::MAX_CHUNK_SIZE
    Binary(Bytes),
    /// A JSON-serialized [`ControlFrame`].
    Text(String),
}

// ── Pending request table ────────────────────────────────────────────────────

/// Handshake phase of a peer's pending transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestPhase {
    /// A `send-file-request` is out, awaiting the peer's consent.
    Waiting,
    /// Consent granted; bytes are moving.
    Downloading,
}

/// Tracks each peer's handshake phase independently of session internals,
/// so callers can ask "is this peer's transfer awaiting consent or actively
/// moving bytes" without reaching into the state machine.
///
/// Process-wide; one mutex guards the whole table. No two writers may race
/// on the same peer id's entry.
#[derive(Debug, Default)]
pub struct PendingRequestTable {
    entries: Mutex<HashMap<String, RequestPhase>>,
}

impl PendingRequestTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// The peer's current phase, if any request is pending.
    pub fn phase(&self, peer_id: &str) -> Option<RequestPhase> {
        self.entries.lock().unwrap().get(peer_id).copied()
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.entries.lock().unwrap().contains_key(peer_id)
    }

    pub fn set(&self, peer_id: &str, phase: RequestPhase) {
        self.entries
            .lock()
            .unwrap()
            .insert(peer_id.to_string(), phase);
    }

    /// Remove the peer's entry. Removing an absent entry is not an error.
    pub fn remove(&self, peer_id: &str) {
        self.entries.lock().unwrap().remove(peer_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_frame_wire_shape() {
        let json = serde_json::to_value(ControlFrame::Ack { peer_id: "p7".into() }).unwrap();
        assert_eq!(json["kind"], "ack");
        assert_eq!(json["peer_id"], "p7");

        let parsed: ControlFrame =
            serde_json::from_str(r#"{"kind":"ack","peer_id":"p7"}"#).unwrap();
        assert_eq!(parsed, ControlFrame::Ack { peer_id: "p7".into() });
    }

    #[test]
    fn pending_table_phases() {
        let table = PendingRequestTable::new();
        assert!(!table.contains("a"));

        table.set("a", RequestPhase::Waiting);
        assert_eq!(table.phase("a"), Some(RequestPhase::Waiting));

        table.set("a", RequestPhase::Downloading);
        assert_eq!(table.phase("a"), Some(RequestPhase::Downloading));

        table.remove("a");
        table.remove("a"); // second removal is a no-op
        assert_eq!(table.phase("a"), None);
    }
}
