//! WebRTC transport layer: per-peer connections and the manager that owns
//! them.
//!
//! The manager keys connections by relay-assigned peer id and enforces one
//! connection per peer: starting a new negotiation for a peer that already
//! has one closes and replaces the old transport.

pub mod peer;

pub use peer::PeerConnection;

use crate::core::error::ConnectionError;
use crate::core::transfer::ChannelFrame;
use bytes::Bytes;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::info;

/// Transport events, delivered as `(peer_id, event)` on one shared stream.
#[derive(Debug)]
pub enum PeerEvent {
    /// The data channel reached the open state.
    ChannelOpen,
    /// A binary frame (file chunk) arrived.
    Binary(Bytes),
    /// A text frame (control message) arrived.
    Text(String),
    /// A local ICE candidate was gathered; forward it over signaling.
    LocalCandidate(String),
    /// The channel or connection ended. Terminal for this peer's transport.
    Closed,
}

/// Owns every live [`PeerConnection`], keyed by peer id.
pub struct ConnectionManager {
    peers: HashMap<String, PeerConnection>,
    events: mpsc::UnboundedSender<(String, PeerEvent)>,
}

impl ConnectionManager {
    /// Create the manager and the stream its connections publish events on.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(String, PeerEvent)>) {
        let (events, event_rx) = mpsc::unbounded_channel();
        (
            Self {
                peers: HashMap::new(),
                events,
            },
            event_rx,
        )
    }

    /// Offerer path: open a transport towards `peer_id` and return the
    /// serialized SDP offer to relay.
    pub async fn initiate(&mut self, peer_id: &str) -> Result<String, ConnectionError> {
        self.replace_slot(peer_id).await;
        let mut conn = PeerConnection::new(peer_id, self.events.clone()).await?;
        let offer = conn.create_offer().await?;
        self.peers.insert(peer_id.to_string(), conn);
        Ok(offer)
    }

    /// Answerer path: accept `peer_id`'s offer and return the serialized
    /// SDP answer to relay.
    pub async fn accept_offer(
        &mut self,
        peer_id: &str,
        offer_json: &str,
    ) -> Result<String, ConnectionError> {
        self.replace_slot(peer_id).await;
        let mut conn = PeerConnection::new(peer_id, self.events.clone()).await?;
        let answer = conn.accept_offer(offer_json).await?;
        self.peers.insert(peer_id.to_string(), conn);
        Ok(answer)
    }

    /// Apply the peer's answer to the connection we initiated.
    pub async fn apply_answer(
        &mut self,
        peer_id: &str,
        answer_json: &str,
    ) -> Result<(), ConnectionError> {
        self.get_mut(peer_id)?.apply_answer(answer_json).await
    }

    /// Apply (or queue) a remote ICE candidate.
    pub async fn apply_candidate(
        &mut self,
        peer_id: &str,
        candidate_json: &str,
    ) -> Result<(), ConnectionError> {
        self.get_mut(peer_id)?.apply_candidate(candidate_json).await
    }

    /// Send one frame on `peer_id`'s data channel.
    pub async fn send_frame(
        &self,
        peer_id: &str,
        frame: ChannelFrame,
    ) -> Result<(), ConnectionError> {
        self.peers
            .get(peer_id)
            .ok_or_else(|| ConnectionError::UnknownPeer(peer_id.to_string()))?
            .send_frame(frame)
            .await
    }

    /// Close and drop `peer_id`'s transport, if any.
    pub async fn remove(&mut self, peer_id: &str) {
        if let Some(conn) = self.peers.remove(peer_id) {
            info!(
                event = "connection_removed",
                peer_id = %peer_id,
                "closing peer transport"
            );
            conn.close().await;
        }
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.peers.contains_key(peer_id)
    }

    /// Close every transport. Used on room exit.
    pub async fn close_all(&mut self) {
        for (_, conn) in self.peers.drain() {
            conn.close().await;
        }
    }

    fn get_mut(&mut self, peer_id: &str) -> Result<&mut PeerConnection, ConnectionError> {
        self.peers
            .get_mut(peer_id)
            .ok_or_else(|| ConnectionError::UnknownPeer(peer_id.to_string()))
    }

    async fn replace_slot(&mut self, peer_id: &str) {
        if let Some(old) = self.peers.remove(peer_id) {
            info!(
                event = "connection_replaced",
                peer_id = %peer_id,
                "renegotiating: closing previous transport"
            );
            old.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn renegotiation_keeps_one_connection_per_peer() {
        let (mut mgr, _events) = ConnectionManager::new();
        let first = mgr.initiate("p1").await.unwrap();
        let second = mgr.initiate("p1").await.unwrap();
        assert!(!first.is_empty());
        assert!(!second.is_empty());
        assert_eq!(mgr.peers.len(), 1);
        assert!(mgr.contains("p1"));
    }

    #[tokio::test]
    async fn inbound_offer_replaces_a_pending_outbound_one() {
        // Both sides may start negotiating at once; accepting the remote
        // offer closes our own half-open attempt instead of leaking it.
        let (mut remote, _remote_events) = ConnectionManager::new();
        let offer = remote.initiate("us").await.unwrap();

        let (mut mgr, _events) = ConnectionManager::new();
        mgr.initiate("p1").await.unwrap();
        let answer = mgr.accept_offer("p1", &offer).await.unwrap();
        assert!(!answer.is_empty());
        assert_eq!(mgr.peers.len(), 1);
    }

    #[tokio::test]
    async fn negotiation_data_without_a_connection_is_unknown_peer() {
        let (mut mgr, _events) = ConnectionManager::new();
        let err = mgr.apply_candidate("nobody", "{}").await.unwrap_err();
        assert!(matches!(err, ConnectionError::UnknownPeer(id) if id == "nobody"));
    }
}
