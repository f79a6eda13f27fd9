//! Signaling client: JSON messages over a WebSocket connection to the relay.
//!
//! The relay forwards peer-addressed messages within a room; it never
//! inspects payloads. Outbound messages carry a `to` field naming the target
//! peer, inbound ones carry `peer_id` naming the origin. Serialized variant
//! tags are the wire event names (`join-room`, `new-user`, `offer-send`, ...).

use crate::core::error::SignalingError;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

// ── Wire messages ────────────────────────────────────────────────────────────

/// Messages sent from this client to the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Enter a room under a display name. The relay replies by broadcasting
    /// `new-user` to the room's existing members.
    JoinRoom { room: String, display_name: String },
    /// Reply from an existing member to a newly joined peer, announcing our
    /// own display name. The joiner offers a connection on receipt.
    UserConnectionReply { to: String, display_name: String },
    /// Serialized SDP offer for the target peer.
    OfferSend { to: String, sdp: String },
    /// Serialized SDP answer for the target peer.
    AnswerSend { to: String, sdp: String },
    /// Serialized ICE candidate for the target peer.
    IceCandidate { to: String, candidate: String },
    /// Ask the target peer for consent to send it a file.
    SendFileRequest {
        to: String,
        file_name: String,
        file_size: u64,
    },
    /// Consent to the peer's pending file request.
    RequestAccepted { to: String },
    /// Decline / withdraw the pending file request.
    RequestCancelled { to: String },
    /// All declared bytes were received and reassembled.
    TransferFinished { to: String },
}

/// Messages delivered from the relay to this client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// A peer joined the room.
    NewUser { peer_id: String, display_name: String },
    /// An existing member's reply to our own join.
    UserConnectionReply { peer_id: String, display_name: String },
    /// A peer left the room.
    UserDisconnected { peer_id: String },
    /// SDP offer from a peer.
    OfferReceive { peer_id: String, sdp: String },
    /// SDP answer from a peer.
    AnswerReceive { peer_id: String, sdp: String },
    /// ICE candidate from a peer.
    IceCandidate { peer_id: String, candidate: String },
    /// A peer asks for consent to send us a file.
    ReceiveFileRequest {
        peer_id: String,
        file_name: String,
        file_size: u64,
    },
    /// The peer consented to our file request.
    RequestAccepted { peer_id: String },
    /// The peer declined / withdrew the request.
    RequestCancelled { peer_id: String },
    /// The peer finished reassembling our file.
    TransferFinished { peer_id: String },
}

// ── Events ───────────────────────────────────────────────────────────────────

/// Inbound events surfaced by the client's reader task.
#[derive(Debug)]
pub enum SignalingEvent {
    /// A parsed relay message.
    Message(ServerMessage),
    /// A frame arrived that does not parse as a [`ServerMessage`].
    /// Surfaced rather than dropped; non-fatal to the connection.
    Malformed(SignalingError),
    /// The relay connection closed.
    Closed,
}

// ── Client ───────────────────────────────────────────────────────────────────

/// Handle to the relay connection. Cloneable; all clones share the writer.
#[derive(Clone)]
pub struct SignalingClient {
    send_tx: mpsc::UnboundedSender<ClientMessage>,
}

impl SignalingClient {
    /// Connect to the relay, join `room` as `display_name`, and return the
    /// client handle plus the inbound event stream.
    ///
    /// Spawns a writer task (serializing [`ClientMessage`]s onto the socket)
    /// and a reader task (parsing frames into [`SignalingEvent`]s).
    pub async fn connect(
        relay_url: &str,
        room: &str,
        display_name: &str,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SignalingEvent>), SignalingError> {
        let (ws, _) = connect_async(relay_url)
            .await
            .map_err(|e| SignalingError::Connect(e.to_string()))?;
        debug!(event = "relay_connected", url = %relay_url, "signaling websocket connected");

        let (mut ws_write, mut ws_read) = ws.split();
        let (send_tx, mut send_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let (event_tx, event_rx) = mpsc::unbounded_channel::<SignalingEvent>();

        tokio::spawn(async move {
            while let Some(msg) = send_rx.recv().await {
                let text = match serde_json::to_string(&msg) {
                    Ok(t) => t,
                    Err(e) => {
                        warn!(event = "relay_encode_failure", error = %e, "dropping unencodable message");
                        continue;
                    }
                };
                if ws_write.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
        });

        let reader_events = event_tx.clone();
        tokio::spawn(async move {
            while let Some(frame) = ws_read.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        let event = match serde_json::from_str::<ServerMessage>(&text) {
                            Ok(msg) => SignalingEvent::Message(msg),
                            Err(e) => SignalingEvent::Malformed(SignalingError::Malformed(
                                e.to_string(),
                            )),
                        };
                        if reader_events.send(event).is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!(event = "relay_read_failure", error = %e, "signaling websocket error");
                        break;
                    }
                }
            }
            let _ = reader_events.send(SignalingEvent::Closed);
        });

        let client = Self { send_tx };
        client.send(ClientMessage::JoinRoom {
            room: room.to_string(),
            display_name: display_name.to_string(),
        })?;

        Ok((client, event_rx))
    }

    /// Queue a message for the relay. Fire-and-forget beyond the local
    /// queue: relay delivery failures surface as connection loss, not as
    /// per-message errors.
    pub fn send(&self, msg: ClientMessage) -> Result<(), SignalingError> {
        self.send_tx
            .send(msg)
            .map_err(|_| SignalingError::ChannelClosed)
    }

    /// Client wired to an in-process queue instead of a relay socket, so
    /// engine tests can observe outbound traffic without a server.
    #[cfg(test)]
    pub(crate) fn detached() -> (Self, mpsc::UnboundedReceiver<ClientMessage>) {
        let (send_tx, rx) = mpsc::unbounded_channel();
        (Self { send_tx }, rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_tags_match_wire_event_names() {
        let join = serde_json::to_value(ClientMessage::JoinRoom {
            room: "alpha".into(),
            display_name: "ana".into(),
        })
        .unwrap();
        assert_eq!(join["type"], "join-room");
        assert_eq!(join["room"], "alpha");

        let req = serde_json::to_value(ClientMessage::SendFileRequest {
            to: "p1".into(),
            file_name: "report.pdf".into(),
            file_size: 1_048_576,
        })
        .unwrap();
        assert_eq!(req["type"], "send-file-request");
        assert_eq!(req["file_size"], 1_048_576u64);

        let fin = serde_json::to_value(ClientMessage::TransferFinished { to: "p1".into() }).unwrap();
        assert_eq!(fin["type"], "transfer-finished");
    }

    #[test]
    fn server_messages_parse_from_wire_tags() {
        let msg: ServerMessage = serde_json::from_str(
            r#"{"type":"receive-file-request","peer_id":"p2","file_name":"a.bin","file_size":42}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            ServerMessage::ReceiveFileRequest {
                peer_id: "p2".into(),
                file_name: "a.bin".into(),
                file_size: 42
            }
        );

        let msg: ServerMessage =
            serde_json::from_str(r#"{"type":"user-disconnected","peer_id":"p2"}"#).unwrap();
        assert_eq!(msg, ServerMessage::UserDisconnected { peer_id: "p2".into() });
    }

    #[test]
    fn unknown_tag_is_rejected() {
        assert!(serde_json::from_str::<ServerMessage>(r#"{"type":"mystery"}"#).is_err());
    }
}
