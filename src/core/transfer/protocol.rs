//! Per-peer transfer protocol state machine.
//!
//! One [`TransferProtocol`] exists per connected peer. It is a pure state
//! machine: every input — a local command, a relayed signaling event, or a
//! data-channel frame — returns the list of declarative [`ProtocolAction`]s
//! the caller must execute. The machine itself performs no network I/O; its
//! only suspension point is reading the next file slice from the chunk
//! source.
//!
//! Send path:
//! `request_send` → (peer accepts) → one chunk per acknowledgment →
//! final chunk unacknowledged → peer's `transfer-finished` closes the session.
//!
//! Receive path:
//! `receive-file-request` → `accept_request` / `cancel_request` → chunks
//! appended to the reassembly buffer, each non-final chunk acknowledged →
//! completion emits `transfer-finished` and releases the file image.

use crate::core::error::{Error, ProtocolError, TransferError};
use crate::core::signaling::ClientMessage;
use crate::core::transfer::reassembly::ReassemblyBuffer;
use crate::core::transfer::session::{Direction, SessionStatus, TransferSession};
use crate::core::transfer::source::ChunkSource;
use crate::core::transfer::{ChannelFrame, ControlFrame, PendingRequestTable, RequestPhase};
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, info, warn};

// ── Actions & notices ────────────────────────────────────────────────────────

/// Declarative side effects returned by the state machine. The per-peer
/// driver executes them in order; the machine stays free of network concerns.
#[derive(Debug)]
pub enum ProtocolAction {
    /// Send a message to the relay, addressed to this peer.
    Signal(ClientMessage),
    /// Send a frame on this peer's data channel.
    Frame(ChannelFrame),
    /// A received file is complete; hand the byte image to the caller.
    FileReady { file_name: String, data: Vec<u8> },
    /// Peer-scoped status update for the application layer.
    Notify(TransferNotice),
}

/// Peer-scoped transfer notifications for the application layer.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferNotice {
    /// The peer asks for consent to send us a file.
    IncomingRequest { file_name: String, file_size: u64 },
    /// Bytes moved in either direction.
    Progress {
        direction: Direction,
        file_name: String,
        bytes_transferred: u64,
        file_size: u64,
    },
    /// Our outbound file was fully received by the peer.
    SendComplete { file_name: String },
    /// The pending request was cancelled (either side).
    Cancelled,
    /// The session failed and was discarded.
    Failed { reason: String },
}

// ── Per-direction state ──────────────────────────────────────────────────────

struct SendState {
    session: TransferSession,
    source: ChunkSource,
}

struct RecvState {
    session: TransferSession,
    /// Allocated on accept, sized to the declared file size.
    buffer: Option<ReassemblyBuffer>,
}

fn unexpected(peer_id: &str, what: &'static str) -> Error {
    ProtocolError::UnexpectedMessage {
        peer_id: peer_id.to_string(),
        what,
    }
    .into()
}

/// Read and emit the chunk at the current offset. Stop-and-wait: exactly
/// one chunk per call, and no further call happens until the next
/// acknowledgment (or, for the final chunk, `transfer-finished`).
async fn emit_next_chunk(st: &mut SendState) -> Result<Vec<ProtocolAction>, Error> {
    let chunk = st.source.read_at(st.session.bytes_transferred).await?;
    st.session.record_bytes(chunk.len() as u64)?;

    Ok(vec![
        ProtocolAction::Frame(ChannelFrame::Binary(chunk)),
        ProtocolAction::Notify(TransferNotice::Progress {
            direction: Direction::Send,
            file_name: st.session.file_name.clone(),
            bytes_transferred: st.session.bytes_transferred,
            file_size: st.session.file_size,
        }),
    ])
}

// ── State machine ────────────────────────────────────────────────────────────

/// Transfer state machine for one remote peer.
pub struct TransferProtocol {
    /// The remote peer this instance talks to.
    peer_id: String,
    /// Shared handshake-phase table, keyed by peer id.
    pending: Arc<PendingRequestTable>,
    outbound: Option<SendState>,
    inbound: Option<RecvState>,
}

impl TransferProtocol {
    pub fn new(peer_id: impl Into<String>, pending: Arc<PendingRequestTable>) -> Self {
        Self {
            peer_id: peer_id.into(),
            pending,
            outbound: None,
            inbound: None,
        }
    }

    /// True when no session is active in either direction.
    pub fn is_idle(&self) -> bool {
        self.outbound.is_none() && self.inbound.is_none()
    }

    // ── Send path ────────────────────────────────────────────────────────

    /// Ask the peer for consent to send it the file backed by `source`.
    ///
    /// Only valid when no request is pending for this peer.
    pub fn request_send(
        &mut self,
        file_name: impl Into<String>,
        source: ChunkSource,
    ) -> Result<Vec<ProtocolAction>, Error> {
        if self.pending.contains(&self.peer_id) || self.outbound.is_some() {
            return Err(TransferError::AlreadyActive(self.peer_id.clone()).into());
        }

        let file_name = file_name.into();
        let file_size = source.len();
        let session = TransferSession::new(&self.peer_id, Direction::Send, &file_name, file_size);
        self.outbound = Some(SendState { session, source });
        self.pending.set(&self.peer_id, RequestPhase::Waiting);

        info!(
            event = "send_requested",
            peer_id = %self.peer_id,
            file_name = %file_name,
            file_size,
            "Requesting file send"
        );

        Ok(vec![ProtocolAction::Signal(ClientMessage::SendFileRequest {
            to: self.peer_id.clone(),
            file_name,
            file_size,
        })])
    }

    /// The peer consented to our `send-file-request`: start the chunked send.
    pub async fn handle_request_accepted(&mut self) -> Result<Vec<ProtocolAction>, Error> {
        let st = match self.outbound.as_mut() {
            Some(st) if st.session.status == SessionStatus::Requested => st,
            _ => return Err(unexpected(&self.peer_id, "request-accepted")),
        };
        st.session.advance(SessionStatus::Accepted)?;
        st.session.advance(SessionStatus::InProgress)?;
        self.pending.set(&self.peer_id, RequestPhase::Downloading);

        debug!(
            event = "send_accepted",
            peer_id = %self.peer_id,
            file_name = %st.session.file_name,
            "Peer accepted; sending first chunk"
        );
        emit_next_chunk(st).await
    }

    /// The peer acknowledged the most recent chunk: release the next one.
    ///
    /// The final chunk is never acknowledged, so an acknowledgment for an
    /// already fully-sent file has no session to consume it.
    pub async fn handle_ack(&mut self) -> Result<Vec<ProtocolAction>, Error> {
        let st = match self.outbound.as_mut() {
            Some(st)
                if st.session.status == SessionStatus::InProgress
                    && !st.session.is_complete() =>
            {
                st
            }
            _ => return Err(unexpected(&self.peer_id, "ack")),
        };
        emit_next_chunk(st).await
    }

    /// The peer reports the file fully reassembled: close the send session.
    pub fn handle_transfer_finished(&mut self) -> Result<Vec<ProtocolAction>, Error> {
        let mut st = match self.outbound.take() {
            Some(st)
                if st.session.status == SessionStatus::InProgress
                    && st.session.is_complete() =>
            {
                st
            }
            other => {
                self.outbound = other;
                return Err(unexpected(&self.peer_id, "transfer-finished"));
            }
        };
        st.session.advance(SessionStatus::Completed)?;
        self.pending.remove(&self.peer_id);

        info!(
            event = "send_complete",
            peer_id = %self.peer_id,
            file_name = %st.session.file_name,
            bytes = st.session.bytes_transferred,
            "File send complete"
        );

        Ok(vec![ProtocolAction::Notify(TransferNotice::SendComplete {
            file_name: st.session.file_name,
        })])
    }

    /// The peer cancelled our pending request. Removing an absent entry is
    /// not an error: the cancel may race our own teardown.
    pub fn handle_remote_cancelled(&mut self) -> Vec<ProtocolAction> {
        self.pending.remove(&self.peer_id);
        match self.outbound.take() {
            Some(mut st) => {
                // Only a not-yet-accepted request is cancellable.
                let _ = st.session.advance(SessionStatus::Cancelled);
                debug!(
                    event = "send_cancelled_by_peer",
                    peer_id = %self.peer_id,
                    file_name = %st.session.file_name,
                    "Peer cancelled pending request"
                );
                vec![ProtocolAction::Notify(TransferNotice::Cancelled)]
            }
            None => Vec::new(),
        }
    }

    // ── Receive path ─────────────────────────────────────────────────────

    /// The peer asks for consent to send us a file. Creates the receive
    /// session in `Requested` and surfaces it for the user's decision.
    pub fn handle_receive_request(
        &mut self,
        file_name: impl Into<String>,
        file_size: u64,
    ) -> Result<Vec<ProtocolAction>, Error> {
        if self.inbound.is_some() {
            return Err(unexpected(&self.peer_id, "receive-file-request"));
        }

        let file_name = file_name.into();
        let session =
            TransferSession::new(&self.peer_id, Direction::Receive, &file_name, file_size);
        self.inbound = Some(RecvState {
            session,
            buffer: None,
        });

        info!(
            event = "receive_requested",
            peer_id = %self.peer_id,
            file_name = %file_name,
            file_size,
            "Incoming file request"
        );

        Ok(vec![ProtocolAction::Notify(TransferNotice::IncomingRequest {
            file_name,
            file_size,
        })])
    }

    /// Consent to the pending receive request: allocate the reassembly
    /// buffer and tell the peer to start sending.
    pub fn accept_request(&mut self) -> Result<Vec<ProtocolAction>, Error> {
        let st = match self.inbound.as_mut() {
            Some(st) if st.session.status == SessionStatus::Requested => st,
            _ => return Err(unexpected(&self.peer_id, "accept")),
        };
        st.session.advance(SessionStatus::Accepted)?;
        st.buffer = Some(ReassemblyBuffer::new(st.session.file_size));
        self.pending.set(&self.peer_id, RequestPhase::Downloading);

        Ok(vec![ProtocolAction::Signal(ClientMessage::RequestAccepted {
            to: self.peer_id.clone(),
        })])
    }

    /// Decline the pending receive request. Valid only while still
    /// `Requested`; an in-progress transfer has no cancellation path.
    pub fn cancel_request(&mut self) -> Result<Vec<ProtocolAction>, Error> {
        let mut st = match self.inbound.take() {
            Some(st) if st.session.status == SessionStatus::Requested => st,
            other => {
                self.inbound = other;
                return Err(unexpected(&self.peer_id, "cancel"));
            }
        };
        st.session.advance(SessionStatus::Cancelled)?;
        self.pending.remove(&self.peer_id);

        Ok(vec![
            ProtocolAction::Signal(ClientMessage::RequestCancelled {
                to: self.peer_id.clone(),
            }),
            ProtocolAction::Notify(TransferNotice::Cancelled),
        ])
    }

    /// A binary chunk arrived on the data channel.
    ///
    /// Appends to the reassembly buffer; acknowledges every chunk except the
    /// final one. On completion, emits `transfer-finished`, releases the
    /// byte image, and destroys the session — later chunks for this peer are
    /// rejected as unexpected.
    pub fn handle_chunk(&mut self, chunk: Bytes) -> Result<Vec<ProtocolAction>, Error> {
        let st = match self.inbound.as_mut() {
            Some(st) => st,
            None => return Err(unexpected(&self.peer_id, "chunk")),
        };
        let Some(buffer) = st.buffer.as_mut() else {
            return Err(unexpected(&self.peer_id, "chunk"));
        };

        if st.session.status == SessionStatus::Accepted {
            st.session.advance(SessionStatus::InProgress)?;
        }

        let chunk_len = chunk.len() as u64;
        if let Err(e) = buffer.append(chunk) {
            // Over-delivery: the declared size was a lie. Fail and discard.
            warn!(
                event = "receive_over_length",
                peer_id = %self.peer_id,
                file_name = %st.session.file_name,
                declared = st.session.file_size,
                "Peer delivered more bytes than declared"
            );
            if let Some(mut failed) = self.inbound.take() {
                let _ = failed.session.advance(SessionStatus::Failed);
            }
            self.pending.remove(&self.peer_id);
            return Err(e.into());
        }
        st.session.record_bytes(chunk_len)?;

        if !st.session.is_complete() {
            let ack = serde_json::to_string(&ControlFrame::Ack {
                peer_id: self.peer_id.clone(),
            })
            .expect("ack frame serializes");
            return Ok(vec![
                ProtocolAction::Frame(ChannelFrame::Text(ack)),
                ProtocolAction::Notify(TransferNotice::Progress {
                    direction: Direction::Receive,
                    file_name: st.session.file_name.clone(),
                    bytes_transferred: st.session.bytes_transferred,
                    file_size: st.session.file_size,
                }),
            ]);
        }

        // All declared bytes arrived: finalize and destroy the session.
        let Some(mut st) = self.inbound.take() else {
            return Err(unexpected(&self.peer_id, "chunk"));
        };
        st.session.advance(SessionStatus::Completed)?;
        self.pending.remove(&self.peer_id);
        let Some(buffer) = st.buffer.take() else {
            return Err(unexpected(&self.peer_id, "chunk"));
        };
        let data = buffer.finalize()?;

        info!(
            event = "receive_complete",
            peer_id = %self.peer_id,
            file_name = %st.session.file_name,
            bytes = st.session.file_size,
            "File fully reassembled"
        );

        Ok(vec![
            ProtocolAction::Signal(ClientMessage::TransferFinished {
                to: self.peer_id.clone(),
            }),
            ProtocolAction::FileReady {
                file_name: st.session.file_name.clone(),
                data,
            },
            ProtocolAction::Notify(TransferNotice::Progress {
                direction: Direction::Receive,
                file_name: st.session.file_name,
                bytes_transferred: st.session.file_size,
                file_size: st.session.file_size,
            }),
        ])
    }

    /// A text frame arrived on the data channel.
    pub async fn handle_text(&mut self, text: &str) -> Result<Vec<ProtocolAction>, Error> {
        let frame: ControlFrame =
            serde_json::from_str(text).map_err(|_| unexpected(&self.peer_id, "control frame"))?;
        match frame {
            ControlFrame::Ack { .. } => self.handle_ack().await,
        }
    }

    /// The data channel closed. Any in-flight session fails; buffers are
    /// discarded and the pending entry is removed. No retry.
    pub fn handle_disconnect(&mut self) -> Vec<ProtocolAction> {
        let mut actions = Vec::new();
        let reason = TransferError::PeerDisconnected(self.peer_id.clone()).to_string();

        for session in [
            self.outbound.take().map(|st| st.session),
            self.inbound.take().map(|st| st.session),
        ]
        .into_iter()
        .flatten()
        {
            if session.status.is_terminal() {
                continue;
            }
            warn!(
                event = "transfer_failed",
                peer_id = %self.peer_id,
                file_name = %session.file_name,
                direction = ?session.direction,
                "Peer disconnected mid-transfer"
            );
            actions.push(ProtocolAction::Notify(TransferNotice::Failed {
                reason: reason.clone(),
            }));
        }

        self.pending.remove(&self.peer_id);
        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::MAX_CHUNK_SIZE;

    fn pair() -> (TransferProtocol, TransferProtocol) {
        // A: sender side, talking to peer "b". B: receiver side, talking to "a".
        let a = TransferProtocol::new("b", Arc::new(PendingRequestTable::new()));
        let b = TransferProtocol::new("a", Arc::new(PendingRequestTable::new()));
        (a, b)
    }

    fn chunks_of(actions: &[ProtocolAction]) -> Vec<Bytes> {
        actions
            .iter()
            .filter_map(|a| match a {
                ProtocolAction::Frame(ChannelFrame::Binary(c)) => Some(c.clone()),
                _ => None,
            })
            .collect()
    }

    fn acks_of(actions: &[ProtocolAction]) -> usize {
        actions
            .iter()
            .filter(|a| matches!(a, ProtocolAction::Frame(ChannelFrame::Text(_))))
            .count()
    }

    #[tokio::test]
    async fn one_mebibyte_transfers_in_six_chunks() {
        let (mut sender, mut receiver) = pair();
        let data: Vec<u8> = (0..1_048_576u32).map(|i| (i % 241) as u8).collect();

        let actions = sender
            .request_send("report.pdf", ChunkSource::from_bytes(data.clone()))
            .unwrap();
        assert!(matches!(
            actions[0],
            ProtocolAction::Signal(ClientMessage::SendFileRequest {
                file_size: 1_048_576,
                ..
            })
        ));
        assert_eq!(sender.pending.phase("b"), Some(RequestPhase::Waiting));

        let actions = receiver
            .handle_receive_request("report.pdf", 1_048_576)
            .unwrap();
        assert!(matches!(
            actions[0],
            ProtocolAction::Notify(TransferNotice::IncomingRequest { .. })
        ));
        let actions = receiver.accept_request().unwrap();
        assert!(matches!(
            actions[0],
            ProtocolAction::Signal(ClientMessage::RequestAccepted { .. })
        ));
        assert_eq!(receiver.pending.phase("a"), Some(RequestPhase::Downloading));

        // Drive the stop-and-wait loop to completion.
        let mut sender_actions = sender.handle_request_accepted().await.unwrap();
        assert_eq!(sender.pending.phase("b"), Some(RequestPhase::Downloading));

        let mut sizes = Vec::new();
        let mut ack_count = 0usize;
        let mut received = Vec::new();
        loop {
            let chunks = chunks_of(&sender_actions);
            // Stop-and-wait: exactly one unacknowledged chunk in flight.
            assert_eq!(chunks.len(), 1);
            let chunk = chunks.into_iter().next().unwrap();
            assert!(chunk.len() <= MAX_CHUNK_SIZE);
            sizes.push(chunk.len());

            let recv_actions = receiver.handle_chunk(chunk).unwrap();
            if let Some(ProtocolAction::FileReady { data, .. }) = recv_actions
                .iter()
                .find(|a| matches!(a, ProtocolAction::FileReady { .. }))
            {
                received = data.clone();
                assert!(recv_actions.iter().any(|a| matches!(
                    a,
                    ProtocolAction::Signal(ClientMessage::TransferFinished { .. })
                )));
                break;
            }

            assert_eq!(acks_of(&recv_actions), 1);
            ack_count += 1;
            sender_actions = sender.handle_ack().await.unwrap();
        }

        assert_eq!(
            sizes,
            vec![204_800, 204_800, 204_800, 204_800, 204_800, 34_816]
        );
        assert_eq!(ack_count, 5);
        assert_eq!(received, data);

        // transfer-finished closes the sender session and clears its state.
        let actions = sender.handle_transfer_finished().unwrap();
        assert!(matches!(
            actions[0],
            ProtocolAction::Notify(TransferNotice::SendComplete { .. })
        ));
        assert!(sender.is_idle());
        assert!(!sender.pending.contains("b"));
        assert!(receiver.is_idle());
        assert!(!receiver.pending.contains("a"));

        // Anything further for this peer is unexpected.
        assert!(matches!(
            receiver.handle_chunk(Bytes::from_static(b"late")),
            Err(Error::Protocol(ProtocolError::UnexpectedMessage { .. }))
        ));
        assert!(matches!(
            sender.handle_ack().await,
            Err(Error::Protocol(ProtocolError::UnexpectedMessage { .. }))
        ));
    }

    #[tokio::test]
    async fn cancel_before_accept_sends_no_chunk() {
        let (mut sender, mut receiver) = pair();

        let actions = sender
            .request_send("a.bin", ChunkSource::from_bytes(vec![0u8; 1024]))
            .unwrap();
        assert_eq!(chunks_of(&actions).len(), 0);

        receiver.handle_receive_request("a.bin", 1024).unwrap();
        let actions = receiver.cancel_request().unwrap();
        let cancels = actions
            .iter()
            .filter(|a| {
                matches!(
                    a,
                    ProtocolAction::Signal(ClientMessage::RequestCancelled { .. })
                )
            })
            .count();
        assert_eq!(cancels, 1);
        assert!(receiver.is_idle());

        let actions = sender.handle_remote_cancelled();
        assert!(matches!(
            actions[0],
            ProtocolAction::Notify(TransferNotice::Cancelled)
        ));
        assert!(!sender.pending.contains("b"));
        assert!(sender.is_idle());

        // Consent arriving after cancellation is unexpected; no chunk moves.
        assert!(sender.handle_request_accepted().await.is_err());
    }

    #[test]
    fn over_delivery_fails_the_session() {
        let (_, mut receiver) = pair();
        receiver.handle_receive_request("small.bin", 6).unwrap();
        receiver.accept_request().unwrap();

        let err = receiver
            .handle_chunk(Bytes::from_static(b"way too much data"))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::OverLength { declared: 6, .. })
        ));
        assert!(receiver.is_idle());
        assert!(!receiver.pending.contains("a"));
    }

    #[test]
    fn chunk_without_consent_is_unexpected() {
        let (_, mut receiver) = pair();
        receiver.handle_receive_request("a.bin", 10).unwrap();
        // Not yet accepted: no buffer exists.
        assert!(matches!(
            receiver.handle_chunk(Bytes::from_static(b"early")),
            Err(Error::Protocol(ProtocolError::UnexpectedMessage { .. }))
        ));
    }

    #[test]
    fn second_request_for_same_peer_is_rejected() {
        let (mut sender, _) = pair();
        sender
            .request_send("a.bin", ChunkSource::from_bytes(vec![1u8; 10]))
            .unwrap();
        let err = sender
            .request_send("b.bin", ChunkSource::from_bytes(vec![2u8; 10]))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Transfer(TransferError::AlreadyActive(_))
        ));
    }

    #[tokio::test]
    async fn malformed_control_frame_is_rejected() {
        let (mut sender, _) = pair();
        assert!(matches!(
            sender.handle_text("not json").await,
            Err(Error::Protocol(ProtocolError::UnexpectedMessage { .. }))
        ));
    }

    #[tokio::test]
    async fn disconnect_mid_transfer_fails_and_discards() {
        let (mut sender, mut receiver) = pair();
        let data = vec![7u8; MAX_CHUNK_SIZE * 2];

        sender
            .request_send("big.bin", ChunkSource::from_bytes(data))
            .unwrap();
        receiver
            .handle_receive_request("big.bin", (MAX_CHUNK_SIZE * 2) as u64)
            .unwrap();
        receiver.accept_request().unwrap();
        let actions = sender.handle_request_accepted().await.unwrap();
        receiver
            .handle_chunk(chunks_of(&actions)[0].clone())
            .unwrap();

        let actions = receiver.handle_disconnect();
        assert!(matches!(
            actions[0],
            ProtocolAction::Notify(TransferNotice::Failed { .. })
        ));
        assert!(receiver.is_idle());
        assert!(!receiver.pending.contains("a"));

        let actions = sender.handle_disconnect();
        assert_eq!(actions.len(), 1);
        assert!(sender.is_idle());
        assert!(!sender.pending.contains("b"));
    }

    #[tokio::test]
    async fn zero_byte_file_completes_with_one_empty_chunk() {
        let (mut sender, mut receiver) = pair();
        sender
            .request_send("empty", ChunkSource::from_bytes(Vec::new()))
            .unwrap();
        receiver.handle_receive_request("empty", 0).unwrap();
        receiver.accept_request().unwrap();

        let actions = sender.handle_request_accepted().await.unwrap();
        let chunk = chunks_of(&actions).into_iter().next().unwrap();
        assert!(chunk.is_empty());

        let actions = receiver.handle_chunk(chunk).unwrap();
        assert!(actions
            .iter()
            .any(|a| matches!(a, ProtocolAction::FileReady { data, .. } if data.is_empty())));

        sender.handle_transfer_finished().unwrap();
        assert!(sender.is_idle());
    }
}
