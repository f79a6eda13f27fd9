//! The engine: one event loop that owns every moving part.
//!
//! All state — room registry, live connections, per-peer protocol machines —
//! is owned by the loop and mutated from exactly one task, so no state is
//! shared behind locks except the [`PendingRequestTable`]. Inputs are three
//! streams: relay messages, transport events, and user commands. Outputs are
//! [`AppEvent`]s for the front end.
//!
//! Join flow: the joiner receives a `user-connection-reply` from each
//! existing member and initiates the WebRTC offer towards it; existing
//! members answer. Both sides learn names from the announcement messages.

use crate::core::connection::{ConnectionManager, PeerEvent};
use crate::core::error::{ConnectionError, Error, ProtocolError, TransferError};
use crate::core::peer_registry::{PeerRecord, PeerRegistry};
use crate::core::signaling::{ClientMessage, ServerMessage, SignalingClient, SignalingEvent};
use crate::core::transfer::protocol::{ProtocolAction, TransferNotice, TransferProtocol};
use crate::core::transfer::session::Direction;
use crate::core::transfer::source::ChunkSource;
use crate::core::transfer::PendingRequestTable;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

// ── Commands & app events ────────────────────────────────────────────────────

/// User-initiated commands, fed to the engine by the front end.
#[derive(Debug)]
pub enum Command {
    /// Offer the file at `path` to `peer_id`.
    SendFile { peer_id: String, path: PathBuf },
    /// Consent to `peer_id`'s pending file request.
    AcceptRequest { peer_id: String },
    /// Decline `peer_id`'s pending file request.
    CancelRequest { peer_id: String },
    /// Ask for the current room roster.
    ListPeers,
    /// Leave the room and stop the engine.
    Quit,
}

/// Events the engine publishes for the front end.
#[derive(Debug)]
pub enum AppEvent {
    PeerJoined {
        peer_id: String,
        display_name: String,
    },
    PeerLeft {
        peer_id: String,
        display_name: String,
    },
    /// The data channel to this peer is open; transfers can start.
    PeerReady { peer_id: String },
    IncomingRequest {
        peer_id: String,
        file_name: String,
        file_size: u64,
    },
    Progress {
        peer_id: String,
        direction: Direction,
        file_name: String,
        bytes_transferred: u64,
        file_size: u64,
    },
    /// Our outbound file was fully received by the peer.
    SendComplete { peer_id: String, file_name: String },
    /// A received file was written to disk.
    FileSaved {
        peer_id: String,
        file_name: String,
        path: PathBuf,
    },
    TransferCancelled { peer_id: String },
    TransferFailed { peer_id: String, reason: String },
    Roster(Vec<PeerRecord>),
    /// The relay connection closed; the engine is stopping.
    RelayClosed,
}

/// Cloneable handle for feeding [`Command`]s to a running engine.
#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl EngineHandle {
    /// Queue a command. Returns false once the engine has stopped.
    pub fn send(&self, cmd: Command) -> bool {
        self.commands.send(cmd).is_ok()
    }
}

// ── Engine ───────────────────────────────────────────────────────────────────

pub struct Engine {
    signaling: SignalingClient,
    signaling_rx: mpsc::UnboundedReceiver<SignalingEvent>,
    connections: ConnectionManager,
    peer_events: mpsc::UnboundedReceiver<(String, PeerEvent)>,
    registry: PeerRegistry,
    pending: Arc<PendingRequestTable>,
    protocols: HashMap<String, TransferProtocol>,
    commands: mpsc::UnboundedReceiver<Command>,
    app_tx: mpsc::UnboundedSender<AppEvent>,
    display_name: String,
    download_dir: PathBuf,
}

impl Engine {
    /// Connect to the relay, join the room, and assemble the engine.
    ///
    /// Returns the engine (drive it with [`run`]), a command handle, and the
    /// app event stream.
    ///
    /// [`run`]: Self::run
    pub async fn connect(
        relay_url: &str,
        room: &str,
        display_name: &str,
        download_dir: PathBuf,
    ) -> Result<(Self, EngineHandle, mpsc::UnboundedReceiver<AppEvent>), Error> {
        let (signaling, signaling_rx) =
            SignalingClient::connect(relay_url, room, display_name).await?;
        let (connections, peer_events) = ConnectionManager::new();
        let (command_tx, commands) = mpsc::unbounded_channel();
        let (app_tx, app_rx) = mpsc::unbounded_channel();

        info!(
            event = "room_joined",
            room = %room,
            display_name = %display_name,
            "joined room"
        );

        Ok((
            Self {
                signaling,
                signaling_rx,
                connections,
                peer_events,
                registry: PeerRegistry::new(),
                pending: Arc::new(PendingRequestTable::new()),
                protocols: HashMap::new(),
                commands,
                app_tx,
                display_name: display_name.to_string(),
                download_dir,
            },
            EngineHandle {
                commands: command_tx,
            },
            app_rx,
        ))
    }

    /// Drive the event loop until the relay closes or a `Quit` arrives.
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                Some(ev) = self.signaling_rx.recv() => match ev {
                    SignalingEvent::Message(msg) => self.dispatch_signal(msg).await,
                    SignalingEvent::Malformed(e) => {
                        warn!(event = "relay_malformed", error = %e, "ignoring malformed relay frame");
                    }
                    SignalingEvent::Closed => {
                        self.emit(AppEvent::RelayClosed);
                        break;
                    }
                },
                Some((peer_id, ev)) = self.peer_events.recv() => {
                    self.dispatch_peer_event(peer_id, ev).await;
                }
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Quit) | None => break,
                    Some(cmd) => self.dispatch_command(cmd).await,
                },
            }
        }
        self.connections.close_all().await;
        info!(event = "engine_stopped", "engine stopped");
    }

    // ── Dispatch with per-peer error scoping ─────────────────────────────

    async fn dispatch_signal(&mut self, msg: ServerMessage) {
        let peer_id = match &msg {
            ServerMessage::NewUser { peer_id, .. }
            | ServerMessage::UserConnectionReply { peer_id, .. }
            | ServerMessage::UserDisconnected { peer_id }
            | ServerMessage::OfferReceive { peer_id, .. }
            | ServerMessage::AnswerReceive { peer_id, .. }
            | ServerMessage::IceCandidate { peer_id, .. }
            | ServerMessage::ReceiveFileRequest { peer_id, .. }
            | ServerMessage::RequestAccepted { peer_id }
            | ServerMessage::RequestCancelled { peer_id }
            | ServerMessage::TransferFinished { peer_id } => peer_id.clone(),
        };
        if let Err(e) = self.handle_signal(msg).await {
            self.report(&peer_id, e);
        }
    }

    async fn dispatch_peer_event(&mut self, peer_id: String, ev: PeerEvent) {
        if let Err(e) = self.handle_peer_event(&peer_id, ev).await {
            self.report(&peer_id, e);
        }
    }

    async fn dispatch_command(&mut self, cmd: Command) {
        let peer_id = match &cmd {
            Command::SendFile { peer_id, .. }
            | Command::AcceptRequest { peer_id }
            | Command::CancelRequest { peer_id } => peer_id.clone(),
            Command::ListPeers => {
                self.emit(AppEvent::Roster(self.registry.all().cloned().collect()));
                return;
            }
            Command::Quit => return,
        };
        if let Err(e) = self.handle_command(cmd).await {
            self.report(&peer_id, e);
        }
    }

    /// Peer-scoped error reporting: nothing here stops the loop or touches
    /// another peer's sessions.
    fn report(&mut self, peer_id: &str, err: Error) {
        match &err {
            // Stray protocol messages (duplicate accepts, late chunks) are a
            // peer misbehaving, not a transfer we need to tear down.
            Error::Protocol(ProtocolError::UnexpectedMessage { .. }) => {
                warn!(event = "peer_misbehaved", peer_id = %peer_id, error = %err, "ignoring message");
            }
            // Negotiation data can race connection teardown: an answer or
            // candidate for a peer we hold no connection for targets nothing,
            // so it is dropped rather than surfaced as a transfer failure.
            Error::Connection(ConnectionError::UnknownPeer(_)) => {
                warn!(event = "stray_peer_message", peer_id = %peer_id, error = %err, "ignoring message");
            }
            _ => {
                warn!(event = "peer_error", peer_id = %peer_id, error = %err, "peer operation failed");
                self.emit(AppEvent::TransferFailed {
                    peer_id: peer_id.to_string(),
                    reason: err.to_string(),
                });
            }
        }
    }

    // ── Relay messages ───────────────────────────────────────────────────

    async fn handle_signal(&mut self, msg: ServerMessage) -> Result<(), Error> {
        match msg {
            ServerMessage::NewUser {
                peer_id,
                display_name,
            } => {
                // Existing-member side: announce ourselves back. The joiner
                // initiates the offer on receipt of our reply.
                self.registry.add(&peer_id, &display_name);
                self.signaling.send(ClientMessage::UserConnectionReply {
                    to: peer_id.clone(),
                    display_name: self.display_name.clone(),
                })?;
                self.emit(AppEvent::PeerJoined {
                    peer_id,
                    display_name,
                });
            }
            ServerMessage::UserConnectionReply {
                peer_id,
                display_name,
            } => {
                // Joiner side: each reply names an existing member; offer it
                // a connection.
                self.registry.add(&peer_id, &display_name);
                let offer = self.connections.initiate(&peer_id).await?;
                self.signaling.send(ClientMessage::OfferSend {
                    to: peer_id.clone(),
                    sdp: offer,
                })?;
                self.emit(AppEvent::PeerJoined {
                    peer_id,
                    display_name,
                });
            }
            ServerMessage::OfferReceive { peer_id, sdp } => {
                let answer = self.connections.accept_offer(&peer_id, &sdp).await?;
                self.signaling.send(ClientMessage::AnswerSend {
                    to: peer_id,
                    sdp: answer,
                })?;
            }
            ServerMessage::AnswerReceive { peer_id, sdp } => {
                self.connections.apply_answer(&peer_id, &sdp).await?;
            }
            ServerMessage::IceCandidate { peer_id, candidate } => {
                self.connections.apply_candidate(&peer_id, &candidate).await?;
            }
            ServerMessage::ReceiveFileRequest {
                peer_id,
                file_name,
                file_size,
            } => {
                let actions = self
                    .protocol(&peer_id)?
                    .handle_receive_request(file_name, file_size)?;
                self.run_actions(&peer_id, actions).await;
            }
            ServerMessage::RequestAccepted { peer_id } => {
                let actions = self.protocol(&peer_id)?.handle_request_accepted().await?;
                self.run_actions(&peer_id, actions).await;
            }
            ServerMessage::RequestCancelled { peer_id } => {
                let actions = self.protocol(&peer_id)?.handle_remote_cancelled();
                self.run_actions(&peer_id, actions).await;
            }
            ServerMessage::TransferFinished { peer_id } => {
                let actions = self.protocol(&peer_id)?.handle_transfer_finished()?;
                self.run_actions(&peer_id, actions).await;
            }
            ServerMessage::UserDisconnected { peer_id } => {
                self.drop_peer(&peer_id).await;
            }
        }
        Ok(())
    }

    // ── Transport events ─────────────────────────────────────────────────

    async fn handle_peer_event(&mut self, peer_id: &str, ev: PeerEvent) -> Result<(), Error> {
        match ev {
            PeerEvent::ChannelOpen => {
                self.emit(AppEvent::PeerReady {
                    peer_id: peer_id.to_string(),
                });
            }
            PeerEvent::Binary(bytes) => {
                let actions = self.protocol(peer_id)?.handle_chunk(bytes)?;
                self.run_actions(peer_id, actions).await;
            }
            PeerEvent::Text(text) => {
                let actions = self.protocol(peer_id)?.handle_text(&text).await?;
                self.run_actions(peer_id, actions).await;
            }
            PeerEvent::LocalCandidate(candidate) => {
                self.signaling.send(ClientMessage::IceCandidate {
                    to: peer_id.to_string(),
                    candidate,
                })?;
            }
            PeerEvent::Closed => {
                // Transport death fails in-flight transfers but keeps the
                // peer in the room registry; the relay decides membership.
                let actions = self
                    .protocols
                    .get_mut(peer_id)
                    .map(|p| p.handle_disconnect())
                    .unwrap_or_default();
                self.run_actions(peer_id, actions).await;
                self.connections.remove(peer_id).await;
            }
        }
        Ok(())
    }

    // ── User commands ────────────────────────────────────────────────────

    async fn handle_command(&mut self, cmd: Command) -> Result<(), Error> {
        match cmd {
            Command::SendFile { peer_id, path } => {
                if !self.connections.contains(&peer_id) {
                    return Err(TransferError::PeerDisconnected(peer_id).into());
                }
                let file_name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .ok_or_else(|| {
                        Error::Io(std::io::Error::new(
                            std::io::ErrorKind::InvalidInput,
                            format!("not a file path: {}", path.display()),
                        ))
                    })?;
                let source = ChunkSource::open(&path).await?;
                let actions = self.protocol(&peer_id)?.request_send(file_name, source)?;
                self.run_actions(&peer_id, actions).await;
            }
            Command::AcceptRequest { peer_id } => {
                if !self.registry.contains(&peer_id) {
                    return Err(TransferError::PeerDisconnected(peer_id).into());
                }
                let actions = self.protocol(&peer_id)?.accept_request()?;
                self.run_actions(&peer_id, actions).await;
            }
            Command::CancelRequest { peer_id } => {
                if !self.registry.contains(&peer_id) {
                    return Err(TransferError::PeerDisconnected(peer_id).into());
                }
                let actions = self.protocol(&peer_id)?.cancel_request()?;
                self.run_actions(&peer_id, actions).await;
            }
            Command::ListPeers | Command::Quit => {}
        }
        Ok(())
    }

    // ── Action execution ─────────────────────────────────────────────────

    async fn run_actions(&mut self, peer_id: &str, actions: Vec<ProtocolAction>) {
        for action in actions {
            match action {
                ProtocolAction::Signal(msg) => {
                    if let Err(e) = self.signaling.send(msg) {
                        self.report(peer_id, e.into());
                    }
                }
                ProtocolAction::Frame(frame) => {
                    if let Err(e) = self.connections.send_frame(peer_id, frame).await {
                        // A failed mid-transfer send is a dead channel.
                        self.report(peer_id, e.into());
                        let follow_up = self
                            .protocols
                            .get_mut(peer_id)
                            .map(|p| p.handle_disconnect())
                            .unwrap_or_default();
                        for a in follow_up {
                            if let ProtocolAction::Notify(notice) = a {
                                self.emit_notice(peer_id, notice);
                            }
                        }
                    }
                }
                ProtocolAction::FileReady { file_name, data } => {
                    self.save_file(peer_id, &file_name, data).await;
                }
                ProtocolAction::Notify(notice) => self.emit_notice(peer_id, notice),
            }
        }
    }

    async fn save_file(&mut self, peer_id: &str, file_name: &str, data: Vec<u8>) {
        let path = self.download_dir.join(sanitize_file_name(file_name));
        match tokio::fs::write(&path, &data).await {
            Ok(()) => {
                info!(
                    event = "file_saved",
                    peer_id = %peer_id,
                    path = %path.display(),
                    bytes = data.len(),
                    "received file written"
                );
                self.emit(AppEvent::FileSaved {
                    peer_id: peer_id.to_string(),
                    file_name: file_name.to_string(),
                    path,
                });
            }
            Err(e) => self.report(peer_id, e.into()),
        }
    }

    async fn drop_peer(&mut self, peer_id: &str) {
        let record = self.registry.remove(peer_id);
        if let Some(mut proto) = self.protocols.remove(peer_id) {
            for action in proto.handle_disconnect() {
                if let ProtocolAction::Notify(notice) = action {
                    self.emit_notice(peer_id, notice);
                }
            }
        }
        self.pending.remove(peer_id);
        self.connections.remove(peer_id).await;
        if let Some(record) = record {
            self.emit(AppEvent::PeerLeft {
                peer_id: record.peer_id,
                display_name: record.display_name,
            });
        }
    }

    /// Per-peer protocol machine, created on first use. Creation is gated on
    /// room membership so relay or channel traffic naming an id that never
    /// joined cannot mint state.
    fn protocol(&mut self, peer_id: &str) -> Result<&mut TransferProtocol, Error> {
        if !self.protocols.contains_key(peer_id) && !self.registry.contains(peer_id) {
            return Err(ConnectionError::UnknownPeer(peer_id.to_string()).into());
        }
        let pending = self.pending.clone();
        Ok(self
            .protocols
            .entry(peer_id.to_string())
            .or_insert_with(|| TransferProtocol::new(peer_id, pending)))
    }

    fn emit_notice(&mut self, peer_id: &str, notice: TransferNotice) {
        self.emit(notice_to_event(peer_id, notice));
    }

    fn emit(&mut self, event: AppEvent) {
        debug!(event = "app_event", app_event = ?event, "publishing app event");
        let _ = self.app_tx.send(event);
    }
}

/// Map a protocol-level notice onto the app event stream.
fn notice_to_event(peer_id: &str, notice: TransferNotice) -> AppEvent {
    let peer_id = peer_id.to_string();
    match notice {
        TransferNotice::IncomingRequest {
            file_name,
            file_size,
        } => AppEvent::IncomingRequest {
            peer_id,
            file_name,
            file_size,
        },
        TransferNotice::Progress {
            direction,
            file_name,
            bytes_transferred,
            file_size,
        } => AppEvent::Progress {
            peer_id,
            direction,
            file_name,
            bytes_transferred,
            file_size,
        },
        TransferNotice::SendComplete { file_name } => AppEvent::SendComplete { peer_id, file_name },
        TransferNotice::Cancelled => AppEvent::TransferCancelled { peer_id },
        TransferNotice::Failed { reason } => AppEvent::TransferFailed { peer_id, reason },
    }
}

/// Keep received files inside the download directory: strip any path
/// components the sender put in the name.
fn sanitize_file_name(name: &str) -> String {
    let base = name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(name)
        .trim()
        .to_string();
    if base.is_empty() || base == "." || base == ".." {
        "unnamed".to_string()
    } else {
        base
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_engine() -> (
        Engine,
        mpsc::UnboundedReceiver<AppEvent>,
        mpsc::UnboundedReceiver<ClientMessage>,
    ) {
        let (signaling, relay_rx) = SignalingClient::detached();
        let (_sig_tx, signaling_rx) = mpsc::unbounded_channel();
        let (connections, peer_events) = ConnectionManager::new();
        let (_cmd_tx, commands) = mpsc::unbounded_channel();
        let (app_tx, app_rx) = mpsc::unbounded_channel();
        (
            Engine {
                signaling,
                signaling_rx,
                connections,
                peer_events,
                registry: PeerRegistry::new(),
                pending: Arc::new(PendingRequestTable::new()),
                protocols: HashMap::new(),
                commands,
                app_tx,
                display_name: "tester".to_string(),
                download_dir: PathBuf::from("downloads"),
            },
            app_rx,
            relay_rx,
        )
    }

    #[tokio::test]
    async fn late_negotiation_data_is_dropped_quietly() {
        // An answer or candidate can arrive after its connection was torn
        // down; neither may surface as a transfer failure.
        let (mut engine, mut app_rx, _relay_rx) = test_engine();
        engine
            .dispatch_signal(ServerMessage::AnswerReceive {
                peer_id: "gone".into(),
                sdp: "{}".into(),
            })
            .await;
        engine
            .dispatch_signal(ServerMessage::IceCandidate {
                peer_id: "gone".into(),
                candidate: "{}".into(),
            })
            .await;
        assert!(app_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn transfer_signals_require_room_membership() {
        let (mut engine, mut app_rx, _relay_rx) = test_engine();

        // A relay frame naming an id that never joined mints no state.
        engine
            .dispatch_signal(ServerMessage::ReceiveFileRequest {
                peer_id: "ghost".into(),
                file_name: "a.bin".into(),
                file_size: 42,
            })
            .await;
        engine
            .dispatch_signal(ServerMessage::RequestAccepted {
                peer_id: "ghost".into(),
            })
            .await;
        assert!(engine.protocols.is_empty());
        assert!(app_rx.try_recv().is_err());

        // Once the peer is announced, the same frame reaches the protocol.
        engine
            .dispatch_signal(ServerMessage::NewUser {
                peer_id: "p1".into(),
                display_name: "alice".into(),
            })
            .await;
        engine
            .dispatch_signal(ServerMessage::ReceiveFileRequest {
                peer_id: "p1".into(),
                file_name: "a.bin".into(),
                file_size: 42,
            })
            .await;
        assert!(engine.protocols.contains_key("p1"));
        assert!(matches!(app_rx.try_recv(), Ok(AppEvent::PeerJoined { .. })));
        assert!(matches!(
            app_rx.try_recv(),
            Ok(AppEvent::IncomingRequest { peer_id, .. }) if peer_id == "p1"
        ));
    }

    #[test]
    fn file_names_are_confined_to_download_dir() {
        assert_eq!(sanitize_file_name("report.pdf"), "report.pdf");
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name(r"C:\Users\x\a.bin"), "a.bin");
        assert_eq!(sanitize_file_name(""), "unnamed");
        assert_eq!(sanitize_file_name(".."), "unnamed");
    }

    #[test]
    fn notices_map_to_peer_scoped_events() {
        let ev = notice_to_event(
            "p1",
            TransferNotice::Progress {
                direction: Direction::Send,
                file_name: "a.bin".into(),
                bytes_transferred: 10,
                file_size: 100,
            },
        );
        match ev {
            AppEvent::Progress {
                peer_id,
                bytes_transferred,
                file_size,
                ..
            } => {
                assert_eq!(peer_id, "p1");
                assert_eq!(bytes_transferred, 10);
                assert_eq!(file_size, 100);
            }
            other => panic!("unexpected event: {other:?}"),
        }

        let ev = notice_to_event("p2", TransferNotice::Cancelled);
        assert!(matches!(ev, AppEvent::TransferCancelled { peer_id } if peer_id == "p2"));
    }
}
