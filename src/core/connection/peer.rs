//! A single peer's transport: one `RTCPeerConnection` with one ordered,
//! reliable data channel labelled per [`DATA_CHANNEL_LABEL`].
//!
//! All transport callbacks are converted into typed [`PeerEvent`]s on a
//! shared channel, so the engine consumes one event stream instead of
//! registering per-connection closures.
//!
//! ICE is trickled: local candidates surface as events as they are found
//! and travel over signaling; remote candidates arriving before the remote
//! description is set are queued and applied once it lands.

use super::PeerEvent;
use crate::core::config::{DATA_CHANNEL_LABEL, SCTP_MAX_MESSAGE_SIZE, STUN_SERVERS};
use crate::core::error::ConnectionError;
use crate::core::transfer::ChannelFrame;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::{SctpMaxMessageSize, SettingEngine};
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

fn setup_err(e: impl std::fmt::Display) -> ConnectionError {
    ConnectionError::SetupFailed(e.to_string())
}

fn negotiation_err(e: impl std::fmt::Display) -> ConnectionError {
    ConnectionError::NegotiationFailed(e.to_string())
}

fn ice_servers() -> Vec<RTCIceServer> {
    vec![RTCIceServer {
        urls: STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
        ..Default::default()
    }]
}

async fn build_api() -> Result<webrtc::api::API, ConnectionError> {
    let mut me = MediaEngine::default();
    let reg = register_default_interceptors(Registry::new(), &mut me).map_err(setup_err)?;

    // Raise the SCTP send limit: file chunks are larger than the crate's
    // default 64 KB cap.
    let mut se = SettingEngine::default();
    se.set_sctp_max_message_size_can_send(SctpMaxMessageSize::Bounded(SCTP_MAX_MESSAGE_SIZE));

    Ok(APIBuilder::new()
        .with_setting_engine(se)
        .with_media_engine(me)
        .with_interceptor_registry(reg)
        .build())
}

/// Advertise our large-message receive capability in the SDP. The webrtc
/// crate does not expose a receive-side limit setter; the attribute tells
/// the remote peer it may send full-size chunks.
fn inject_max_message_size(mut desc: RTCSessionDescription) -> RTCSessionDescription {
    if !desc.sdp.contains("a=max-message-size:") {
        desc.sdp
            .push_str(&format!("a=max-message-size:{}\r\n", SCTP_MAX_MESSAGE_SIZE));
    }
    desc
}

/// One peer's WebRTC connection.
pub struct PeerConnection {
    peer_id: String,
    pc: Arc<RTCPeerConnection>,
    channel: Arc<RwLock<Option<Arc<RTCDataChannel>>>>,
    events: mpsc::UnboundedSender<(String, PeerEvent)>,
    /// Whether `set_remote_description` has run. Candidates arriving before
    /// that are held in `queued_candidates`.
    remote_set: bool,
    queued_candidates: Vec<RTCIceCandidateInit>,
}

impl PeerConnection {
    /// Create the transport for `peer_id`. No SDP exchange happens yet;
    /// follow with [`create_offer`] or [`accept_offer`].
    ///
    /// [`create_offer`]: Self::create_offer
    /// [`accept_offer`]: Self::accept_offer
    pub async fn new(
        peer_id: &str,
        events: mpsc::UnboundedSender<(String, PeerEvent)>,
    ) -> Result<Self, ConnectionError> {
        let api = build_api().await?;
        let pc = Arc::new(
            api.new_peer_connection(RTCConfiguration {
                ice_servers: ice_servers(),
                ..Default::default()
            })
            .await
            .map_err(setup_err)?,
        );

        let channel: Arc<RwLock<Option<Arc<RTCDataChannel>>>> = Arc::new(RwLock::new(None));

        // Connection state → peer event. Transient disconnects may recover
        // via ICE; only Failed and Closed end the peer.
        {
            let events = events.clone();
            let peer_id = peer_id.to_string();
            pc.on_peer_connection_state_change(Box::new(move |s| {
                let events = events.clone();
                let peer_id = peer_id.clone();
                Box::pin(async move {
                    match s {
                        RTCPeerConnectionState::Connected => {
                            info!(
                                event = "webrtc_connected",
                                peer_id = %peer_id,
                                "WebRTC connection established"
                            );
                        }
                        RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed => {
                            error!(
                                event = "webrtc_down",
                                peer_id = %peer_id,
                                state = ?s,
                                "WebRTC connection ended"
                            );
                            let _ = events.send((peer_id, PeerEvent::Closed));
                        }
                        RTCPeerConnectionState::Disconnected => {
                            warn!(
                                event = "webrtc_disconnected",
                                peer_id = %peer_id,
                                "WebRTC transient disconnect (ICE may recover)"
                            );
                        }
                        _ => {}
                    }
                })
            }));
        }

        // Trickle ICE: forward each local candidate as it is gathered.
        {
            let events = events.clone();
            let peer_id = peer_id.to_string();
            pc.on_ice_candidate(Box::new(move |candidate| {
                let events = events.clone();
                let peer_id = peer_id.clone();
                Box::pin(async move {
                    let Some(candidate) = candidate else { return };
                    match candidate.to_json() {
                        Ok(init) => match serde_json::to_string(&init) {
                            Ok(json) => {
                                let _ = events.send((peer_id, PeerEvent::LocalCandidate(json)));
                            }
                            Err(e) => warn!(
                                event = "ice_candidate_encode_failure",
                                error = %e,
                                "dropping local ICE candidate"
                            ),
                        },
                        Err(e) => warn!(
                            event = "ice_candidate_encode_failure",
                            error = %e,
                            "dropping local ICE candidate"
                        ),
                    }
                })
            }));
        }

        // Answerer side: the offerer creates the channel, we receive it.
        {
            let events = events.clone();
            let peer_id = peer_id.to_string();
            let channel = channel.clone();
            pc.on_data_channel(Box::new(move |dc| {
                let events = events.clone();
                let peer_id = peer_id.clone();
                let channel = channel.clone();
                Box::pin(async move {
                    if dc.label() != DATA_CHANNEL_LABEL {
                        warn!(
                            event = "unexpected_data_channel",
                            peer_id = %peer_id,
                            label = %dc.label(),
                            "ignoring channel with unknown label"
                        );
                        return;
                    }
                    attach_channel_handlers(&dc, &peer_id, &events);
                    *channel.write().await = Some(dc);
                })
            }));
        }

        Ok(Self {
            peer_id: peer_id.to_string(),
            pc,
            channel,
            events,
            remote_set: false,
            queued_candidates: Vec::new(),
        })
    }

    /// Offerer path: create the data channel, produce the local offer, and
    /// return it serialized for signaling.
    pub async fn create_offer(&mut self) -> Result<String, ConnectionError> {
        let dc = self
            .pc
            .create_data_channel(
                DATA_CHANNEL_LABEL,
                Some(RTCDataChannelInit {
                    ordered: Some(true),
                    ..Default::default()
                }),
            )
            .await
            .map_err(setup_err)?;
        attach_channel_handlers(&dc, &self.peer_id, &self.events);
        *self.channel.write().await = Some(dc);

        let offer = self.pc.create_offer(None).await.map_err(negotiation_err)?;
        self.pc
            .set_local_description(offer)
            .await
            .map_err(negotiation_err)?;
        self.local_description_json().await
    }

    /// Answerer path: apply the peer's offer and return our serialized answer.
    pub async fn accept_offer(&mut self, offer_json: &str) -> Result<String, ConnectionError> {
        let desc: RTCSessionDescription =
            serde_json::from_str(offer_json).map_err(negotiation_err)?;
        self.set_remote(desc).await?;

        let answer = self.pc.create_answer(None).await.map_err(negotiation_err)?;
        self.pc
            .set_local_description(answer)
            .await
            .map_err(negotiation_err)?;
        self.local_description_json().await
    }

    /// Offerer path: apply the peer's answer.
    pub async fn apply_answer(&mut self, answer_json: &str) -> Result<(), ConnectionError> {
        let desc: RTCSessionDescription =
            serde_json::from_str(answer_json).map_err(negotiation_err)?;
        self.set_remote(desc).await
    }

    /// Apply a remote ICE candidate, queueing it if the remote description
    /// has not been set yet.
    pub async fn apply_candidate(&mut self, candidate_json: &str) -> Result<(), ConnectionError> {
        let init: RTCIceCandidateInit =
            serde_json::from_str(candidate_json).map_err(negotiation_err)?;
        if !self.remote_set {
            debug!(
                event = "ice_candidate_queued",
                peer_id = %self.peer_id,
                "remote description not set yet"
            );
            self.queued_candidates.push(init);
            return Ok(());
        }
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(negotiation_err)
    }

    async fn set_remote(&mut self, desc: RTCSessionDescription) -> Result<(), ConnectionError> {
        self.pc
            .set_remote_description(desc)
            .await
            .map_err(negotiation_err)?;
        self.remote_set = true;

        for init in self.queued_candidates.drain(..) {
            if let Err(e) = self.pc.add_ice_candidate(init).await {
                warn!(
                    event = "ice_candidate_apply_failure",
                    peer_id = %self.peer_id,
                    error = %e,
                    "queued ICE candidate rejected"
                );
            }
        }
        Ok(())
    }

    async fn local_description_json(&self) -> Result<String, ConnectionError> {
        let desc = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| ConnectionError::NegotiationFailed("no local description".into()))?;
        serde_json::to_string(&inject_max_message_size(desc)).map_err(negotiation_err)
    }

    /// Send one frame on the data channel.
    pub async fn send_frame(&self, frame: ChannelFrame) -> Result<(), ConnectionError> {
        let guard = self.channel.read().await;
        let dc = match guard.as_ref() {
            Some(dc) if dc.ready_state() == RTCDataChannelState::Open => dc.clone(),
            _ => return Err(ConnectionError::ChannelUnavailable(self.peer_id.clone())),
        };
        drop(guard);

        let sent = match frame {
            ChannelFrame::Binary(bytes) => dc.send(&bytes).await,
            ChannelFrame::Text(text) => dc.send_text(text).await,
        };
        if let Err(e) = sent {
            warn!(
                event = "data_channel_send_failure",
                peer_id = %self.peer_id,
                error = %e,
                "frame send failed"
            );
            return Err(ConnectionError::ChannelUnavailable(self.peer_id.clone()));
        }
        Ok(())
    }

    /// Close the transport. Idempotent; failures are logged, not surfaced.
    pub async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            warn!(
                event = "webrtc_close_failure",
                peer_id = %self.peer_id,
                error = %e,
                "error closing peer connection"
            );
        }
    }
}

/// Wire the data channel's callbacks onto the shared event stream.
fn attach_channel_handlers(
    dc: &Arc<RTCDataChannel>,
    peer_id: &str,
    events: &mpsc::UnboundedSender<(String, PeerEvent)>,
) {
    {
        let events = events.clone();
        let peer_id = peer_id.to_string();
        dc.on_open(Box::new(move || {
            let events = events.clone();
            let peer_id = peer_id.clone();
            Box::pin(async move {
                debug!(event = "data_channel_open", peer_id = %peer_id, "data channel open");
                let _ = events.send((peer_id, PeerEvent::ChannelOpen));
            })
        }));
    }

    {
        let events = events.clone();
        let peer_id = peer_id.to_string();
        dc.on_message(Box::new(move |msg| {
            let events = events.clone();
            let peer_id = peer_id.clone();
            Box::pin(async move {
                // Frame kind is carried by the payload type: text frames are
                // control messages, binary frames are file chunks.
                let event = if msg.is_string {
                    PeerEvent::Text(String::from_utf8_lossy(&msg.data).into_owned())
                } else {
                    PeerEvent::Binary(msg.data)
                };
                let _ = events.send((peer_id, event));
            })
        }));
    }

    {
        let events = events.clone();
        let peer_id = peer_id.to_string();
        dc.on_close(Box::new(move || {
            let events = events.clone();
            let peer_id = peer_id.clone();
            Box::pin(async move {
                debug!(event = "data_channel_closed", peer_id = %peer_id, "data channel closed");
                let _ = events.send((peer_id, PeerEvent::Closed));
            })
        }));
    }
}
