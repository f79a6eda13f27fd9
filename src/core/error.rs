//! Error taxonomy for the transfer stack.
//!
//! Failures are peer-scoped: an error in one peer's signaling exchange,
//! connection, or transfer never aborts the process or touches another
//! peer's sessions. The engine reports them as per-peer notifications.

use thiserror::Error;

/// Relay / signaling failures.
#[derive(Debug, Error)]
pub enum SignalingError {
    /// The relay could not be reached or the WebSocket handshake failed.
    #[error("relay connection failed: {0}")]
    Connect(String),

    /// The relay connection is gone; no further messages can be sent.
    #[error("relay connection closed")]
    ChannelClosed,

    /// The relay delivered a frame that does not parse as a known message.
    #[error("malformed signaling message: {0}")]
    Malformed(String),
}

/// Per-peer transport connection failures. Destroys that peer's connection
/// only; the caller may retry by re-initiating.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Creating the peer connection or its data channel failed.
    #[error("transport setup failed: {0}")]
    SetupFailed(String),

    /// Applying an offer, answer, or ICE candidate failed.
    #[error("negotiation failed: {0}")]
    NegotiationFailed(String),

    /// A signaling message referenced a peer we hold no connection for.
    #[error("no connection for peer {0}")]
    UnknownPeer(String),

    /// The data channel is absent or not open.
    #[error("data channel unavailable for peer {0}")]
    ChannelUnavailable(String),
}

/// Violations of the chunk transfer protocol. Never silently ignored: the
/// peer-declared file size is untrusted input.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A receive session was handed more bytes than the declared file size.
    #[error("peer delivered {received} bytes against a declared size of {declared}")]
    OverLength { declared: u64, received: u64 },

    /// A chunk or control message arrived with no session to consume it.
    #[error("unexpected {what} from peer {peer_id}")]
    UnexpectedMessage { peer_id: String, what: &'static str },

    /// A buffer was finalized before all declared bytes arrived.
    #[error("incomplete buffer finalized: {received} of {declared} bytes")]
    Incomplete { declared: u64, received: u64 },
}

/// Transfer lifecycle failures.
#[derive(Debug, Error)]
pub enum TransferError {
    /// The data channel closed while a transfer was in flight. The session
    /// moves to `Failed` and its buffer is discarded; no retry is attempted.
    #[error("peer {0} disconnected mid-transfer")]
    PeerDisconnected(String),

    /// A request is already pending or downloading for this peer.
    #[error("a transfer is already pending for peer {0}")]
    AlreadyActive(String),

    /// An operation was attempted in a session state that does not allow it.
    #[error("invalid session transition: {from} -> {to}")]
    InvalidTransition { from: &'static str, to: &'static str },
}

/// Umbrella error for the protocol and engine layers.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Signaling(#[from] SignalingError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
