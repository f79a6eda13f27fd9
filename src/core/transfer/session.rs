//! Transfer session lifecycle: one session per active file transfer.

use crate::core::error::TransferError;

/// Which way the bytes flow, from this peer's perspective.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Send,
    Receive,
}

/// Session status. Terminal states destroy the session.
///
/// `Requested → Accepted → InProgress → Completed | Cancelled | Failed`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// Consent requested, not yet granted.
    Requested,
    /// Consent granted; no bytes moved yet.
    Accepted,
    /// At least one chunk has moved.
    InProgress,
    /// All declared bytes transferred.
    Completed,
    /// Withdrawn or declined before any chunk moved.
    Cancelled,
    /// Aborted by protocol violation or peer disconnect.
    Failed,
}

impl SessionStatus {
    fn name(self) -> &'static str {
        match self {
            SessionStatus::Requested => "requested",
            SessionStatus::Accepted => "accepted",
            SessionStatus::InProgress => "in-progress",
            SessionStatus::Completed => "completed",
            SessionStatus::Cancelled => "cancelled",
            SessionStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Cancelled | SessionStatus::Failed
        )
    }

    fn can_transition(self, to: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, to),
            (Requested, Accepted)
                | (Requested, Cancelled)
                | (Requested, Failed)
                | (Accepted, InProgress)
                | (Accepted, Cancelled)
                | (Accepted, Failed)
                | (InProgress, Completed)
                | (InProgress, Cancelled)
                | (InProgress, Failed)
        )
    }
}

/// One active file transfer with a single peer, in one direction.
///
/// Invariant: `bytes_transferred <= file_size`, and reaching `file_size`
/// coincides with the `Completed` status.
#[derive(Debug, Clone)]
pub struct TransferSession {
    pub peer_id: String,
    pub direction: Direction,
    pub file_name: String,
    pub file_size: u64,
    pub bytes_transferred: u64,
    pub status: SessionStatus,
}

impl TransferSession {
    pub fn new(
        peer_id: impl Into<String>,
        direction: Direction,
        file_name: impl Into<String>,
        file_size: u64,
    ) -> Self {
        Self {
            peer_id: peer_id.into(),
            direction,
            file_name: file_name.into(),
            file_size,
            bytes_transferred: 0,
            status: SessionStatus::Requested,
        }
    }

    /// Move to `to`, rejecting transitions outside the defined lifecycle.
    pub fn advance(&mut self, to: SessionStatus) -> Result<(), TransferError> {
        if !self.status.can_transition(to) {
            return Err(TransferError::InvalidTransition {
                from: self.status.name(),
                to: to.name(),
            });
        }
        self.status = to;
        Ok(())
    }

    /// Account for `n` transferred bytes, enforcing the size invariant.
    pub fn record_bytes(&mut self, n: u64) -> Result<(), TransferError> {
        let total = self.bytes_transferred.saturating_add(n);
        if total > self.file_size {
            return Err(TransferError::InvalidTransition {
                from: self.status.name(),
                to: "over-size",
            });
        }
        self.bytes_transferred = total;
        Ok(())
    }

    /// Whether every declared byte has been transferred.
    pub fn is_complete(&self) -> bool {
        self.bytes_transferred == self.file_size
    }

    /// Fraction of the file transferred, in `[0, 1]`.
    pub fn progress(&self) -> f64 {
        if self.file_size == 0 {
            return 1.0;
        }
        self.bytes_transferred as f64 / self.file_size as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> TransferSession {
        TransferSession::new("peer", Direction::Send, "a.bin", 100)
    }

    #[test]
    fn lifecycle_happy_path() {
        let mut s = session();
        s.advance(SessionStatus::Accepted).unwrap();
        s.advance(SessionStatus::InProgress).unwrap();
        s.record_bytes(100).unwrap();
        assert!(s.is_complete());
        s.advance(SessionStatus::Completed).unwrap();
        assert!(s.status.is_terminal());
    }

    #[test]
    fn cannot_skip_consent() {
        let mut s = session();
        assert!(s.advance(SessionStatus::InProgress).is_err());
        assert!(s.advance(SessionStatus::Completed).is_err());
    }

    #[test]
    fn terminal_states_are_final() {
        let mut s = session();
        s.advance(SessionStatus::Cancelled).unwrap();
        assert!(s.advance(SessionStatus::Accepted).is_err());
    }

    #[test]
    fn bytes_never_exceed_declared_size() {
        let mut s = session();
        s.advance(SessionStatus::Accepted).unwrap();
        s.advance(SessionStatus::InProgress).unwrap();
        s.record_bytes(60).unwrap();
        assert!(s.record_bytes(41).is_err());
        assert_eq!(s.bytes_transferred, 60);
    }

    #[test]
    fn empty_file_reports_full_progress() {
        let s = TransferSession::new("peer", Direction::Receive, "empty", 0);
        assert!(s.is_complete());
        assert_eq!(s.progress(), 1.0);
    }
}
