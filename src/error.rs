use thiserror::Error;

use crate::wire::message::{Command, RejectCode};

pub type Result<T> = std::result::Result<T, PeerError>;

/// Failure of a chain or mempool lookup the session performed on a
/// peer's behalf. Surfaces upward as an `error` event; it does not
/// destroy the session.
#[derive(Debug, Error)]
#[error("store failure: {0}")]
pub struct StoreError(pub String);

/// Everything that can go wrong inside one peer session.
///
/// The variants map onto the session's three severity classes:
/// transport and handshake failures destroy the peer, protocol
/// violations raise the ban score (and may destroy it once the score
/// crosses the threshold), store failures only surface upward.
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("connection error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("connection timed out")]
    ConnectTimeout,

    #[error("handshake failure: {0}")]
    Handshake(&'static str),

    #[error("protocol violation: {reason}")]
    Violation {
        reason: &'static str,
        /// Ban score charged for this violation (typically 10 or 100).
        score: u32,
        /// BIP61 category for the `reject` packet, when one is sent.
        reject: Option<RejectCode>,
    },

    #[error("no response for {0:?} within the request window")]
    RequestTimeout(Command),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("peer destroyed")]
    Destroyed,
}

impl PeerError {
    pub fn violation(reason: &'static str, score: u32) -> Self {
        PeerError::Violation {
            reason,
            score,
            reject: None,
        }
    }

    /// Transport-class errors (including connect timeouts) put the host
    /// on the pool's negative-reputation short-list before the session
    /// is torn down.
    pub fn is_transport(&self) -> bool {
        matches!(self, PeerError::Transport(_) | PeerError::ConnectTimeout)
    }

    /// Ban score this error charges, zero for non-violations.
    pub fn ban_score(&self) -> u32 {
        match self {
            PeerError::Violation { score, .. } => *score,
            _ => 0,
        }
    }
}
