//! RpcError: Unified error type for tree-rpc public APIs
//!
//! Every failure a collective can hit is fatal for that collective. The error is
//! `Clone` so the dispatch loop can hand the same value to every waiter it fails.

use crate::channel::ChannelId;
use crate::topology::Rank;
use thiserror::Error;

/// Unified error type for tree-rpc operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RpcError {
    /// A transaction received a message from a sender that is not valid for its
    /// current phase (topology mismatch or a stray message on the channel).
    #[error(
        "Protocol violation on channel {channel}: message from rank {sender} unexpected while {phase} (received={received})"
    )]
    ProtocolViolation {
        channel: ChannelId,
        sender: Rank,
        phase: &'static str,
        received: usize,
    },
    /// A message arrived for a channel with no registered handler.
    #[error("No handler registered for channel {0}")]
    UnknownChannel(ChannelId),
    /// A channel id was registered while a previous registration was still active.
    #[error("Channel {0} is already registered")]
    ChannelInUse(ChannelId),
    /// The underlying transport failed to move a message.
    #[error("Transport failure (peer {peer:?}): {reason}")]
    TransportFailure { peer: Option<Rank>, reason: String },
    /// A rank outside `0..size` was used.
    #[error("Rank {rank} is outside a cluster of size {size}")]
    InvalidRank { rank: Rank, size: usize },
    /// Configuration rejected by [`RpcConfig::validate`](crate::config::RpcConfig::validate).
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    /// The dispatch loop is no longer running, so a blocking call can never complete.
    #[error("Dispatch loop has stopped")]
    DispatcherStopped,
    /// The dispatch thread panicked.
    #[error("Dispatch thread panicked")]
    DispatcherPanicked,
}

impl RpcError {
    /// Shorthand for a [`RpcError::TransportFailure`].
    pub fn transport(peer: impl Into<Option<Rank>>, reason: impl Into<String>) -> Self {
        RpcError::TransportFailure {
            peer: peer.into(),
            reason: reason.into(),
        }
    }
}
