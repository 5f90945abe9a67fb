//! Channels: numeric routing keys that demultiplex inbound traffic.
//!
//! A [`Channel`] is registered under a [`ChannelId`] in the node's
//! [`ChannelRegistry`](registry::ChannelRegistry). For every inbound message the
//! dispatch loop asks the channel which [`Transaction`] should process it and
//! hands the message over synchronously.

use crate::rpc::RpcContext;
use crate::rpc_error::RpcError;
use crate::transport::Message;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

pub mod registry;
pub mod signal;

/// Routing key of a channel.
///
/// Ids travel as MPI tags on the MPI transport, which only accepts ids up to
/// `transport::mpi::MAX_CHANNEL_TAG` (32767).
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChannelId(pub u16);

impl ChannelId {
    pub const fn new(id: u16) -> Self {
        Self(id)
    }

    pub const fn as_u16(self) -> u16 {
        self.0
    }
}

impl From<u16> for ChannelId {
    fn from(id: u16) -> Self {
        Self(id)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Shared handle to a transaction, as handed out by a [`Channel`].
pub type TransactionRef = Arc<Mutex<dyn Transaction>>;

/// Stateful handler for one in-flight collective.
///
/// After registration only the dispatch loop drives a transaction, one message
/// at a time; the mutex exists for the hand-over at registration.
pub trait Transaction: Send {
    /// The channel this transaction is bound to.
    fn channel(&self) -> ChannelId;

    /// Process one message addressed to [`channel`](Transaction::channel).
    ///
    /// # Errors
    /// Any error is fatal for the node (see [`RpcError`]).
    fn handle_message(&mut self, ctx: &RpcContext, msg: Message) -> Result<(), RpcError>;
}

/// Produces the transaction that should process a given message.
pub trait Channel: Send + Sync {
    /// Transaction responsible for `msg`.
    fn transaction_for(&self, msg: &Message) -> Result<TransactionRef, RpcError>;

    /// Called when the dispatch loop dies while this channel is registered, so
    /// anyone blocked on it can be released with the error.
    fn fail(&self, _err: &RpcError) {}
}

/// Deliver one message to the transaction its channel selects.
pub(crate) fn deliver(
    ctx: &RpcContext,
    channel: &dyn Channel,
    msg: Message,
) -> Result<(), RpcError> {
    let handle = channel.transaction_for(&msg)?;
    let mut txn = handle.lock();
    txn.handle_message(ctx, msg)
}
