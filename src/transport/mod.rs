//! Thin façade over the point-to-point transport underneath the dispatch loop.
//!
//! Messages are *contiguous byte payloads* tagged with a [`ChannelId`]. A
//! transport must deliver messages from any one sender in the order that
//! sender committed them; there is no ordering between different senders.
//!
//! Backends:
//! - [`local::LocalCluster`]: ranks are threads of one process.
//! - [`solo::SoloTransport`]: a single rank with no peers.
//! - `mpi::MpiTransport` (feature `mpi-support`): one rank per MPI process.

use crate::channel::ChannelId;
use crate::rpc_error::RpcError;
use crate::topology::Rank;
use bytes::Bytes;

pub mod local;
#[cfg(feature = "mpi-support")]
pub mod mpi;
pub mod solo;

/// One inbound or outbound unit of traffic.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub sender: Rank,
    pub channel: ChannelId,
    /// May be empty: synchronization signals carry no data.
    pub payload: Bytes,
}

impl Message {
    pub fn new(sender: Rank, channel: ChannelId, payload: impl Into<Bytes>) -> Self {
        Self {
            sender,
            channel,
            payload: payload.into(),
        }
    }

    /// A message with an empty payload.
    pub fn signal(sender: Rank, channel: ChannelId) -> Self {
        Self::new(sender, channel, Bytes::new())
    }
}

/// Reliable point-to-point messaging between the ranks of a fixed-size cluster.
///
/// `send` may only queue; nothing is guaranteed to leave this process until
/// [`flush`](Transport::flush) returns. `recv` is called from exactly one
/// thread, the dispatch loop.
pub trait Transport: Send + Sync + 'static {
    /// Rank of this process, fixed for the transport's lifetime.
    fn rank(&self) -> Rank;

    /// Number of ranks in the cluster.
    fn size(&self) -> usize;

    /// Queue `payload` for delivery to `dest` on `channel`.
    fn send(&self, dest: Rank, channel: ChannelId, payload: Bytes) -> Result<(), RpcError>;

    /// Block until the next message arrives. `Ok(None)` means the transport
    /// was closed and no further message will be returned.
    fn recv(&self) -> Result<Option<Message>, RpcError>;

    /// Commit every send queued by this process so far.
    fn flush(&self) -> Result<(), RpcError>;

    /// End the receive stream: a blocked or future `recv` returns `Ok(None)`.
    fn close(&self);
}

pub(crate) fn check_dest(dest: Rank, size: usize) -> Result<(), RpcError> {
    if dest < size {
        Ok(())
    } else {
        Err(RpcError::InvalidRank { rank: dest, size })
    }
}
