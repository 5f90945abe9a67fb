//! The dispatch loop: the only reader of the transport.
//!
//! One thread per node repeatedly receives the next message, routes it through
//! the registry and hands it synchronously to the matching transaction before
//! receiving again, so message processing never overlaps with itself. Any
//! error ends the loop and is fatal for the node.

use crate::channel::{self, registry::Route};
use crate::rpc::RpcContext;
use crate::rpc_error::RpcError;
use crate::transport::Message;

/// Counters reported by a dispatch loop that stopped cleanly.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Messages handed to a transaction.
    pub delivered: u64,
    /// Messages parked because their channel was not registered yet.
    pub deferred: u64,
}

/// Run until the transport is closed or a fatal error occurs.
pub(crate) fn run(ctx: &RpcContext) -> Result<DispatchStats, RpcError> {
    log::info!(
        "rank {}: dispatch loop started ({} ranks, arity {})",
        ctx.rank(),
        ctx.size(),
        ctx.topology().arity()
    );
    let mut stats = DispatchStats::default();
    let outcome = loop {
        match ctx.transport().recv() {
            Ok(Some(msg)) => {
                if let Err(err) = dispatch_one(ctx, msg, &mut stats) {
                    break Err(err);
                }
            }
            Ok(None) => break Ok(()),
            Err(err) => break Err(err),
        }
    };
    match outcome {
        Ok(()) => {
            log::info!(
                "rank {}: dispatch loop stopped (delivered={}, deferred={})",
                ctx.rank(),
                stats.delivered,
                stats.deferred
            );
            Ok(stats)
        }
        Err(err) => Err(ctx.fatal(err)),
    }
}

fn dispatch_one(
    ctx: &RpcContext,
    msg: Message,
    stats: &mut DispatchStats,
) -> Result<(), RpcError> {
    log::trace!(
        "rank {}: message from {} on channel {} ({} bytes)",
        ctx.rank(),
        msg.sender,
        msg.channel,
        msg.payload.len()
    );
    match ctx.registry().route(msg)? {
        Route::Deliver { channel, gate, msg } => {
            let _open = gate.lock();
            channel::deliver(ctx, channel.as_ref(), msg)?;
            stats.delivered += 1;
        }
        Route::Deferred => stats.deferred += 1,
    }
    // Whatever the transaction queued goes out before the next receive.
    ctx.flush()
}
