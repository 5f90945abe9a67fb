//! Tree barrier: fan-in to the root, then fan-out back to the leaves.
//!
//! Each rank waits for a notify from every child, then notifies its parent
//! and waits for the parent's release. The root releases its children as soon
//! as all of them have reported, and every rank forwards the release to its
//! own children before returning. One barrier moves exactly `2·(N−1)`
//! messages.
//!
//! A channel id can be reused for any number of barriers. Every signal
//! carries the barrier's *round*: how many barriers this node ran on the same
//! id before. A message whose round is not the running barrier's (an empty
//! one included) is not part of it and fails with `UnknownChannel`, so a
//! stray message parked on a reused id is never counted by a later barrier.
//!
//! ```text
//! Init ─► WaitingChildren ─┬─(root)─────────────────────────► Done
//!                          └─(non-root) notify parent ─► WaitingParentAck ─► Done
//! ```

use crate::channel::signal::Completion;
use crate::channel::{Channel, ChannelId, Transaction, TransactionRef};
use crate::rpc::RpcContext;
use crate::rpc_error::RpcError;
use crate::topology::{Rank, TreeTopology};
use crate::transport::Message;
use bytes::Bytes;
use parking_lot::Mutex;
use std::ops::Range;
use std::sync::Arc;

/// Payload of a barrier signal for `round`: eight bytes, little-endian.
pub fn round_signal(round: u64) -> Bytes {
    Bytes::copy_from_slice(&round.to_le_bytes())
}

/// The round carried by a barrier signal, `None` if `payload` is not one.
pub fn signal_round(payload: &[u8]) -> Option<u64> {
    <[u8; 8]>::try_from(payload).ok().map(u64::from_le_bytes)
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BarrierPhase {
    Init,
    WaitingChildren,
    WaitingParentAck,
    Done,
}

impl BarrierPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            BarrierPhase::Init => "initializing",
            BarrierPhase::WaitingChildren => "waiting for children",
            BarrierPhase::WaitingParentAck => "waiting for parent release",
            BarrierPhase::Done => "done",
        }
    }
}

/// Per-rank protocol state of one barrier.
pub struct BarrierTransaction {
    channel: ChannelId,
    round: u64,
    rank: Rank,
    parent: Option<Rank>,
    children: Range<Rank>,
    /// Which children have reported, indexed from `children.start`.
    reported: Vec<bool>,
    received: usize,
    phase: BarrierPhase,
    done: Arc<Completion>,
}

impl BarrierTransaction {
    fn new(
        channel: ChannelId,
        round: u64,
        rank: Rank,
        topology: &TreeTopology,
        done: Arc<Completion>,
    ) -> Self {
        let children = topology.children(rank);
        Self {
            channel,
            round,
            rank,
            parent: topology.parent(rank),
            reported: vec![false; children.len()],
            children,
            received: 0,
            phase: BarrierPhase::Init,
            done,
        }
    }

    pub fn phase(&self) -> BarrierPhase {
        self.phase
    }

    pub fn received(&self) -> usize {
        self.received
    }

    pub fn round(&self) -> u64 {
        self.round
    }

    /// Leave `Init`. A leaf has nothing to wait for and notifies its parent
    /// right away.
    pub fn start(&mut self, ctx: &RpcContext) -> Result<(), RpcError> {
        debug_assert_eq!(self.phase, BarrierPhase::Init);
        self.phase = BarrierPhase::WaitingChildren;
        self.check_state(ctx)
    }

    fn check_state(&mut self, ctx: &RpcContext) -> Result<(), RpcError> {
        if self.phase != BarrierPhase::WaitingChildren || self.received < self.children.len() {
            return Ok(());
        }
        match self.parent {
            None => self.release(ctx),
            Some(parent) => {
                log::debug!(
                    "barrier {} round {}: rank {} notifies parent {parent}",
                    self.channel,
                    self.round,
                    self.rank
                );
                ctx.send(parent, self.channel, round_signal(self.round))?;
                self.phase = BarrierPhase::WaitingParentAck;
                Ok(())
            }
        }
    }

    /// Terminal step: give up the channel id, release the children, then wake
    /// the caller.
    fn release(&mut self, ctx: &RpcContext) -> Result<(), RpcError> {
        ctx.registry().unregister(self.channel)?;
        self.phase = BarrierPhase::Done;
        for child in self.children.clone() {
            ctx.send(child, self.channel, round_signal(self.round))?;
        }
        ctx.flush()?;
        log::debug!(
            "barrier {}: rank {} released {} children",
            self.channel,
            self.rank,
            self.children.len()
        );
        self.done.complete(Ok(()));
        Ok(())
    }

    fn violation(&self, sender: Rank) -> RpcError {
        RpcError::ProtocolViolation {
            channel: self.channel,
            sender,
            phase: self.phase.as_str(),
            received: self.received,
        }
    }
}

impl Transaction for BarrierTransaction {
    fn channel(&self) -> ChannelId {
        self.channel
    }

    fn handle_message(&mut self, ctx: &RpcContext, msg: Message) -> Result<(), RpcError> {
        let sender = msg.sender;
        log::trace!(
            "barrier {}: rank {} got message from {sender} while {}",
            self.channel,
            self.rank,
            self.phase.as_str()
        );
        if signal_round(&msg.payload) != Some(self.round) {
            log::debug!(
                "barrier {}: rank {} got a message from {sender} that is not a round {} signal",
                self.channel,
                self.rank,
                self.round
            );
            return Err(RpcError::UnknownChannel(self.channel));
        }
        match self.phase {
            BarrierPhase::WaitingChildren => {
                let slot = sender
                    .checked_sub(self.children.start)
                    .filter(|_| self.children.contains(&sender))
                    .ok_or_else(|| self.violation(sender))?;
                if std::mem::replace(&mut self.reported[slot], true) {
                    return Err(self.violation(sender));
                }
                self.received += 1;
                self.check_state(ctx)
            }
            BarrierPhase::WaitingParentAck if Some(sender) == self.parent => self.release(ctx),
            BarrierPhase::WaitingParentAck | BarrierPhase::Init => Err(self.violation(sender)),
            // The id was given up on entering `Done`; whatever this is, it
            // must not be swallowed by a finished barrier.
            BarrierPhase::Done => Err(RpcError::UnknownChannel(self.channel)),
        }
    }
}

/// Transient channel that exists for the duration of one barrier.
pub struct BarrierChannel {
    transaction: Arc<Mutex<BarrierTransaction>>,
    done: Arc<Completion>,
}

impl BarrierChannel {
    /// Barrier number `round` on `channel`, counted per node from zero.
    pub fn new(channel: ChannelId, round: u64, rank: Rank, topology: &TreeTopology) -> Self {
        let done = Arc::new(Completion::new());
        let transaction =
            BarrierTransaction::new(channel, round, rank, topology, Arc::clone(&done));
        Self {
            transaction: Arc::new(Mutex::new(transaction)),
            done,
        }
    }

    /// Register under the transaction's channel id, drive the initial state,
    /// replay early traffic, and block until every rank has arrived.
    pub(crate) fn run(self: Arc<Self>, ctx: &RpcContext) -> Result<(), RpcError> {
        let channel = self.transaction.lock().channel();
        let started = ctx
            .registry()
            .register(channel, Arc::clone(&self) as Arc<dyn Channel>)
            .and_then(|mut claim| {
                let early = claim.take_early();
                let mut txn = self.transaction.lock();
                if !early.is_empty() {
                    log::debug!(
                        "barrier {channel}: rank {} replays {} early message(s)",
                        txn.rank,
                        early.len()
                    );
                }
                txn.start(ctx)?;
                early
                    .into_iter()
                    .try_for_each(|msg| txn.handle_message(ctx, msg))
            });
        started
            .and_then(|()| ctx.flush())
            .map_err(|err| ctx.fatal(err))?;
        self.done.wait()
    }
}

impl Channel for BarrierChannel {
    fn transaction_for(&self, _msg: &Message) -> Result<TransactionRef, RpcError> {
        let txn: TransactionRef = self.transaction.clone();
        Ok(txn)
    }

    fn fail(&self, err: &RpcError) {
        self.done.complete(Err(err.clone()));
    }
}
