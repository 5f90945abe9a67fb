//! A node of the cluster: transport, topology, registry and dispatch thread.
//!
//! [`Rpc`] owns the dispatch thread; [`RpcContext`] is the state that thread
//! shares with callers and hands to every transaction.

use crate::channel::registry::ChannelRegistry;
use crate::channel::{self, Channel, ChannelId};
use crate::collective::BarrierChannel;
use crate::config::{FatalAction, RpcConfig};
use crate::debug_invariants::DebugInvariants;
use crate::dispatch::{self, DispatchStats};
use crate::rpc_error::RpcError;
use crate::topology::{Rank, TreeTopology};
use crate::transport::Transport;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;

/// State shared between the caller threads and the dispatch thread.
pub struct RpcContext {
    transport: Arc<dyn Transport>,
    topology: TreeTopology,
    registry: ChannelRegistry,
    config: RpcConfig,
    /// Barriers started so far, per channel id.
    rounds: Mutex<HashMap<ChannelId, u64>>,
}

impl RpcContext {
    pub(crate) fn new(transport: Arc<dyn Transport>, config: RpcConfig) -> Result<Self, RpcError> {
        config.validate()?;
        let (rank, size) = (transport.rank(), transport.size());
        let topology = TreeTopology::new(size, config.arity)?;
        if !topology.contains(rank) {
            return Err(RpcError::InvalidRank { rank, size });
        }
        topology.debug_assert_invariants();
        Ok(Self {
            transport,
            topology,
            registry: ChannelRegistry::new(config.unclaimed),
            config,
            rounds: Mutex::new(HashMap::new()),
        })
    }

    pub fn rank(&self) -> Rank {
        self.transport.rank()
    }

    pub fn size(&self) -> usize {
        self.topology.size()
    }

    pub fn topology(&self) -> &TreeTopology {
        &self.topology
    }

    pub fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    pub fn config(&self) -> &RpcConfig {
        &self.config
    }

    pub fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    /// Queue a message; it leaves on the next [`flush`](Self::flush).
    pub fn send(&self, dest: Rank, channel: ChannelId, payload: Bytes) -> Result<(), RpcError> {
        self.transport.send(dest, channel, payload)
    }

    pub fn flush(&self) -> Result<(), RpcError> {
        self.transport.flush()
    }

    /// Round number for the next barrier on `channel`.
    pub(crate) fn next_round(&self, channel: ChannelId) -> u64 {
        let mut rounds = self.rounds.lock();
        let round = rounds.entry(channel).or_insert(0);
        let current = *round;
        *round += 1;
        current
    }

    /// Handle a fatal error: log it, then either abort the process or poison
    /// the registry, fail every registered channel and stop the dispatch loop.
    /// Returns `err` for propagation.
    pub(crate) fn fatal(&self, err: RpcError) -> RpcError {
        log::error!("rank {}: fatal: {err}", self.rank());
        if self.config.on_fatal == FatalAction::Abort {
            std::process::abort();
        }
        for ch in self.registry.poison(&err) {
            ch.fail(&err);
        }
        self.transport.close();
        err
    }
}

/// Handle to a running node.
///
/// Dropping the handle stops the dispatch loop; use [`shutdown`](Rpc::shutdown)
/// to observe how it ended.
pub struct Rpc {
    ctx: Arc<RpcContext>,
    dispatcher: Option<JoinHandle<Result<DispatchStats, RpcError>>>,
}

static_assertions::assert_impl_all!(Rpc: Send, Sync);
static_assertions::assert_impl_all!(RpcError: Send, Sync);
static_assertions::assert_impl_all!(ChannelRegistry: Send, Sync);

impl Rpc {
    /// Bring up a node over `transport` and start its dispatch thread.
    ///
    /// # Errors
    /// `InvalidConfig` for a rejected configuration, `InvalidRank` if the
    /// transport's rank is outside its cluster, `TransportFailure` if the
    /// thread cannot be spawned.
    pub fn start<T: Transport>(transport: T, config: RpcConfig) -> Result<Self, RpcError> {
        Self::start_shared(Arc::new(transport), config)
    }

    /// Like [`start`](Self::start), for a transport the caller keeps a handle to.
    pub fn start_shared(transport: Arc<dyn Transport>, config: RpcConfig) -> Result<Self, RpcError> {
        let ctx = Arc::new(RpcContext::new(transport, config)?);
        let name = format!("{}-{}", ctx.config().dispatcher_name, ctx.rank());
        let dispatcher = {
            let ctx = Arc::clone(&ctx);
            std::thread::Builder::new()
                .name(name)
                .spawn(move || {
                    panic::catch_unwind(AssertUnwindSafe(|| dispatch::run(&ctx)))
                        .unwrap_or_else(|_| Err(ctx.fatal(RpcError::DispatcherPanicked)))
                })
                .map_err(|e| {
                    RpcError::transport(None, format!("cannot spawn dispatch thread: {e}"))
                })?
        };
        Ok(Self {
            ctx,
            dispatcher: Some(dispatcher),
        })
    }

    pub fn context(&self) -> &RpcContext {
        &self.ctx
    }

    pub fn rank(&self) -> Rank {
        self.ctx.rank()
    }

    pub fn size(&self) -> usize {
        self.ctx.size()
    }

    pub fn topology(&self) -> &TreeTopology {
        self.ctx.topology()
    }

    pub fn registry(&self) -> &ChannelRegistry {
        self.ctx.registry()
    }

    /// Register a channel and deliver any traffic that reached `id` before
    /// this call.
    ///
    /// # Errors
    /// `ChannelInUse` if `id` is taken. Registration errors are fatal for
    /// the node.
    pub fn register(&self, id: ChannelId, handler: Arc<dyn Channel>) -> Result<(), RpcError> {
        let mut claim = self
            .ctx
            .registry()
            .register(id, Arc::clone(&handler))
            .map_err(|e| self.ctx.fatal(e))?;
        for msg in claim.take_early() {
            channel::deliver(&self.ctx, handler.as_ref(), msg).map_err(|e| self.ctx.fatal(e))?;
        }
        drop(claim);
        self.ctx.flush()
    }

    /// Remove a registration made with [`register`](Self::register).
    ///
    /// # Errors
    /// `UnknownChannel` if `id` is not registered. Like a failed
    /// registration, this is fatal for the node.
    pub fn unregister(&self, id: ChannelId) -> Result<(), RpcError> {
        self.ctx
            .registry()
            .unregister(id)
            .map_err(|e| self.ctx.fatal(e))
    }

    /// Queue `payload` for `dest` on `channel`. Fire-and-forget: it leaves on
    /// the next [`flush`](Self::flush) or collective.
    pub fn send(
        &self,
        dest: Rank,
        channel: ChannelId,
        payload: impl Into<Bytes>,
    ) -> Result<(), RpcError> {
        self.ctx.send(dest, channel, payload.into())
    }

    pub fn flush(&self) -> Result<(), RpcError> {
        self.ctx.flush()
    }

    /// Block until every rank of the cluster has called `barrier` with the same
    /// `channel`.
    ///
    /// The id is free again once this returns, so the next barrier may reuse
    /// it. There is no timeout: a peer that never arrives blocks every rank.
    ///
    /// # Errors
    /// Only fatal errors: a protocol violation, an unknown channel, a
    /// transport failure, or `ChannelInUse` if `channel` is already registered.
    pub fn barrier(&self, channel: ChannelId) -> Result<(), RpcError> {
        // Everything queued before the barrier must leave ahead of its signals.
        self.ctx.flush().map_err(|e| self.ctx.fatal(e))?;
        let round = self.ctx.next_round(channel);
        let barrier = Arc::new(BarrierChannel::new(
            channel,
            round,
            self.rank(),
            self.topology(),
        ));
        barrier.run(&self.ctx)
    }

    /// Stop the dispatch loop and report how it ended.
    ///
    /// # Errors
    /// The fatal error that stopped the loop, or `UnknownChannel` for
    /// deferred traffic that no registration ever claimed.
    pub fn shutdown(mut self) -> Result<DispatchStats, RpcError> {
        self.stop()
    }

    fn stop(&mut self) -> Result<DispatchStats, RpcError> {
        self.ctx.transport().close();
        let joined = match self.dispatcher.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| RpcError::DispatcherPanicked)
                .and_then(|outcome| outcome),
            None => Err(RpcError::DispatcherStopped),
        };
        let flushed = self.ctx.flush();
        let stats = joined?;
        if let Some(err) = self.ctx.registry().poisoned() {
            return Err(err);
        }
        flushed?;

        let leftover = self.ctx.registry().take_backlog();
        for msg in &leftover {
            log::warn!(
                "rank {}: message from {} on channel {} was never claimed",
                self.rank(),
                msg.sender,
                msg.channel
            );
        }
        // Nothing will ever be delivered again; release whoever still waits.
        for ch in self.ctx.registry().poison(&RpcError::DispatcherStopped) {
            ch.fail(&RpcError::DispatcherStopped);
        }
        match leftover.first() {
            Some(msg) => Err(RpcError::UnknownChannel(msg.channel)),
            None => Ok(stats),
        }
    }
}

impl Drop for Rpc {
    fn drop(&mut self) {
        if self.dispatcher.is_some() {
            if let Err(err) = self.stop() {
                log::warn!("rank {}: dispatch loop ended with: {err}", self.rank());
            }
        }
    }
}
