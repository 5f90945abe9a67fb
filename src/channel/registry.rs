//! Process-wide table from channel id to handler.
//!
//! The caller thread registers channels and the dispatch thread looks them up
//! and unregisters them, so every operation runs under one lock. Messages that
//! arrive for an id nobody has registered yet are parked here too (see
//! [`UnclaimedPolicy`]), under the same lock, so that a registration and the
//! hand-over of its early traffic are a single atomic step.
//!
//! Each registration carries a gate. [`register`](ChannelRegistry::register)
//! returns it closed inside a [`Claim`]; the dispatch loop passes the gate
//! before every delivery, so nothing newer reaches the channel until the
//! claim's early messages have been replayed and the claim dropped.

use super::{Channel, ChannelId};
use crate::config::UnclaimedPolicy;
use crate::debug_invariants::DebugInvariants;
use crate::rpc_error::RpcError;
use crate::transport::Message;
use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

type Gate = Arc<Mutex<()>>;

struct Registration {
    channel: Arc<dyn Channel>,
    gate: Gate,
}

#[derive(Default)]
struct RegistryState {
    channels: HashMap<ChannelId, Registration>,
    backlog: BTreeMap<ChannelId, Vec<Message>>,
    poisoned: Option<RpcError>,
}

/// Where the dispatch loop should send a message.
pub(crate) enum Route {
    Deliver {
        channel: Arc<dyn Channel>,
        gate: Gate,
        msg: Message,
    },
    Deferred,
}

/// Proof of a fresh registration, holding its gate closed.
///
/// Deliver [`take_early`](Claim::take_early) to the channel, then drop the
/// claim to let the dispatch loop through.
pub struct Claim {
    early: Vec<Message>,
    _gate: ArcMutexGuard<RawMutex, ()>,
}

impl Claim {
    /// Messages that arrived for the id before it was registered, in arrival
    /// order.
    pub fn take_early(&mut self) -> Vec<Message> {
        std::mem::take(&mut self.early)
    }
}

/// Guarded channel table of one node.
pub struct ChannelRegistry {
    state: Mutex<RegistryState>,
    policy: UnclaimedPolicy,
}

impl ChannelRegistry {
    pub fn new(policy: UnclaimedPolicy) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            policy,
        }
    }

    pub fn policy(&self) -> UnclaimedPolicy {
        self.policy
    }

    /// Install `channel` under `id`.
    ///
    /// # Errors
    /// `ChannelInUse` if `id` is registered; the poisoning error if the node
    /// has hit a fatal error.
    pub fn register(&self, id: ChannelId, channel: Arc<dyn Channel>) -> Result<Claim, RpcError> {
        let gate: Gate = Arc::new(Mutex::new(()));
        let held = gate.lock_arc();
        let mut st = self.state.lock();
        if let Some(err) = &st.poisoned {
            return Err(err.clone());
        }
        if st.channels.contains_key(&id) {
            return Err(RpcError::ChannelInUse(id));
        }
        st.channels.insert(id, Registration { channel, gate });
        Ok(Claim {
            early: st.backlog.remove(&id).unwrap_or_default(),
            _gate: held,
        })
    }

    /// Remove the registration of `id`.
    ///
    /// # Errors
    /// `UnknownChannel` if `id` is not registered. Only the owner of a
    /// registration removes it, exactly once, so this is always a bug.
    pub fn unregister(&self, id: ChannelId) -> Result<(), RpcError> {
        self.state
            .lock()
            .channels
            .remove(&id)
            .map(|_| ())
            .ok_or(RpcError::UnknownChannel(id))
    }

    /// Handler registered under `id`.
    pub fn lookup(&self, id: ChannelId) -> Result<Arc<dyn Channel>, RpcError> {
        self.state
            .lock()
            .channels
            .get(&id)
            .map(|reg| Arc::clone(&reg.channel))
            .ok_or(RpcError::UnknownChannel(id))
    }

    pub fn is_registered(&self, id: ChannelId) -> bool {
        self.state.lock().channels.contains_key(&id)
    }

    /// Number of registered channels.
    pub fn len(&self) -> usize {
        self.state.lock().channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of parked messages waiting for a registration.
    pub fn deferred(&self) -> usize {
        self.state.lock().backlog.values().map(Vec::len).sum()
    }

    /// The fatal error this registry was poisoned with, if any.
    pub fn poisoned(&self) -> Option<RpcError> {
        self.state.lock().poisoned.clone()
    }

    /// Resolve the handler for `msg`, or park it per the unclaimed policy.
    pub(crate) fn route(&self, msg: Message) -> Result<Route, RpcError> {
        let mut st = self.state.lock();
        if let Some(reg) = st.channels.get(&msg.channel) {
            return Ok(Route::Deliver {
                channel: Arc::clone(&reg.channel),
                gate: Arc::clone(&reg.gate),
                msg,
            });
        }
        match self.policy {
            UnclaimedPolicy::Defer => {
                st.backlog.entry(msg.channel).or_default().push(msg);
                Ok(Route::Deferred)
            }
            UnclaimedPolicy::Reject => Err(RpcError::UnknownChannel(msg.channel)),
        }
    }

    /// Refuse all future registrations with `err` and hand back every channel
    /// that is still registered so its waiters can be failed. The first poison
    /// sticks.
    pub(crate) fn poison(&self, err: &RpcError) -> Vec<Arc<dyn Channel>> {
        let mut st = self.state.lock();
        st.poisoned.get_or_insert_with(|| err.clone());
        st.channels.drain().map(|(_, reg)| reg.channel).collect()
    }

    /// Drain every parked message, ordered by channel id then arrival.
    pub(crate) fn take_backlog(&self) -> Vec<Message> {
        std::mem::take(&mut self.state.lock().backlog)
            .into_values()
            .flatten()
            .collect()
    }
}

impl DebugInvariants for ChannelRegistry {
    fn debug_assert_invariants(&self) {
        crate::debug_invariants!(self.validate_invariants(), "ChannelRegistry");
    }

    fn validate_invariants(&self) -> Result<(), RpcError> {
        let st = self.state.lock();
        // A registration always claims its backlog, so the two never overlap.
        if let Some(id) = st.backlog.keys().find(|id| st.channels.contains_key(*id)) {
            return Err(RpcError::ChannelInUse(*id));
        }
        if st.backlog.values().any(Vec::is_empty) {
            return Err(RpcError::InvalidConfig("empty backlog entry".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::TransactionRef;

    struct Inert;

    impl Channel for Inert {
        fn transaction_for(&self, msg: &Message) -> Result<TransactionRef, RpcError> {
            Err(RpcError::UnknownChannel(msg.channel))
        }
    }

    fn inert() -> Arc<dyn Channel> {
        Arc::new(Inert)
    }

    const C: ChannelId = ChannelId::new(42);

    #[test]
    fn register_lookup_unregister() {
        let reg = ChannelRegistry::new(UnclaimedPolicy::Reject);
        let mut claim = reg.register(C, inert()).unwrap();
        assert!(claim.take_early().is_empty());
        assert!(reg.is_registered(C));
        assert!(reg.lookup(C).is_ok());
        assert_eq!(reg.len(), 1);
        reg.unregister(C).unwrap();
        assert!(reg.is_empty());
        assert!(matches!(reg.lookup(C), Err(RpcError::UnknownChannel(c)) if c == C));
    }

    #[test]
    fn duplicate_registration_is_channel_in_use() {
        let reg = ChannelRegistry::new(UnclaimedPolicy::Reject);
        let _claim = reg.register(C, inert()).unwrap();
        assert_eq!(
            reg.register(C, inert()).err(),
            Some(RpcError::ChannelInUse(C))
        );
    }

    #[test]
    fn id_is_reusable_after_unregister() {
        let reg = ChannelRegistry::new(UnclaimedPolicy::Reject);
        drop(reg.register(C, inert()).unwrap());
        reg.unregister(C).unwrap();
        assert!(reg.register(C, inert()).is_ok());
    }

    #[test]
    fn unregister_of_absent_id_is_unknown_channel() {
        let reg = ChannelRegistry::new(UnclaimedPolicy::Defer);
        assert_eq!(reg.unregister(C), Err(RpcError::UnknownChannel(C)));
    }

    #[test]
    fn deferred_messages_are_handed_to_the_next_registration() {
        let reg = ChannelRegistry::new(UnclaimedPolicy::Defer);
        for sender in [3, 4] {
            assert!(matches!(
                reg.route(Message::signal(sender, C)).unwrap(),
                Route::Deferred
            ));
        }
        assert_eq!(reg.deferred(), 2);
        reg.validate_invariants().unwrap();

        let mut claim = reg.register(C, inert()).unwrap();
        let senders: Vec<_> = claim.take_early().iter().map(|m| m.sender).collect();
        assert_eq!(senders, vec![3, 4]);
        assert_eq!(reg.deferred(), 0);
        drop(claim);

        assert!(matches!(
            reg.route(Message::signal(5, C)).unwrap(),
            Route::Deliver { msg, .. } if msg.sender == 5
        ));
    }

    #[test]
    fn gate_stays_closed_until_the_claim_is_dropped() {
        let reg = ChannelRegistry::new(UnclaimedPolicy::Defer);
        let claim = reg.register(C, inert()).unwrap();
        let Route::Deliver { gate, .. } = reg.route(Message::signal(1, C)).unwrap() else {
            panic!("registered channel must be routable");
        };
        assert!(gate.try_lock().is_none());
        drop(claim);
        assert!(gate.try_lock().is_some());
    }

    #[test]
    fn reject_policy_fails_unclaimed_traffic() {
        let reg = ChannelRegistry::new(UnclaimedPolicy::Reject);
        assert!(matches!(
            reg.route(Message::signal(1, C)),
            Err(RpcError::UnknownChannel(c)) if c == C
        ));
        assert_eq!(reg.deferred(), 0);
    }

    #[test]
    fn poison_drains_channels_and_blocks_registration() {
        let reg = ChannelRegistry::new(UnclaimedPolicy::Defer);
        drop(reg.register(C, inert()).unwrap());
        let failed = reg.poison(&RpcError::DispatcherStopped);
        assert_eq!(failed.len(), 1);
        assert!(reg.is_empty());
        assert_eq!(reg.poisoned(), Some(RpcError::DispatcherStopped));
        assert!(matches!(
            reg.register(ChannelId::new(1), inert()),
            Err(RpcError::DispatcherStopped)
        ));
        // First poison sticks.
        reg.poison(&RpcError::DispatcherPanicked);
        assert_eq!(reg.poisoned(), Some(RpcError::DispatcherStopped));
    }

    #[test]
    fn backlog_drains_in_channel_order() {
        let reg = ChannelRegistry::new(UnclaimedPolicy::Defer);
        for (sender, id) in [(1, 9), (2, 3), (3, 9)] {
            let _ = reg.route(Message::signal(sender, ChannelId::new(id))).unwrap();
        }
        let left: Vec<_> = reg
            .take_backlog()
            .into_iter()
            .map(|m| (m.channel.as_u16(), m.sender))
            .collect();
        assert_eq!(left, vec![(3, 2), (9, 1), (9, 3)]);
        assert_eq!(reg.deferred(), 0);
    }
}
