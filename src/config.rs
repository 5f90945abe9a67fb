//! Node configuration.
//!
//! Every field except `dispatcher_name` must agree across the cluster: two
//! processes with different `arity` compute different trees and their barriers
//! deadlock or fail with a protocol violation.

use crate::rpc_error::RpcError;
use crate::topology::DEFAULT_ARITY;
use serde::{Deserialize, Serialize};

/// What the dispatch loop does with a message for a channel id that has no
/// registered handler.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnclaimedPolicy {
    /// Park the message until the id is registered, then deliver it to that
    /// registration in arrival order. A peer may legitimately enter a
    /// collective before this process does. The handler decides whether a
    /// replayed message belongs to it: a barrier rejects anything that is not
    /// a signal of its own round with `UnknownChannel`.
    #[default]
    Defer,
    /// Fail with `UnknownChannel` immediately. Only sound when every process
    /// registers its channels before any peer can send on them.
    Reject,
}

/// What happens after the dispatch loop hits a fatal error.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FatalAction {
    /// Stop dispatching, fail every registered channel with the error, and
    /// return it from the dispatch thread.
    #[default]
    Propagate,
    /// Log the error and abort the process.
    Abort,
}

/// Configuration for an [`Rpc`](crate::rpc::Rpc) node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Branching factor of the rank tree.
    pub arity: usize,
    pub unclaimed: UnclaimedPolicy,
    pub on_fatal: FatalAction,
    /// Prefix of the dispatch thread's name; the rank is appended.
    pub dispatcher_name: String,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            arity: DEFAULT_ARITY,
            unclaimed: UnclaimedPolicy::default(),
            on_fatal: FatalAction::default(),
            dispatcher_name: "rpc-dispatch".to_string(),
        }
    }
}

impl RpcConfig {
    /// Check the values that cannot be caught by the type system.
    pub fn validate(&self) -> Result<(), RpcError> {
        if self.arity == 0 {
            return Err(RpcError::InvalidConfig("arity must be at least 1".into()));
        }
        if self.dispatcher_name.is_empty() {
            return Err(RpcError::InvalidConfig(
                "dispatcher_name must not be empty".into(),
            ));
        }
        Ok(())
    }
}
