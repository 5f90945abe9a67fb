//! One-shot completion signal between the dispatch loop and a blocked caller.

use crate::rpc_error::RpcError;
use parking_lot::{Condvar, Mutex};

/// Single writer, single waiter. The first [`complete`](Completion::complete)
/// wins; later ones are ignored and reported as `false`.
#[derive(Debug, Default)]
pub struct Completion {
    outcome: Mutex<Option<Result<(), RpcError>>>,
    done: Condvar,
}

impl Completion {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the outcome and wake the waiter. Returns `false` if an outcome
    /// was already recorded.
    pub fn complete(&self, outcome: Result<(), RpcError>) -> bool {
        let mut slot = self.outcome.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(outcome);
        self.done.notify_all();
        true
    }

    pub fn is_complete(&self) -> bool {
        self.outcome.lock().is_some()
    }

    /// Block until an outcome is recorded and return it.
    pub fn wait(&self) -> Result<(), RpcError> {
        let mut slot = self.outcome.lock();
        loop {
            if let Some(outcome) = slot.as_ref() {
                return outcome.clone();
            }
            self.done.wait(&mut slot);
        }
    }
}
