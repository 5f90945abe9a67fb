//! Collective operations built on channels.
//!
//! Every process in the cluster must take part in a collective, with the same
//! channel id, before any of them may return.

pub mod barrier;

pub use barrier::{
    BarrierChannel, BarrierPhase, BarrierTransaction, round_signal, signal_round,
};
