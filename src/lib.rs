#![cfg_attr(docsrs, feature(doc_cfg))]
//! # tree-rpc
//!
//! tree-rpc lets every process of a fixed-size cluster block until all of its
//! peers have reached the same logical point. The barrier runs over a rank
//! tree instead of an all-to-all exchange, on top of a small dispatch layer
//! that demultiplexes inbound messages to stateful handlers by channel id.
//!
//! ## Features
//! - Deterministic k-ary rank tree ([`topology::TreeTopology`]), binary by default
//! - Guarded channel registry with deferral of traffic that arrives early
//! - Tree barrier moving exactly `2·(N−1)` messages per collective
//! - Pluggable transports: in-process threads, a single rank, or MPI
//!   (feature `mpi-support`)
//!
//! ## Usage
//!
//! ```
//! use tree_rpc::prelude::*;
//!
//! let cluster = LocalCluster::new(4);
//! let nodes: Vec<Rpc> = cluster
//!     .transports()
//!     .into_iter()
//!     .map(|t| Rpc::start(t, RpcConfig::default()))
//!     .collect::<Result<_, _>>()?;
//!
//! std::thread::scope(|s| {
//!     let calls: Vec<_> = nodes
//!         .iter()
//!         .map(|node| s.spawn(move || node.barrier(ChannelId::new(42))))
//!         .collect();
//!     calls
//!         .into_iter()
//!         .try_for_each(|call| call.join().expect("barrier thread panicked"))
//! })?;
//!
//! for node in nodes {
//!     node.shutdown()?;
//! }
//! # Ok::<(), RpcError>(())
//! ```
//!
//! ## Failure model
//!
//! Collectives assume a reliable transport and well-behaved peers. Protocol
//! violations, unknown channels and transport failures are fatal for the node
//! (see [`config::FatalAction`]); a peer that never arrives blocks the barrier
//! on every rank forever.

pub mod channel;
pub mod collective;
pub mod config;
pub mod debug_invariants;
pub mod dispatch;
pub mod rpc;
pub mod rpc_error;
pub mod topology;
pub mod transport;

pub use debug_invariants::DebugInvariants;

/// A convenient prelude to import the most-used traits & types:
pub mod prelude {
    pub use crate::channel::registry::ChannelRegistry;
    pub use crate::channel::{Channel, ChannelId, Transaction, TransactionRef};
    pub use crate::collective::BarrierChannel;
    pub use crate::config::{FatalAction, RpcConfig, UnclaimedPolicy};
    pub use crate::debug_invariants::DebugInvariants;
    pub use crate::dispatch::DispatchStats;
    pub use crate::rpc::{Rpc, RpcContext};
    pub use crate::rpc_error::RpcError;
    pub use crate::topology::{Rank, TreeTopology};
    pub use crate::transport::local::LocalCluster;
    #[cfg(feature = "mpi-support")]
    pub use crate::transport::mpi::MpiTransport;
    pub use crate::transport::solo::SoloTransport;
    pub use crate::transport::{Message, Transport};
}
