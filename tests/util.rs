#![allow(dead_code)]
use std::time::{Duration, Instant};
use tree_rpc::prelude::*;

pub const C: ChannelId = ChannelId::new(42);

/// Start one node per rank of `cluster`.
pub fn start_nodes(cluster: &LocalCluster, cfg: &RpcConfig) -> Vec<Rpc> {
    cluster
        .transports()
        .into_iter()
        .map(|t| Rpc::start(t, cfg.clone()).expect("node start"))
        .collect()
}

/// Every node calls `barrier(channel)` on its own thread; results by rank.
pub fn barrier_all(nodes: &[Rpc], channel: ChannelId) -> Vec<Result<(), RpcError>> {
    std::thread::scope(|s| {
        let calls: Vec<_> = nodes
            .iter()
            .map(|node| s.spawn(move || node.barrier(channel)))
            .collect();
        calls
            .into_iter()
            .map(|call| call.join().expect("barrier thread panicked"))
            .collect()
    })
}

pub fn shutdown_all(nodes: Vec<Rpc>) -> Vec<Result<DispatchStats, RpcError>> {
    nodes.into_iter().map(Rpc::shutdown).collect()
}

/// Spin until `cond` holds, failing the test after a few seconds.
pub fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(1));
    }
}

pub fn wait_registered(node: &Rpc, channel: ChannelId) {
    eventually("channel registration", || {
        node.registry().is_registered(channel)
    });
}
