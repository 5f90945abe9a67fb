mod util;
use util::*;

use std::sync::Arc;
use std::time::Duration;
use tree_rpc::collective::round_signal;
use tree_rpc::prelude::*;

fn reject() -> RpcConfig {
    RpcConfig {
        unclaimed: UnclaimedPolicy::Reject,
        ..Default::default()
    }
}

#[test]
fn message_for_a_finished_barrier_is_unknown_channel() {
    let cluster = LocalCluster::new(2);
    let nodes = start_nodes(&cluster, &reject());

    std::thread::scope(|s| {
        let root = s.spawn(|| nodes[0].barrier(C));
        // Under `Reject` the root must be listening before the leaf notifies.
        wait_registered(&nodes[0], C);
        nodes[1].barrier(C).unwrap();
        root.join().unwrap().unwrap();
    });
    assert!(!nodes[0].registry().is_registered(C));

    nodes[1].send(0, C, Vec::new()).unwrap();
    nodes[1].flush().unwrap();
    eventually("rank 0 to fail", || nodes[0].registry().poisoned().is_some());

    let mut results = shutdown_all(nodes).into_iter();
    assert_eq!(results.next().unwrap(), Err(RpcError::UnknownChannel(C)));
    assert!(results.next().unwrap().is_ok());
}

#[test]
fn unclaimed_traffic_surfaces_as_unknown_channel_at_shutdown() {
    let cluster = LocalCluster::new(2);
    let nodes = start_nodes(&cluster, &RpcConfig::default());
    for res in barrier_all(&nodes, C) {
        res.unwrap();
    }

    nodes[1].send(0, C, Vec::new()).unwrap();
    nodes[1].flush().unwrap();
    eventually("stray message to be parked", || {
        nodes[0].registry().deferred() == 1
    });

    let mut results = shutdown_all(nodes).into_iter();
    assert_eq!(results.next().unwrap(), Err(RpcError::UnknownChannel(C)));
    assert!(results.next().unwrap().is_ok());
}

#[test]
fn stray_message_is_not_counted_by_the_next_barrier_on_the_id() {
    let cluster = LocalCluster::new(3);
    let nodes = start_nodes(&cluster, &RpcConfig::default());
    for res in barrier_all(&nodes, C) {
        res.unwrap();
    }

    // A leftover empty message on the finished id, parked by rank 0.
    nodes[2].send(0, C, Vec::new()).unwrap();
    nodes[2].flush().unwrap();
    eventually("stray message to be parked", || {
        nodes[0].registry().deferred() == 1
    });

    // Ranks 0 and 1 enter the next barrier on `C`; rank 2 never does.
    std::thread::scope(|s| {
        let leaf = s.spawn(|| nodes[1].barrier(C));
        assert_eq!(nodes[0].barrier(C), Err(RpcError::UnknownChannel(C)));
        std::thread::sleep(Duration::from_millis(50));
        assert!(!leaf.is_finished(), "rank 1 left a barrier rank 2 never entered");

        // Release rank 1 by hand so the test can finish.
        nodes[0].send(1, C, round_signal(1)).unwrap();
        nodes[0].flush().unwrap();
        assert_eq!(leaf.join().unwrap(), Ok(()));
    });

    let results = shutdown_all(nodes);
    assert_eq!(results[0], Err(RpcError::UnknownChannel(C)));
    assert!(results[1].is_ok());
    assert!(results[2].is_ok());
}

#[test]
fn stale_round_signal_is_unknown_channel_when_replayed() {
    let cluster = LocalCluster::new(2);
    let nodes = start_nodes(&cluster, &RpcConfig::default());
    for res in barrier_all(&nodes, C) {
        res.unwrap();
    }

    // A well-formed notify, but for the barrier that already finished.
    nodes[1].send(0, C, round_signal(0)).unwrap();
    nodes[1].flush().unwrap();
    eventually("stale notify to be parked", || {
        nodes[0].registry().deferred() == 1
    });
    assert_eq!(nodes[0].barrier(C), Err(RpcError::UnknownChannel(C)));

    let mut results = shutdown_all(nodes).into_iter();
    assert_eq!(results.next().unwrap(), Err(RpcError::UnknownChannel(C)));
    assert!(results.next().unwrap().is_ok());
}

#[test]
fn repeated_notify_from_a_child_is_a_protocol_violation() {
    let cluster = LocalCluster::new(3);
    let nodes = start_nodes(&cluster, &RpcConfig::default());
    let chan = ChannelId::new(7);

    let outcome = std::thread::scope(|s| {
        let root = s.spawn(|| nodes[0].barrier(chan));
        wait_registered(&nodes[0], chan);
        nodes[1].send(0, chan, round_signal(0)).unwrap();
        nodes[1].send(0, chan, round_signal(0)).unwrap();
        nodes[1].flush().unwrap();
        root.join().unwrap()
    });

    let expected = RpcError::ProtocolViolation {
        channel: chan,
        sender: 1,
        phase: "waiting for children",
        received: 1,
    };
    assert_eq!(outcome, Err(expected.clone()));
    // The node is poisoned: nothing more can be registered on it.
    assert_eq!(nodes[0].barrier(ChannelId::new(8)), Err(expected.clone()));

    let results = shutdown_all(nodes);
    assert_eq!(results[0], Err(expected));
    assert!(results[1].is_ok());
    assert!(results[2].is_ok());
}

#[test]
fn release_from_a_non_parent_is_a_protocol_violation() {
    let cluster = LocalCluster::new(3);
    let nodes = start_nodes(&cluster, &RpcConfig::default());
    let chan = ChannelId::new(9);

    let outcome = std::thread::scope(|s| {
        let leaf = s.spawn(|| nodes[1].barrier(chan));
        wait_registered(&nodes[1], chan);
        nodes[2].send(1, chan, round_signal(0)).unwrap();
        nodes[2].flush().unwrap();
        leaf.join().unwrap()
    });

    assert_eq!(
        outcome,
        Err(RpcError::ProtocolViolation {
            channel: chan,
            sender: 2,
            phase: "waiting for parent release",
            received: 0,
        })
    );

    eventually("leaf notify to reach the root", || {
        nodes[0].registry().deferred() == 1
    });
    let results = shutdown_all(nodes);
    // The root never entered the barrier, so the leaf's notify was never claimed.
    assert_eq!(results[0], Err(RpcError::UnknownChannel(chan)));
    assert!(matches!(
        results[1],
        Err(RpcError::ProtocolViolation { sender: 2, .. })
    ));
    assert!(results[2].is_ok());
}

struct Inert;

impl Channel for Inert {
    fn transaction_for(&self, msg: &Message) -> Result<TransactionRef, RpcError> {
        Err(RpcError::UnknownChannel(msg.channel))
    }
}

#[test]
fn barrier_on_a_busy_channel_is_channel_in_use() {
    let node = Rpc::start(SoloTransport::new(), RpcConfig::default()).unwrap();
    let busy = ChannelId::new(5);
    node.register(busy, Arc::new(Inert)).unwrap();

    assert_eq!(node.barrier(busy), Err(RpcError::ChannelInUse(busy)));
    assert_eq!(
        node.barrier(ChannelId::new(6)),
        Err(RpcError::ChannelInUse(busy))
    );
    assert_eq!(node.shutdown(), Err(RpcError::ChannelInUse(busy)));
}

#[test]
fn invalid_configuration_is_rejected_at_start() {
    let cfg = RpcConfig {
        arity: 0,
        ..Default::default()
    };
    assert!(matches!(
        Rpc::start(SoloTransport::new(), cfg),
        Err(RpcError::InvalidConfig(_))
    ));

    let cfg = RpcConfig {
        dispatcher_name: String::new(),
        ..Default::default()
    };
    assert!(matches!(
        Rpc::start(SoloTransport::new(), cfg),
        Err(RpcError::InvalidConfig(_))
    ));
}

#[test]
fn sending_outside_the_cluster_fails() {
    let cluster = LocalCluster::new(2);
    let nodes = start_nodes(&cluster, &RpcConfig::default());
    assert_eq!(
        nodes[0].send(2, C, Vec::new()),
        Err(RpcError::InvalidRank { rank: 2, size: 2 })
    );
    for res in shutdown_all(nodes) {
        res.unwrap();
    }
}
