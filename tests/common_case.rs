//! Common-case scenarios: a reliable network, no suspicion, every proposal commits
//! through the synchronous group of the initial view.

mod common;

use common::Cluster;
use rand::RngCore;
use xpaxos::messages::ClientRequest;
use xpaxos::networking::{Rpc, Transport};
use xpaxos::types::{ReplicaId, SeqNum, Timestamp, CLIENT};

#[test]
fn common_case_null_operation_t1() {
    let cluster = Cluster::new(4, false);

    for _ in 0..5 {
        assert!(cluster.client.propose(&[]));
        cluster.check_invariants();
    }
}

#[test]
fn common_case_null_operation_t3() {
    let cluster = Cluster::new(10, false);

    for _ in 0..5 {
        assert!(cluster.client.propose(&[]));
        cluster.check_invariants();
    }
}

#[test]
fn common_case_1kib_operation_t1() {
    let cluster = Cluster::new(4, false);

    let mut operation = vec![0u8; 1024];
    rand::thread_rng().fill_bytes(&mut operation);

    for _ in 0..1000 {
        assert!(cluster.client.propose(&operation));
    }

    cluster.check_invariants();
    assert_group_progress(&cluster, 1000);
}

#[test]
fn common_case_1kib_operation_t3() {
    let cluster = Cluster::new(10, false);

    let mut operation = vec![0u8; 1024];
    rand::thread_rng().fill_bytes(&mut operation);

    for _ in 0..1000 {
        assert!(cluster.client.propose(&operation));
    }

    cluster.check_invariants();
    assert_group_progress(&cluster, 1000);

    // With nine replicas the protocol tolerates t = 4 faults, so each view's
    // synchronous group has five members.
    let current = cluster.current_view();
    for id in cluster.server_ids() {
        let server = cluster.server(id);
        if server.view() == current && !server.synchronous_group().is_empty() {
            assert_eq!(server.synchronous_group().len(), 5);
        }
    }
}

#[test]
fn duplicate_timestamp_is_ordered_once() {
    let cluster = Cluster::new(4, false);
    let endpoint = cluster.net.endpoint(CLIENT);

    // Replica 1 leads view 1.
    let leader = ReplicaId::new(1);
    let request = ClientRequest::new(Timestamp::init(), vec![42], CLIENT);

    let first = endpoint
        .call(leader, Rpc::Replicate(request.clone()))
        .expect("reliable network delivers the call");
    assert!(first.is_leader);
    assert!(first.success);
    assert_eq!(cluster.server(1).prepare_seq_num(), SeqNum::new(1));
    assert_eq!(cluster.server(1).commit_log().len(), 1);

    // The identical timestamp is acknowledged without growing any log.
    let again = endpoint
        .call(leader, Rpc::Replicate(request.clone()))
        .expect("reliable network delivers the call");
    assert!(again.success);
    assert_eq!(cluster.server(1).prepare_seq_num(), SeqNum::new(1));
    assert_eq!(cluster.server(1).execute_seq_num(), SeqNum::new(1));
    assert_eq!(cluster.server(1).commit_log().len(), 1);

    // Replicas that do not lead the view refuse to order anything.
    let not_leader = endpoint
        .call(ReplicaId::new(2), Rpc::Replicate(request))
        .expect("reliable network delivers the call");
    assert!(!not_leader.is_leader);
    assert!(!not_leader.success);
}

/// Every synchronous group member of the current view must have assigned and executed
/// exactly `expected` sequence numbers.
fn assert_group_progress(cluster: &Cluster, expected: u64) {
    let current = cluster.current_view();
    let mut members = 0;
    for id in cluster.server_ids() {
        let server = cluster.server(id);
        if server.view() == current && server.synchronous_group().contains(&ReplicaId::new(id)) {
            assert_eq!(server.prepare_seq_num(), SeqNum::new(expected));
            assert_eq!(server.execute_seq_num(), SeqNum::new(expected));
            members += 1;
        }
    }
    assert!(members > 0, "no synchronous group member is in view {current}");
}
