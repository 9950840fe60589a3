//! Recovery scenarios: stale tablet routes and transport failures must be
//! retried without violating atomicity.

mod common;

use common::{MasterReply, TestCluster};
use strata_client::wire::{Status, TxDecision, Vote};
use strata_client::Config;

#[test]
fn stale_route_is_flushed_and_the_new_owner_prepares() {
    let cluster = TestCluster::new();
    let master_a = cluster.add_master(1, "master-a");
    let master_b = cluster.transport.master("master-b");
    master_a.enqueue(MasterReply::Prepare {
        status: Status::UnknownTablet,
        vote: Vote::Abort,
    });
    let client = cluster.client();

    let tx = client.begin();
    tx.write(1, b"a", b"x").unwrap();
    let task = tx.task();

    task.perform_task(); // INIT, then prepare sent to the stale owner
    cluster.deliver(); // UNKNOWN_TABLET comes back
    assert_eq!(cluster.directory.locate_count(), 1);

    // The tablet moved while the response was in flight.
    cluster.directory.set_route(1, "master-b");

    task.perform_task(); // retry: flush route, re-resolve, resend
    cluster.deliver();
    while !task.is_done() {
        task.perform_task();
        cluster.deliver();
    }

    assert_eq!(task.status(), Status::Ok);
    assert_eq!(task.decision(), TxDecision::Commit);
    assert_eq!(cluster.directory.locate_count(), 2);
    assert_eq!(master_a.prepares().len(), 1);
    assert_eq!(master_b.prepares().len(), 1);
    // Only the new owner hears the decision, and the session to the old
    // owner was never flushed: the master was healthy, just wrong.
    assert!(master_a.decisions().is_empty());
    assert_eq!(master_b.decisions().len(), 1);
    assert!(cluster.transport.flushed_sessions().is_empty());
}

#[test]
fn transport_error_mid_batch_reverts_only_that_batch() {
    let cluster = TestCluster::new();
    let master = cluster.add_master(1, "master-a");
    // The first request dies at the transport; everything after succeeds.
    master.enqueue(MasterReply::TransportFail);
    let client = cluster.client_with(Config {
        max_objects_per_rpc: 2,
        ..Config::default()
    });

    let tx = client.begin();
    for key in [b"a", b"b", b"c", b"d"] {
        tx.write(1, key, b"v").unwrap();
    }
    let task = tx.task();

    task.perform_task(); // sends the first batch (participants 0..2)
    task.perform_task(); // pipelines the second batch (participants 2..4)
    cluster.deliver(); // first batch fails, second batch votes commit
    task.perform_task(); // rewind 0..2 to pending, resend just those two
    cluster.deliver();
    while !task.is_done() {
        task.perform_task();
        cluster.deliver();
    }

    assert_eq!(task.status(), Status::Ok);
    assert_eq!(task.decision(), TxDecision::Commit);

    let prepares = master.prepares();
    // The failed request never reached the master; the second batch and
    // the retried first batch did, in that order.
    assert_eq!(prepares.len(), 2);
    let roster: Vec<u64> = prepares[0].participants.iter().map(|p| p.rpc_id).collect();
    assert_eq!(roster.len(), 4);
    let first_seen: Vec<u64> = prepares[0].ops.iter().map(|op| op.rpc_id).collect();
    let second_seen: Vec<u64> = prepares[1].ops.iter().map(|op| op.rpc_id).collect();
    assert_eq!(first_seen, roster[2..4].to_vec());
    assert_eq!(second_seen, roster[0..2].to_vec());

    // The broken session was dropped exactly once.
    assert_eq!(cluster.transport.flushed_sessions(), vec!["master-a"]);

    let decisions = master.decisions();
    assert_eq!(decisions.len(), 2);
    assert!(decisions.iter().all(|d| d.header.decision == TxDecision::Commit));
    assert_eq!(
        decisions.iter().map(|d| d.participants.len()).sum::<usize>(),
        4
    );
}

#[test]
fn decision_phase_transport_error_is_retried() {
    let cluster = TestCluster::new();
    let master = cluster.add_master(1, "master-a");
    master.enqueue(MasterReply::Prepare {
        status: Status::Ok,
        vote: Vote::Commit,
    });
    master.enqueue(MasterReply::TransportFail); // first decision attempt
    let client = cluster.client();

    let tx = client.begin();
    tx.write(1, b"a", b"x").unwrap();
    assert_eq!(tx.commit().unwrap(), TxDecision::Commit);

    assert_eq!(master.prepares().len(), 1);
    // Only the retried decision reached the master.
    assert_eq!(master.decisions().len(), 1);
    assert_eq!(master.decisions()[0].header.decision, TxDecision::Commit);
    assert_eq!(cluster.transport.flushed_sessions(), vec!["master-a"]);
}

#[test]
fn repeated_transport_failures_are_retried_without_bound() {
    let cluster = TestCluster::new();
    let master = cluster.add_master(1, "master-a");
    master.enqueue(MasterReply::TransportFail);
    master.enqueue(MasterReply::TransportFail);
    master.enqueue(MasterReply::TransportFail);
    let client = cluster.client();

    let tx = client.begin();
    tx.write(1, b"a", b"x").unwrap();
    assert_eq!(tx.commit().unwrap(), TxDecision::Commit);

    assert_eq!(master.prepares().len(), 1);
    assert_eq!(cluster.transport.flushed_sessions().len(), 3);
    assert_eq!(client.rpc_tracker().outstanding_blocks(), 0);
}
