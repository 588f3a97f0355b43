//! Cluster-wide certification behavior over the in-process rig.

use bytes::Bytes;

use gcs_replication::core::{Gno, GnoSet, MemberStatus};
use gcs_replication::gcs::{GcsCommunication, Payload};
use gcs_replication::latch::CertificationOutcome;

use crate::fixtures::rig::{Cluster, NodeRig, member_uuid, wait_until};

fn item(raw: &'static [u8]) -> Bytes {
    Bytes::from_static(raw)
}

pub(crate) fn form_two_member_cluster() -> (Cluster, NodeRig, NodeRig) {
    let cluster = Cluster::new();
    let a = cluster.start_node(1, cluster.config());
    assert_eq!(a.plugin.registry().local_status(), MemberStatus::Online);

    let b = cluster.start_node(2, cluster.config());
    wait_until("the joiner to come online everywhere", || {
        a.plugin.registry().status_of(member_uuid(2)) == Some(MemberStatus::Online)
            && b.plugin.registry().local_status() == MemberStatus::Online
    });
    (cluster, a, b)
}

/// Runs the first-writer-wins exchange: T1 commits on A under gno 1, then
/// T2 from B with the same stale snapshot is rolled back everywhere.
pub(crate) fn run_conflicting_pair(a: &NodeRig, b: &NodeRig) {
    a.plugin.begin_local_transaction(1).expect("register T1");
    a.plugin
        .broadcast_transaction(1, Gno::ZERO, vec![item(b"x")], item(b"update x"))
        .expect("broadcast T1");
    match a.plugin.wait_for_certification(1).expect("T1 outcome") {
        CertificationOutcome::Commit(gid) => assert_eq!(gid.gno, Gno::new(1)),
        CertificationOutcome::Rollback => panic!("T1 must certify positively"),
    }

    wait_until("both members to certify T1", || {
        a.plugin.certifier().positive_certified() == 1
            && b.plugin.certifier().positive_certified() == 1
    });
    wait_until("the remote member to execute T1", || {
        b.executed().contains(Gno::new(1))
    });

    b.plugin.begin_local_transaction(2).expect("register T2");
    b.plugin
        .broadcast_transaction(2, Gno::ZERO, vec![item(b"x")], item(b"update x stale"))
        .expect("broadcast T2");
    let outcome = b.plugin.wait_for_certification(2).expect("T2 outcome");
    assert_eq!(outcome, CertificationOutcome::Rollback);

    wait_until("both members to reject T2", || {
        a.plugin.certifier().negative_certified() == 1
            && b.plugin.certifier().negative_certified() == 1
    });
}

#[test]
fn conflicting_writers_certify_first_positive_second_negative() {
    let (_cluster, a, b) = form_two_member_cluster();
    run_conflicting_pair(&a, &b);

    // No sequence number was consumed by the negative certification.
    assert_eq!(
        a.plugin.certifier().certification_snapshot().next_seqno,
        Gno::new(2)
    );
    assert_eq!(
        b.plugin.certifier().certification_snapshot().next_seqno,
        Gno::new(2)
    );
    assert!(!a.executed().contains(Gno::new(2)));
}

#[test]
fn advanced_snapshot_certifies_after_conflict() {
    let (_cluster, a, b) = form_two_member_cluster();
    run_conflicting_pair(&a, &b);

    a.plugin.begin_local_transaction(3).expect("register T3");
    a.plugin
        .broadcast_transaction(3, Gno::new(1), vec![item(b"x")], item(b"update x again"))
        .expect("broadcast T3");
    match a.plugin.wait_for_certification(3).expect("T3 outcome") {
        CertificationOutcome::Commit(gid) => assert_eq!(gid.gno, Gno::new(2)),
        CertificationOutcome::Rollback => panic!("T3 carries a fresh snapshot"),
    }

    wait_until("both members to certify T3", || {
        a.plugin.certifier().positive_certified() == 2
            && b.plugin.certifier().positive_certified() == 2
    });
    wait_until("the remote member to execute T3", || {
        b.executed().contains(Gno::new(2))
    });
}

#[test]
fn stable_set_intersection_prunes_the_certification_db() {
    let (cluster, a, b) = form_two_member_cluster();
    run_conflicting_pair(&a, &b);

    // Advance x to gno 2 first, as in the snapshot-advance exchange.
    a.plugin.begin_local_transaction(3).expect("register T3");
    a.plugin
        .broadcast_transaction(3, Gno::new(1), vec![item(b"x")], item(b"update x again"))
        .expect("broadcast T3");
    a.plugin.wait_for_certification(3).expect("T3 outcome");
    wait_until("both members to certify T3", || {
        b.plugin.certifier().positive_certified() == 2
    });
    assert_eq!(a.plugin.certifier().db_size(), 1);

    let mut executed_a = GnoSet::new(cluster.group);
    executed_a.add_range(Gno::new(1), Gno::new(2));
    let mut executed_b = GnoSet::new(cluster.group);
    executed_b.add_range(Gno::new(1), Gno::new(3));

    a.gcs
        .broadcast(Payload::CertificationEvent, Bytes::from(executed_a.encode()))
        .expect("broadcast executed set of A");
    b.gcs
        .broadcast(Payload::CertificationEvent, Bytes::from(executed_b.encode()))
        .expect("broadcast executed set of B");

    wait_until("the certification db entry to be collected", || {
        a.plugin.certifier().db_size() == 0 && b.plugin.certifier().db_size() == 0
    });

    let stable = a.plugin.certifier().stable_set();
    assert!(stable.contains(Gno::new(1)));
    assert!(stable.contains(Gno::new(2)));
    assert!(!stable.contains(Gno::new(3)));
}
