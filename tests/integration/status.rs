//! Lifecycle edges and the structured status record.

use bytes::Bytes;

use gcs_replication::core::{Gno, MemberStatus};
use gcs_replication::gcs::GcsControl;
use gcs_replication::latch::CertificationOutcome;
use gcs_replication::stats::ApplierState;

use crate::fixtures::rig::{Cluster, member_uuid, wait_until};

#[test]
fn status_record_reflects_the_running_group() {
    let cluster = Cluster::new();
    let a = cluster.start_node(1, cluster.config());

    let status = a.plugin.status();
    assert!(status.running);
    assert_eq!(status.group_name, cluster.group.to_string());
    assert_eq!(status.view_id, 1);
    assert_eq!(status.members.len(), 1);
    assert_eq!(status.members[0].status, MemberStatus::Online);
    assert_eq!(status.applier_state, ApplierState::Running);
    assert_eq!(status.last_certified_gid, None);

    a.plugin.begin_local_transaction(7).expect("register");
    a.plugin
        .broadcast_transaction(
            7,
            Gno::ZERO,
            vec![Bytes::from_static(b"k")],
            Bytes::from_static(b"payload"),
        )
        .expect("broadcast");
    assert_eq!(
        a.plugin.wait_for_certification(7).expect("outcome"),
        CertificationOutcome::Commit(gcs_replication::core::Gid::new(
            cluster.group,
            Gno::new(1)
        ))
    );

    wait_until("the queue to drain", || a.plugin.status().queue_depth == 0);
    let status = a.plugin.status();
    assert_eq!(status.positively_certified, 1);
    assert_eq!(status.negatively_certified, 0);
    assert_eq!(status.certification_db_size, 1);
    assert_eq!(
        status.last_certified_gid,
        Some(format!("{}:1", cluster.group))
    );
    assert!(status.counters.messages_sent >= 1);
    assert!(status.counters.messages_received >= 1);
    assert!(status.counters.view_changes >= 1);

    // The originator committed and executed under its gid.
    assert!(a.executed().contains(Gno::new(1)));
    assert_eq!(a.engine.outcomes().len(), 1);

    let rendered = status.to_json();
    assert_eq!(rendered["running"], true);
    assert_eq!(rendered["positively_certified"], 1);
}

#[test]
fn stop_is_idempotent_and_clears_the_running_state() {
    let cluster = Cluster::new();
    let a = cluster.start_node(1, cluster.config());
    assert!(a.plugin.is_running());

    a.plugin.stop().expect("stop");
    assert!(!a.plugin.is_running());
    assert_eq!(a.plugin.status().applier_state, ApplierState::NotStarted);

    // A second stop finds nothing to do.
    a.plugin.stop().expect("second stop");
}

#[test]
fn start_is_deferred_until_the_engine_is_ready() {
    let cluster = Cluster::new();
    let a = cluster.build_node(1, cluster.config());
    a.engine.set_ready(false);

    a.plugin.start().expect("deferred start");
    assert!(!a.plugin.is_running());
    assert!(!a.gcs.belongs_to_group());

    a.engine.set_ready(true);
    a.plugin.on_engine_ready().expect("completed start");
    assert!(a.plugin.is_running());
    wait_until("the bootstrap member to come online", || {
        a.plugin.registry().local_status() == MemberStatus::Online
    });
}

#[test]
fn double_start_reports_already_running() {
    let cluster = Cluster::new();
    let a = cluster.start_node(1, cluster.config());
    assert!(a.plugin.start().is_err());
    a.plugin.stop().expect("stop");
}

#[test]
fn members_learn_each_other_through_view_data_exchange() {
    let cluster = Cluster::new();
    let a = cluster.start_node(1, cluster.config());
    let b = cluster.start_node(2, cluster.config());

    wait_until("the joiner to come online everywhere", || {
        a.plugin.registry().status_of(member_uuid(2)) == Some(MemberStatus::Online)
    });

    // Both registries agree on the membership and statuses.
    for node in [&a, &b] {
        let members = node.plugin.registry().members();
        assert_eq!(members.len(), 2);
        assert!(
            members
                .iter()
                .all(|member| member.status == MemberStatus::Online)
        );
    }
}
