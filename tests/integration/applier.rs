//! Applier lifecycle driven directly: suspension, ordering, termination.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use uuid::Uuid;

use gcs_replication::applier::{ApplierError, ApplierModule, Packet};
use gcs_replication::certifier::Certifier;
use gcs_replication::config::{BroadcastFailurePolicy, PipelineSpec};
use gcs_replication::core::{EventKind, encode_event};
use gcs_replication::engine::APPLIER_CHANNEL;
use gcs_replication::latch::CertificationLatch;
use gcs_replication::pipeline::PipelineContext;
use gcs_replication::stats::ApplierState;

use crate::fixtures::rig::{ArcEngine, FakeEngine, NullControl, member_uuid, wait_until};

struct ApplierRig {
    applier: ApplierModule,
    engine: Arc<FakeEngine>,
}

fn applier_rig() -> ApplierRig {
    let sid = Uuid::from_bytes([0xC1; 16]);
    let engine = FakeEngine::new(sid);
    let applier = ApplierModule::new(Arc::new(NullControl));
    applier
        .setup(
            PipelineSpec::Standard,
            PipelineContext {
                certifier: Arc::new(Certifier::new(
                    Duration::from_secs(60),
                    BroadcastFailurePolicy::Ignore,
                )),
                latch: Arc::new(CertificationLatch::new()),
                engine: ArcEngine::wrap(&engine),
                local_uuid: member_uuid(1),
            },
            sid,
            false,
            Duration::from_secs(10),
        )
        .expect("applier setup");
    applier.start().expect("applier start");
    ApplierRig { applier, engine }
}

fn passthrough_packet(body: &'static [u8]) -> Packet {
    Packet::Data(encode_event(&EventKind::Passthrough(Bytes::from_static(
        body,
    ))))
}

#[test]
fn suspend_then_resume_preserves_queue_order() {
    let rig = applier_rig();
    rig.applier.suspend();
    let abort = AtomicBool::new(false);
    rig.applier
        .wait_for_complete_suspension(&abort)
        .expect("complete suspension");
    assert_eq!(rig.applier.state(), ApplierState::Suspended);

    let queue = rig.applier.queue();
    queue.push(passthrough_packet(b"first"));
    queue.push(passthrough_packet(b"second"));
    queue.push(passthrough_packet(b"third"));
    assert_eq!(rig.applier.queue_size(), 3);

    rig.applier.awake();
    wait_until("the queue to drain after resume", || {
        rig.applier.queue_size() == 0
    });
    wait_until("the applier to report running", || {
        rig.applier.state() == ApplierState::Running
    });

    let log = rig.engine.channel(APPLIER_CHANNEL).log();
    let bodies: Vec<EventKind> = log
        .iter()
        .map(|frame| gcs_replication::core::decode_event(frame).expect("frame"))
        .collect();
    assert_eq!(
        bodies,
        vec![
            EventKind::Passthrough(Bytes::from_static(b"first")),
            EventKind::Passthrough(Bytes::from_static(b"second")),
            EventKind::Passthrough(Bytes::from_static(b"third")),
        ]
    );

    rig.applier
        .terminate(Duration::from_secs(4))
        .expect("terminate");
}

#[test]
fn terminate_times_out_on_a_slow_handler_and_succeeds_later() {
    let rig = applier_rig();
    rig.engine.set_slow_apply(Some(Duration::from_secs(6)));

    rig.applier.queue().push(passthrough_packet(b"slow"));
    // Give the thread time to enter the slow apply call.
    thread::sleep(Duration::from_millis(200));

    let error = rig
        .applier
        .terminate(Duration::from_secs(4))
        .expect_err("the thread is stuck in the handler");
    assert!(matches!(error, ApplierError::StopTimeout));

    rig.engine.set_slow_apply(None);
    rig.applier
        .terminate(Duration::from_secs(10))
        .expect("terminate with a larger budget");
    assert_eq!(rig.applier.state(), ApplierState::Stopped);
}

#[test]
fn terminate_twice_returns_ok_the_second_time() {
    let rig = applier_rig();
    rig.applier
        .terminate(Duration::from_secs(4))
        .expect("first terminate");
    rig.applier
        .terminate(Duration::from_secs(4))
        .expect("second terminate");
}

#[test]
fn undecodable_packet_is_fatal_for_the_applier_thread() {
    let rig = applier_rig();
    rig.applier
        .queue()
        .push(Packet::Data(Bytes::from_static(b"\x05\x00\x00")));

    wait_until("the applier to stop on the invariant violation", || {
        rig.applier.state() == ApplierState::Error
    });
    rig.applier
        .terminate(Duration::from_secs(4))
        .expect("terminate after failure");
}
