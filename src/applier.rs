//! The applier: single serialized consumer of totally-ordered packets.
//!
//! One worker thread pops packets from the synchronized queue and pushes
//! their events through the handler pipeline. Control packets terminate the
//! loop, park it (suspension, used by recovery) or synthesize view-change
//! events.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use uuid::Uuid;

use crate::Transience;
use crate::config::PipelineSpec;
use crate::core::{EventKind, decode_event_stream};
use crate::engine::{APPLIER_CHANNEL, EngineError, ReplicationChannel};
use crate::gcs::GcsControl;
use crate::pipeline::{
    Continuation, Pipeline, PipelineAction, PipelineContext, PipelineError, create_pipeline,
};
use crate::queue::{QueueError, SynchronizedQueue};
use crate::stats::ApplierState;

#[derive(Debug, Error)]
pub enum ApplierError {
    #[error("applier is already running")]
    AlreadyRunning,
    #[error("applier is not set up")]
    NotSetUp,
    #[error("applier thread did not stop within the timeout")]
    StopTimeout,
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl ApplierError {
    pub fn transience(&self) -> Transience {
        match self {
            ApplierError::StopTimeout => Transience::Retryable,
            ApplierError::AlreadyRunning | ApplierError::NotSetUp => Transience::Permanent,
            ApplierError::Pipeline(_) | ApplierError::Engine(_) | ApplierError::Queue(_) => {
                Transience::Unknown
            }
        }
    }
}

/// What travels on the applier queue.
#[derive(Clone, Debug)]
pub enum Packet {
    /// One or more concatenated framed events.
    Data(Bytes),
    /// Breaks the blocking pop so the loop can exit.
    Termination,
    /// Parks the thread until awakened.
    Suspension,
    /// Synthesizes a view-change pipeline event.
    ViewChange(u64),
}

struct ApplierShared {
    aborted: AtomicBool,
    run: Mutex<bool>,
    run_cond: Condvar,
    suspended: Mutex<bool>,
    suspend_cond: Condvar,
    suspension_waiting_cond: Condvar,
    state: Mutex<ApplierState>,
}

impl ApplierShared {
    fn set_state(&self, state: ApplierState) {
        *self.state.lock().expect("applier state lock poisoned") = state;
    }
}

pub struct ApplierModule {
    incoming: SynchronizedQueue<Packet>,
    shared: Arc<ApplierShared>,
    pipeline: Arc<Mutex<Option<Pipeline>>>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
    sql_channel: Mutex<Option<Arc<dyn ReplicationChannel>>>,
    gcs_control: Arc<dyn GcsControl>,
}

impl ApplierModule {
    pub fn new(gcs_control: Arc<dyn GcsControl>) -> Self {
        Self {
            incoming: SynchronizedQueue::new(),
            shared: Arc::new(ApplierShared {
                aborted: AtomicBool::new(false),
                run: Mutex::new(false),
                run_cond: Condvar::new(),
                suspended: Mutex::new(false),
                suspend_cond: Condvar::new(),
                suspension_waiting_cond: Condvar::new(),
                state: Mutex::new(ApplierState::NotStarted),
            }),
            pipeline: Arc::new(Mutex::new(None)),
            handle: Mutex::new(None),
            sql_channel: Mutex::new(None),
            gcs_control,
        }
    }

    /// Builds the pipeline and configures its handlers. The certifier
    /// resumes from the furthest gno the node has seen: executed in the
    /// engine or already queued to the apply channel.
    pub fn setup(
        &self,
        spec: PipelineSpec,
        context: PipelineContext,
        cluster_sid: Uuid,
        reset_logs: bool,
        stop_timeout: Duration,
    ) -> Result<(), ApplierError> {
        let engine = Arc::clone(&context.engine);
        let mut pipeline = create_pipeline(spec, &context)?;

        let mut applier_conf = PipelineAction::ApplierConfig {
            reset_logs,
            stop_timeout,
            cluster_sid,
            last_queued_gno: None,
        };
        pipeline.handle_action(&mut applier_conf)?;
        let PipelineAction::ApplierConfig {
            last_queued_gno: Some(last_delivered_gno),
            ..
        } = applier_conf
        else {
            return Err(ApplierError::NotSetUp);
        };

        let mut cert_conf = PipelineAction::CertifierConfig {
            last_executed_gno: engine.last_executed_gno(cluster_sid)?,
            last_delivered_gno,
            cluster_sid,
        };
        pipeline.handle_action(&mut cert_conf)?;

        *self.sql_channel.lock().expect("applier channel lock poisoned") =
            Some(engine.replication_channel(APPLIER_CHANNEL)?);
        *self.pipeline.lock().expect("applier pipeline lock poisoned") = Some(pipeline);
        Ok(())
    }

    /// Starts the consumer thread; returns once it published RUNNING.
    pub fn start(&self) -> Result<(), ApplierError> {
        let mut running = self.lock_run();
        if *running {
            return Err(ApplierError::AlreadyRunning);
        }
        {
            let mut pipeline = self.pipeline.lock().expect("applier pipeline lock poisoned");
            let pipeline = pipeline.as_mut().ok_or(ApplierError::NotSetUp)?;
            pipeline.handle_action(&mut PipelineAction::Start)?;
        }

        self.shared.aborted.store(false, Ordering::SeqCst);
        let shared = Arc::clone(&self.shared);
        let incoming = self.incoming.clone();
        let pipeline = Arc::clone(&self.pipeline);
        let gcs_control = Arc::clone(&self.gcs_control);
        let handle =
            thread::spawn(move || applier_thread_handle(shared, incoming, pipeline, gcs_control));
        *self.handle.lock().expect("applier handle lock poisoned") = Some(handle);

        while !*running {
            running = self
                .shared
                .run_cond
                .wait(running)
                .expect("applier run lock poisoned");
        }
        Ok(())
    }

    /// Runs one control-plane action through the pipeline. Used by recovery
    /// to install certification snapshots while the thread is suspended.
    pub fn handle_pipeline_action(
        &self,
        action: &mut PipelineAction,
    ) -> Result<(), ApplierError> {
        let mut pipeline = self.pipeline.lock().expect("applier pipeline lock poisoned");
        let pipeline = pipeline.as_mut().ok_or(ApplierError::NotSetUp)?;
        pipeline.handle_action(action)?;
        Ok(())
    }

    /// Producer handle for delivery callbacks and the control path.
    pub fn queue(&self) -> SynchronizedQueue<Packet> {
        self.incoming.clone()
    }

    pub fn queue_size(&self) -> usize {
        self.incoming.size()
    }

    pub fn state(&self) -> ApplierState {
        *self.shared.state.lock().expect("applier state lock poisoned")
    }

    pub fn is_running(&self) -> bool {
        *self.lock_run()
    }

    /// Asks the thread to park at the next packet boundary.
    pub fn suspend(&self) {
        self.incoming.push(Packet::Suspension);
    }

    /// Unparks a suspended thread.
    pub fn awake(&self) {
        let mut suspended = self.lock_suspended();
        *suspended = false;
        self.shared.suspend_cond.notify_all();
    }

    /// Returns once (a) the thread parked on the suspension condition and
    /// (b) the apply channel finished executing every pre-suspension event.
    /// `abort` short-circuits both waits.
    pub fn wait_for_complete_suspension(&self, abort: &AtomicBool) -> Result<(), ApplierError> {
        {
            let mut suspended = self.lock_suspended();
            while !*suspended && !abort.load(Ordering::SeqCst) {
                suspended = self
                    .shared
                    .suspension_waiting_cond
                    .wait(suspended)
                    .expect("applier suspend lock poisoned");
            }
        }

        let channel = self
            .sql_channel
            .lock()
            .expect("applier channel lock poisoned")
            .clone()
            .ok_or(ApplierError::NotSetUp)?;
        while !abort.load(Ordering::SeqCst) {
            if channel.wait_for_event_execution(Duration::from_secs(1))? {
                break;
            }
        }
        Ok(())
    }

    /// Wakes threads blocked in `wait_for_complete_suspension`.
    pub fn interrupt_suspension_wait(&self) {
        let _suspended = self.lock_suspended();
        self.shared.suspension_waiting_cond.notify_all();
    }

    /// Stops the consumer thread: abort flag, termination sentinel, wakeups,
    /// then a timed wait in two-second slices. On timeout the thread may
    /// still be running and the caller decides whether to retry.
    pub fn terminate(&self, timeout: Duration) -> Result<(), ApplierError> {
        self.shared.aborted.store(true, Ordering::SeqCst);

        let mut running = self.lock_run();
        if !*running {
            return Ok(());
        }

        self.incoming.push(Packet::Termination);
        self.awake();
        self.interrupt_suspension_wait();

        let mut remaining = timeout;
        while *running {
            let slice = remaining.min(Duration::from_secs(2));
            let (next, wait) = self
                .shared
                .run_cond
                .wait_timeout(running, slice)
                .expect("applier run lock poisoned");
            running = next;
            if wait.timed_out() {
                remaining = remaining.saturating_sub(slice);
                if remaining.is_zero() && *running {
                    return Err(ApplierError::StopTimeout);
                }
            }
        }
        drop(running);

        if let Some(handle) = self.handle.lock().expect("applier handle lock poisoned").take() {
            let _ = handle.join();
        }
        Ok(())
    }

    pub fn is_own_event_channel(&self, thread_id: u64) -> bool {
        self.sql_channel
            .lock()
            .expect("applier channel lock poisoned")
            .as_ref()
            .is_some_and(|channel| channel.is_own_event_channel(thread_id))
    }

    fn lock_run(&self) -> std::sync::MutexGuard<'_, bool> {
        self.shared.run.lock().expect("applier run lock poisoned")
    }

    fn lock_suspended(&self) -> std::sync::MutexGuard<'_, bool> {
        self.shared
            .suspended
            .lock()
            .expect("applier suspend lock poisoned")
    }
}

fn applier_thread_handle(
    shared: Arc<ApplierShared>,
    incoming: SynchronizedQueue<Packet>,
    pipeline: Arc<Mutex<Option<Pipeline>>>,
    gcs_control: Arc<dyn GcsControl>,
) {
    {
        let mut running = shared.run.lock().expect("applier run lock poisoned");
        *running = true;
        shared.set_state(ApplierState::Running);
        shared.run_cond.notify_all();
    }

    let cont = Continuation::new();
    let mut failed = false;

    'main: while !shared.aborted.load(Ordering::SeqCst) {
        let packet = match incoming.pop() {
            Ok(packet) => packet,
            Err(_) => break,
        };

        match packet {
            Packet::Termination => break,
            Packet::Suspension => {
                suspend_applier(&shared);
            }
            Packet::ViewChange(view_id) => {
                let event = EventKind::ViewChange {
                    view_id,
                    snapshot: None,
                };
                if inject_event(&shared, &pipeline, event, &cont, &gcs_control) {
                    failed = true;
                    break;
                }
            }
            Packet::Data(data) => {
                let frames = match decode_event_stream(&data) {
                    Ok(frames) => frames,
                    Err(error) => {
                        tracing::error!(%error, "undecodable packet on the applier queue");
                        failed = true;
                        leave_on_failure(&gcs_control);
                        break;
                    }
                };
                for frame in frames {
                    let event = EventKind::Raw(frame);
                    if inject_event(&shared, &pipeline, event, &cont, &gcs_control) {
                        failed = true;
                        break 'main;
                    }
                }
            }
        }
    }

    {
        let mut guard = pipeline.lock().expect("applier pipeline lock poisoned");
        if let Some(pipeline) = guard.as_mut()
            && let Err(error) = pipeline.terminate()
        {
            tracing::warn!(%error, "the pipeline was not properly disposed");
        }
    }

    let mut running = shared.run.lock().expect("applier run lock poisoned");
    *running = false;
    shared.set_state(if failed {
        ApplierState::Error
    } else {
        ApplierState::Stopped
    });
    shared.run_cond.notify_all();
    tracing::info!("the applier thread ended");
}

/// Returns true when the failure is fatal and the loop must exit.
fn inject_event(
    shared: &ApplierShared,
    pipeline: &Mutex<Option<Pipeline>>,
    event: EventKind,
    cont: &Continuation,
    gcs_control: &Arc<dyn GcsControl>,
) -> bool {
    {
        let mut guard = pipeline.lock().expect("applier pipeline lock poisoned");
        let Some(pipeline) = guard.as_mut() else {
            return true;
        };
        pipeline.handle_event(event, cont);
    }
    match cont.wait() {
        Ok(_discarded) => false,
        Err(error) if error.is_fatal() => {
            tracing::error!(%error, "fatal error at event handling; leaving the group");
            shared.set_state(ApplierState::Error);
            leave_on_failure(gcs_control);
            true
        }
        Err(error) => {
            tracing::warn!(%error, "error at event handling");
            false
        }
    }
}

fn leave_on_failure(gcs_control: &Arc<dyn GcsControl>) {
    if gcs_control.belongs_to_group()
        && let Err(error) = gcs_control.leave()
    {
        tracing::warn!(%error, "error leaving the group");
    }
}

fn suspend_applier(shared: &ApplierShared) {
    let mut suspended = shared
        .suspended
        .lock()
        .expect("applier suspend lock poisoned");
    *suspended = true;
    shared.set_state(ApplierState::Suspended);
    shared.suspension_waiting_cond.notify_all();

    while *suspended && !shared.aborted.load(Ordering::SeqCst) {
        suspended = shared
            .suspend_cond
            .wait(suspended)
            .expect("applier suspend lock poisoned");
    }
    *suspended = false;
    shared.set_state(ApplierState::Running);
}
