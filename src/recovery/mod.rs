//! Joiner recovery: catch up from a donor without blocking the group.
//!
//! A dedicated thread drives the state machine: wait for the applier to
//! suspend, pick a donor, consume its stream through the `gcs_recovery`
//! channel until the view-change marker for the join view, install the
//! attached certification snapshot, resume the applier, drain the queue and
//! announce the node online.

mod message;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use uuid::Uuid;

use crate::Transience;
use crate::applier::{ApplierError, ApplierModule};
use crate::core::{CertificationSnapshot, Member, MemberRegistry};
use crate::engine::{
    ConnectionParams, Engine, EngineError, RECOVERY_CHANNEL, ReplicationChannel, SnapshotSink,
    ThreadMask,
};
use crate::gcs::{GcsCommunication, GcsControl, GcsError, Payload};
use crate::pipeline::PipelineAction;

pub use message::{RECOVERY_END_MESSAGE, RecoveryEndMessage, RecoveryMessageError};

#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("a previous recovery session is still running")]
    AlreadyRunning,
    #[error("recovery thread did not stop within the timeout")]
    StopTimeout,
    #[error("no suitable donor found")]
    NoDonorsAvailable,
    #[error("maximum number of donor connection attempts reached ({attempts})")]
    RetriesExhausted { attempts: u32 },
    #[error("the applier module execution status could not be evaluated")]
    ApplierSuspension(#[source] ApplierError),
    #[error(transparent)]
    Applier(#[from] ApplierError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Gcs(#[from] GcsError),
}

impl RecoveryError {
    pub fn transience(&self) -> Transience {
        match self {
            RecoveryError::AlreadyRunning => Transience::Retryable,
            RecoveryError::StopTimeout => Transience::Retryable,
            RecoveryError::NoDonorsAvailable | RecoveryError::RetriesExhausted { .. } => {
                Transience::Retryable
            }
            RecoveryError::ApplierSuspension(_) => Transience::Unknown,
            RecoveryError::Applier(_) | RecoveryError::Engine(_) | RecoveryError::Gcs(_) => {
                Transience::Unknown
            }
        }
    }
}

/// Donor-session bookkeeping, serialized by its mutex against failover
/// handling on view changes.
#[derive(Default)]
struct DonorSession {
    selected: Option<Member>,
    rejected: Vec<Uuid>,
    retry_count: u32,
    max_attempts: u32,
}

struct RecoveryShared {
    aborted: AtomicBool,
    /// Not guarded by the donor mutex: the recovery thread must be able to
    /// flip this while a failover attempt holds that lock; failover
    /// re-checks it to downgrade a late failure to a warning.
    donor_transfer_finished: AtomicBool,
    connected_to_donor: AtomicBool,
    running: Mutex<bool>,
    run_cond: Condvar,
    rendezvous: Mutex<Option<CertificationSnapshot>>,
    rendezvous_cond: Condvar,
    donor: Mutex<DonorSession>,
}

/// Delivers the streamed view-change marker's snapshot to the parked
/// recovery thread.
struct RendezvousSink {
    shared: Arc<RecoveryShared>,
}

impl SnapshotSink for RendezvousSink {
    fn deliver(&self, snapshot: CertificationSnapshot) {
        let mut rendezvous = self
            .shared
            .rendezvous
            .lock()
            .expect("recovery rendezvous lock poisoned");
        *rendezvous = Some(snapshot);
        self.shared.rendezvous_cond.notify_all();
    }
}

pub struct RecoveryModule {
    applier: Arc<ApplierModule>,
    gcs_control: Arc<dyn GcsControl>,
    gcs_communication: Arc<dyn GcsCommunication>,
    registry: Arc<MemberRegistry>,
    engine: Arc<dyn Engine>,
    shared: Arc<RecoveryShared>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
    channel: Mutex<Option<Arc<dyn ReplicationChannel>>>,
    view_id: Mutex<u64>,
    credentials: Mutex<(String, String)>,
    retry_count: Mutex<u32>,
    transaction_threshold: Mutex<u64>,
    stop_timeout: Mutex<Duration>,
    needs_relay_log_reset: AtomicBool,
}

impl RecoveryModule {
    pub fn new(
        applier: Arc<ApplierModule>,
        gcs_control: Arc<dyn GcsControl>,
        gcs_communication: Arc<dyn GcsCommunication>,
        registry: Arc<MemberRegistry>,
        engine: Arc<dyn Engine>,
    ) -> Self {
        Self {
            applier,
            gcs_control,
            gcs_communication,
            registry,
            engine,
            shared: Arc::new(RecoveryShared {
                aborted: AtomicBool::new(false),
                donor_transfer_finished: AtomicBool::new(false),
                connected_to_donor: AtomicBool::new(false),
                running: Mutex::new(false),
                run_cond: Condvar::new(),
                rendezvous: Mutex::new(None),
                rendezvous_cond: Condvar::new(),
                donor: Mutex::new(DonorSession::default()),
            }),
            handle: Mutex::new(None),
            channel: Mutex::new(None),
            view_id: Mutex::new(0),
            credentials: Mutex::new(("root".to_string(), String::new())),
            retry_count: Mutex::new(0),
            transaction_threshold: Mutex::new(0),
            stop_timeout: Mutex::new(Duration::from_secs(2)),
            needs_relay_log_reset: AtomicBool::new(false),
        }
    }

    pub fn set_donor_credentials(&self, user: String, password: String) {
        *self.credentials.lock().expect("recovery credentials lock poisoned") = (user, password);
    }

    pub fn set_retry_count(&self, count: u32) {
        *self.retry_count.lock().expect("recovery retry lock poisoned") = count;
    }

    pub fn set_transaction_threshold(&self, threshold: u64) {
        *self
            .transaction_threshold
            .lock()
            .expect("recovery threshold lock poisoned") = threshold;
    }

    pub fn set_stop_timeout(&self, timeout: Duration) {
        *self.stop_timeout.lock().expect("recovery timeout lock poisoned") = timeout;
    }

    pub fn set_needs_relay_log_reset(&self, needs_reset: bool) {
        self.needs_relay_log_reset.store(needs_reset, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        *self.lock_running()
    }

    /// Starts the recovery thread for the given join view. Light by design:
    /// it must not delay the view-change callback that invokes it.
    pub fn start_recovery(self: &Arc<Self>, view_id: u64) -> Result<(), RecoveryError> {
        let mut running = self.lock_running();
        if *running {
            tracing::error!("a previous recovery session is still running");
            return Err(RecoveryError::AlreadyRunning);
        }

        // Leftover donor threads from a previous session die first.
        let channel = self.engine.replication_channel(RECOVERY_CHANNEL)?;
        if channel.is_io_thread_running() || channel.is_sql_thread_running() {
            channel.stop_threads(false, ThreadMask::Both)?;
        }
        *self.channel.lock().expect("recovery channel lock poisoned") = Some(channel);
        *self.view_id.lock().expect("recovery view lock poisoned") = view_id;

        self.shared.aborted.store(false, Ordering::SeqCst);
        self.shared
            .donor_transfer_finished
            .store(false, Ordering::SeqCst);
        self.shared.connected_to_donor.store(false, Ordering::SeqCst);
        {
            let mut session = self.lock_donor();
            let configured = *self.retry_count.lock().expect("recovery retry lock poisoned");
            session.max_attempts = if configured == 0 {
                self.registry.member_count().saturating_sub(1) as u32
            } else {
                configured
            };
            session.retry_count = 0;
            session.rejected.clear();
            session.selected = None;
        }

        let module = Arc::clone(self);
        let handle = thread::spawn(move || module.recovery_thread_handle());
        *self.handle.lock().expect("recovery handle lock poisoned") = Some(handle);

        while !*running {
            running = self
                .shared
                .run_cond
                .wait(running)
                .expect("recovery run lock poisoned");
        }
        tracing::info!(view_id, "recovery thread started");
        Ok(())
    }

    /// Stops the recovery thread, interrupting every wait it may sit in.
    pub fn stop_recovery(&self) -> Result<(), RecoveryError> {
        let timeout = *self.stop_timeout.lock().expect("recovery timeout lock poisoned");
        self.shared.aborted.store(true, Ordering::SeqCst);

        let mut running = self.lock_running();
        if !*running {
            return Ok(());
        }

        self.applier.interrupt_suspension_wait();
        {
            let _rendezvous = self
                .shared
                .rendezvous
                .lock()
                .expect("recovery rendezvous lock poisoned");
            self.shared.rendezvous_cond.notify_all();
        }

        let mut remaining = timeout;
        while *running {
            let slice = remaining.min(Duration::from_secs(2));
            let (next, wait) = self
                .shared
                .run_cond
                .wait_timeout(running, slice)
                .expect("recovery run lock poisoned");
            running = next;
            if wait.timed_out() {
                remaining = remaining.saturating_sub(slice);
                if remaining.is_zero() && *running {
                    return Err(RecoveryError::StopTimeout);
                }
            }
        }
        drop(running);

        if let Some(handle) = self.handle.lock().expect("recovery handle lock poisoned").take() {
            let _ = handle.join();
        }
        Ok(())
    }

    /// Reacts to a view change while recovering: terminate when alone,
    /// otherwise fail over if the connected donor left mid-transfer.
    pub fn update_recovery_process(&self, nodes_left: bool) -> Result<(), RecoveryError> {
        if !self.is_running() {
            return Ok(());
        }

        if self.registry.member_count() <= 1 {
            // Alone in the view: nobody can feed us.
            return self.stop_recovery();
        }

        let mut session = self.lock_donor();

        if nodes_left {
            // Potential failed donors left; their slots free up the budget.
            session.retry_count = 0;
            session.rejected.clear();
        }

        let donor_left = session
            .selected
            .as_ref()
            .is_some_and(|donor| self.registry.get(donor.uuid).is_none());

        if donor_left
            && self.shared.connected_to_donor.load(Ordering::SeqCst)
            && !self.shared.donor_transfer_finished.load(Ordering::SeqCst)
        {
            let donor = session.selected.as_ref().map(|donor| donor.uuid);
            tracing::info!(
                donor = ?donor,
                "killing the current recovery connection: the donor left"
            );
            if let Err(error) = self.donor_failover(&mut session) {
                // The transfer may have finished while the failover ran.
                if !self.shared.donor_transfer_finished.load(Ordering::SeqCst) {
                    tracing::error!(%error,
                        "failover to another donor failed, rendering recovery impossible; \
                         the node will now leave the group");
                    drop(session);
                    if let Err(leave_error) = self.gcs_control.leave() {
                        tracing::warn!(error = %leave_error, "error leaving the group");
                    }
                    return Err(error);
                }
                tracing::warn!(
                    "failover to another donor failed, but recovery already received all the data"
                );
            }
        }
        Ok(())
    }

    fn donor_failover(&self, session: &mut DonorSession) -> Result<(), RecoveryError> {
        let channel = self.channel()?;
        if channel.is_io_thread_running() {
            // Restart only the receive thread: the apply thread may already
            // have executed the view-change marker and stopped; restarting
            // it would replay events past the marker.
            channel.stop_threads(false, ThreadMask::Receiver)?;
        }
        self.establish_donor_connection(session, true)
    }

    fn recovery_thread_handle(self: Arc<Self>) {
        {
            let mut running = self.lock_running();
            *running = true;
            self.shared.run_cond.notify_all();
        }

        let error = self.recovery_session();
        let failed = error.is_err();

        if let Err(error) = self.terminate_donor_threads() {
            tracing::warn!(%error, "error cleaning up the donor connection");
        }

        {
            let mut running = self.lock_running();
            *running = false;
            self.shared.run_cond.notify_all();
        }

        // A node that cannot recover cannot take an active part in the
        // group, so it leaves. Only after publishing NOT RUNNING: the leave
        // installs a view whose handling waits on this very thread.
        if failed && !self.shared.aborted.load(Ordering::SeqCst) {
            if let Err(error) = self.gcs_control.leave() {
                tracing::warn!(%error, "error leaving the group after failed recovery");
            }
        }
    }

    fn recovery_session(&self) -> Result<(), RecoveryError> {
        if !self.aborted()
            && let Err(error) = self
                .applier
                .wait_for_complete_suspension(&self.shared.aborted)
        {
            tracing::error!(
                "recovery cannot evaluate the applier execution status and will \
                 shut down to avoid data corruption"
            );
            return Err(RecoveryError::ApplierSuspension(error));
        }

        *self
            .shared
            .rendezvous
            .lock()
            .expect("recovery rendezvous lock poisoned") = None;

        if !self.aborted() {
            let mut session = self.lock_donor();
            self.establish_donor_connection(&mut session, false)?;
        }

        let snapshot = {
            let mut rendezvous = self
                .shared
                .rendezvous
                .lock()
                .expect("recovery rendezvous lock poisoned");
            while rendezvous.is_none() && !self.aborted() {
                rendezvous = self
                    .shared
                    .rendezvous_cond
                    .wait(rendezvous)
                    .expect("recovery rendezvous lock poisoned");
            }
            rendezvous.take()
        };

        if let Some(snapshot) = snapshot {
            self.applier
                .handle_pipeline_action(&mut PipelineAction::InstallCertificationSnapshot {
                    snapshot,
                })?;
        }

        // Flipped without the donor lock: a failover attempt may hold it
        // right now and must see the transfer complete under it.
        self.shared
            .donor_transfer_finished
            .store(true, Ordering::SeqCst);
        self.shared.connected_to_donor.store(false, Ordering::SeqCst);

        // Waking the applier after an abort would certify and execute
        // transactions on the wrong certification context.
        if !self.aborted() {
            self.applier.awake();
            self.wait_for_applier_drain();
        }

        if !self.aborted() {
            self.notify_group_recovery_end()?;
        }
        Ok(())
    }

    fn establish_donor_connection(
        &self,
        session: &mut DonorSession,
        failover: bool,
    ) -> Result<(), RecoveryError> {
        let channel = self.channel()?;
        let view_id = *self.view_id.lock().expect("recovery view lock poisoned");

        while !self.aborted() {
            let donor = self.select_donor(session)?;

            let attempt = (|| -> Result<(), RecoveryError> {
                if !failover {
                    channel.initialize_repositories()?;
                    if self.needs_relay_log_reset.swap(false, Ordering::SeqCst) {
                        channel.purge_relay_logs()?;
                    }
                    self.initialize_connection_parameters(&channel, &donor)?;
                    let sink = Arc::new(RendezvousSink {
                        shared: Arc::clone(&self.shared),
                    });
                    channel.initialize_view_id_until_condition(view_id, sink)?;
                } else {
                    self.initialize_connection_parameters(&channel, &donor)?;
                }

                // On failover only the receive thread restarts; the apply
                // thread keeps draining toward the view marker.
                let mask = if failover {
                    ThreadMask::Receiver
                } else {
                    ThreadMask::Both
                };
                channel.start_replication_threads(mask, true)?;
                Ok(())
            })();

            match attempt {
                Ok(()) => {
                    self.shared.connected_to_donor.store(true, Ordering::SeqCst);
                    return Ok(());
                }
                Err(error) => {
                    if session.retry_count >= session.max_attempts {
                        tracing::error!(%error,
                            "maximum number of donor connection attempts reached; \
                             aborting recovery");
                        return Err(RecoveryError::RetriesExhausted {
                            attempts: session.max_attempts,
                        });
                    }
                    session.retry_count += 1;
                    session.rejected.push(donor.uuid);
                    tracing::info!(
                        attempt = session.retry_count,
                        max = session.max_attempts,
                        %error,
                        "retrying connection with another donor"
                    );
                }
            }
        }
        Ok(())
    }

    /// First online remote member outside the rejected set; one reset of
    /// the rejected set is allowed before giving up.
    fn select_donor(&self, session: &mut DonorSession) -> Result<Member, RecoveryError> {
        if let Some(donor) = self.registry.select_donor(&session.rejected) {
            session.selected = Some(donor.clone());
            return Ok(donor);
        }
        if !session.rejected.is_empty() {
            // Donors that errored before are better than none; retry them.
            session.rejected.clear();
            if let Some(donor) = self.registry.select_donor(&session.rejected) {
                session.selected = Some(donor.clone());
                return Ok(donor);
            }
        }
        tracing::error!("no suitable donor found, recovery aborting");
        Err(RecoveryError::NoDonorsAvailable)
    }

    fn initialize_connection_parameters(
        &self,
        channel: &Arc<dyn ReplicationChannel>,
        donor: &Member,
    ) -> Result<(), RecoveryError> {
        let (user, password) = self
            .credentials
            .lock()
            .expect("recovery credentials lock poisoned")
            .clone();
        tracing::info!(
            donor = %donor.uuid,
            host = %donor.host,
            port = donor.port,
            %user,
            "establishing connection to the donor"
        );
        channel.initialize_connection_parameters(&ConnectionParams {
            host: donor.host.clone(),
            port: donor.port,
            user,
            password,
            use_ssl: false,
            heartbeat_period: Duration::from_secs(1),
        })?;
        Ok(())
    }

    /// Polls the applier queue; under the threshold the joiner is caught up
    /// enough to advertise itself.
    fn wait_for_applier_drain(&self) {
        let threshold = *self
            .transaction_threshold
            .lock()
            .expect("recovery threshold lock poisoned");
        while !self.aborted() {
            let queue_size = self.applier.queue_size() as u64;
            if queue_size <= threshold {
                break;
            }
            thread::sleep(Duration::from_micros(100 * queue_size).min(Duration::from_secs(1)));
        }
    }

    fn notify_group_recovery_end(&self) -> Result<(), RecoveryError> {
        let message = RecoveryEndMessage::new(self.registry.local_uuid());
        self.gcs_communication
            .broadcast(Payload::Recovery, Bytes::from(message.encode()))
            .map_err(|error| {
                tracing::error!(%error, "error sending the recovery end message");
                RecoveryError::Gcs(error)
            })
    }

    /// Stops the donor threads and purges the recovery channel, serialized
    /// against concurrent failover attempts.
    fn terminate_donor_threads(&self) -> Result<(), RecoveryError> {
        let _session = self.lock_donor();
        let channel = self.channel()?;
        tracing::info!("terminating the donor connection and purging recovery logs");
        channel.stop_threads(false, ThreadMask::Both)?;
        channel.purge_relay_logs()?;
        channel.purge_master_info()?;
        channel.clean_thread_repositories()?;
        Ok(())
    }

    fn channel(&self) -> Result<Arc<dyn ReplicationChannel>, RecoveryError> {
        self.channel
            .lock()
            .expect("recovery channel lock poisoned")
            .clone()
            .ok_or_else(|| {
                RecoveryError::Engine(EngineError::UnknownChannel {
                    channel: RECOVERY_CHANNEL.to_string(),
                })
            })
    }

    fn aborted(&self) -> bool {
        self.shared.aborted.load(Ordering::SeqCst)
    }

    fn lock_running(&self) -> std::sync::MutexGuard<'_, bool> {
        self.shared.running.lock().expect("recovery run lock poisoned")
    }

    fn lock_donor(&self) -> std::sync::MutexGuard<'_, DonorSession> {
        self.shared.donor.lock().expect("recovery donor lock poisoned")
    }
}
