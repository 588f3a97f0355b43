//! Plugin context: lifecycle control, GCS event handling and status.
//!
//! One context object owns the modules for the lifetime of a start/stop
//! cycle; background threads hold handles into it. The GCS callbacks
//! translate deliveries and view installs into queue pushes and registry
//! updates and never block on cluster-wide work.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use uuid::Uuid;

use crate::applier::{ApplierError, ApplierModule, Packet};
use crate::certifier::{BroadcastContext, Certifier};
use crate::config::Config;
use crate::core::{
    EventKind, Gid, Gno, Member, MemberRegistry, MemberStatus, TransactionContext, View,
    WriteSetItem, decode_member, encode_event, encode_member,
};
use crate::engine::Engine;
use crate::error::Error;
use crate::gcs::{GcsCommunication, GcsControl, GcsError, GcsEventListener, Payload};
use crate::latch::{CertificationLatch, CertificationOutcome, LatchError};
use crate::pipeline::{PipelineAction, PipelineContext};
use crate::recovery::{RecoveryEndMessage, RecoveryModule};
use crate::stats::{ApplierState, MessageStats, StatusRecord};

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("group replication is already running")]
    AlreadyRunning,
    #[error("the applier module could not be initialized")]
    ApplierInit(#[source] ApplierError),
    #[error("could not join the group")]
    GcsJoin(#[source] GcsError),
    #[error(transparent)]
    Latch(#[from] LatchError),
}

const LEAVE_VIEW_TIMEOUT: Duration = Duration::from_secs(10);

/// Tracks the view install that follows a deliberate leave, so stop can
/// bound its wait.
#[derive(Default)]
struct ViewModificationWaiter {
    installed: Mutex<bool>,
    cond: Condvar,
}

impl ViewModificationWaiter {
    fn start_wait(&self) {
        *self.installed.lock().expect("view waiter lock poisoned") = false;
    }

    fn notify(&self) {
        let mut installed = self.installed.lock().expect("view waiter lock poisoned");
        *installed = true;
        self.cond.notify_all();
    }

    /// Returns false when the view did not install within the timeout.
    fn wait(&self, timeout: Duration) -> bool {
        let mut installed = self.installed.lock().expect("view waiter lock poisoned");
        let deadline = std::time::Instant::now() + timeout;
        while !*installed {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                return false;
            }
            let (next, _) = self
                .cond
                .wait_timeout(installed, remaining)
                .expect("view waiter lock poisoned");
            installed = next;
        }
        true
    }
}

/// Records traffic counters around the raw communication session.
struct StatsCommunication {
    inner: Arc<dyn GcsCommunication>,
    stats: Arc<MessageStats>,
}

impl GcsCommunication for StatsCommunication {
    fn broadcast(&self, payload: Payload, data: Bytes) -> Result<(), GcsError> {
        self.stats.record_send(data.len());
        self.inner.broadcast(payload, data)
    }
}

/// Identity of the local server as seen by the group.
#[derive(Clone, Debug)]
pub struct LocalServer {
    pub uuid: Uuid,
    pub host: String,
    pub port: u16,
}

#[derive(Default)]
struct Modules {
    running: bool,
    applier: Option<Arc<ApplierModule>>,
    recovery: Option<Arc<RecoveryModule>>,
}

pub struct GcsReplication {
    config: Config,
    cluster_sid: Uuid,
    local: LocalServer,
    engine: Arc<dyn Engine>,
    gcs_control: Arc<dyn GcsControl>,
    gcs_communication: Arc<dyn GcsCommunication>,
    stats: Arc<MessageStats>,
    registry: Arc<MemberRegistry>,
    certifier: Arc<Certifier>,
    latch: Arc<CertificationLatch>,
    /// Serializes start/stop cycles; never taken from GCS callbacks.
    lifecycle_op: Mutex<()>,
    /// Short-held module slots, shared with the callbacks.
    modules: Mutex<Modules>,
    wait_on_engine_initialization: AtomicBool,
    view_waiter: ViewModificationWaiter,
}

impl GcsReplication {
    pub fn new(
        config: Config,
        local: LocalServer,
        engine: Arc<dyn Engine>,
        gcs_control: Arc<dyn GcsControl>,
        gcs_communication: Arc<dyn GcsCommunication>,
    ) -> Result<Arc<Self>, Error> {
        config.validate()?;
        let cluster_sid = config.group_uuid()?;
        let stats = Arc::new(MessageStats::new());
        let plugin = Arc::new(Self {
            cluster_sid,
            registry: Arc::new(MemberRegistry::new(local.uuid)),
            certifier: Arc::new(Certifier::new(
                config.broadcast_period(),
                config.broadcast_failure_policy,
            )),
            latch: Arc::new(CertificationLatch::new()),
            gcs_communication: Arc::new(StatsCommunication {
                inner: gcs_communication,
                stats: Arc::clone(&stats),
            }),
            stats,
            local,
            engine,
            gcs_control,
            lifecycle_op: Mutex::new(()),
            modules: Mutex::new(Modules::default()),
            wait_on_engine_initialization: AtomicBool::new(false),
            view_waiter: ViewModificationWaiter::default(),
            config,
        });

        plugin
            .gcs_control
            .set_event_listener(Arc::new(PluginEventHandler {
                plugin: Arc::downgrade(&plugin),
            }));

        if plugin.config.start_on_boot {
            plugin.start()?;
        }
        Ok(plugin)
    }

    pub fn is_running(&self) -> bool {
        self.lock_modules().running
    }

    /// Starts replication: applier first, then the group join. When the
    /// engine is not ready yet the start completes in `on_engine_ready`.
    pub fn start(&self) -> Result<(), Error> {
        let _op = self.lock_op();
        if self.is_running() {
            return Err(PluginError::AlreadyRunning.into());
        }
        self.config.validate()?;

        if !self.engine.is_ready() {
            // The engine has not replayed its own logs yet; the applier
            // cannot start before that. Decision deferred.
            self.wait_on_engine_initialization
                .store(true, Ordering::SeqCst);
            return Ok(());
        }

        self.do_start()
    }

    /// Completes a start that was deferred on engine initialization.
    pub fn on_engine_ready(&self) -> Result<(), Error> {
        if !self
            .wait_on_engine_initialization
            .swap(false, Ordering::SeqCst)
        {
            return Ok(());
        }
        let _op = self.lock_op();
        if self.is_running() {
            return Ok(());
        }
        self.do_start()
    }

    fn do_start(&self) -> Result<(), Error> {
        let applier = Arc::new(ApplierModule::new(Arc::clone(&self.gcs_control)));
        applier.setup(
            self.config.pipeline_type,
            PipelineContext {
                certifier: Arc::clone(&self.certifier),
                latch: Arc::clone(&self.latch),
                engine: Arc::clone(&self.engine),
                local_uuid: self.local.uuid,
            },
            self.cluster_sid,
            false,
            self.config.components_stop_timeout(),
        )?;

        let recovery = Arc::new(RecoveryModule::new(
            Arc::clone(&applier),
            Arc::clone(&self.gcs_control),
            Arc::clone(&self.gcs_communication),
            Arc::clone(&self.registry),
            Arc::clone(&self.engine),
        ));
        recovery.set_donor_credentials(
            self.config.recovery_user.clone(),
            self.config.recovery_password.clone(),
        );
        recovery.set_retry_count(self.config.recovery_retry_count);
        recovery.set_transaction_threshold(self.config.recovery_transaction_threshold);
        recovery.set_stop_timeout(self.config.components_stop_timeout());

        applier
            .start()
            .map_err(|error| Error::from(PluginError::ApplierInit(error)))?;
        tracing::info!("event applier module successfully initialized");

        applier.handle_pipeline_action(&mut PipelineAction::GcsInterfaces {
            context: Some(BroadcastContext {
                gcs: Arc::clone(&self.gcs_communication),
                engine: Arc::clone(&self.engine),
                registry: Arc::clone(&self.registry),
            }),
        })?;

        self.gcs_control
            .set_exchangeable_data(Bytes::from(encode_member(&Member {
                uuid: self.local.uuid,
                host: self.local.host.clone(),
                port: self.local.port,
                status: MemberStatus::Offline,
            })));

        // The modules must be visible to the callbacks before the join:
        // the join view arrives through them.
        {
            let mut modules = self.lock_modules();
            modules.applier = Some(Arc::clone(&applier));
            modules.recovery = Some(recovery);
            modules.running = true;
        }

        if let Err(error) = self.gcs_control.join(self.cluster_sid) {
            tracing::error!(%error, "error on group join, killing the applier");
            {
                let mut modules = self.lock_modules();
                modules.applier = None;
                modules.recovery = None;
                modules.running = false;
            }
            let timeout = self.config.components_stop_timeout();
            if let Err(stop_error) = applier.terminate(timeout) {
                tracing::warn!(error = %stop_error, "the applier did not stop after a failed join");
            }
            return Err(PluginError::GcsJoin(error).into());
        }
        Ok(())
    }

    /// Stops replication: leave the group first so no message is delivered
    /// in the current view but never applied, then recovery, then the
    /// applier.
    pub fn stop(&self) -> Result<(), Error> {
        let _op = self.lock_op();
        if !self.is_running() {
            return Ok(());
        }

        if self.gcs_control.belongs_to_group() {
            self.view_waiter.start_wait();
            if let Err(error) = self.gcs_control.leave() {
                tracing::warn!(%error, "error leaving the group");
            }
            if !self.view_waiter.wait(LEAVE_VIEW_TIMEOUT) {
                tracing::warn!(
                    "timeout receiving a view change on shutdown; this can lead to an \
                     inconsistent state"
                );
            }
        }

        let (applier, recovery) = {
            let mut modules = self.lock_modules();
            modules.running = false;
            (modules.applier.take(), modules.recovery.take())
        };

        if let Some(recovery) = recovery
            && let Err(error) = recovery.stop_recovery()
        {
            tracing::warn!(%error, "timeout on the recovery module termination during shutdown");
        }

        let mut result = Ok(());
        if let Some(applier) = applier {
            if let Err(error) = applier.handle_pipeline_action(&mut PipelineAction::Stop) {
                tracing::warn!(%error, "error stopping the pipeline handlers");
            }
            if let Err(error) = applier.terminate(self.config.components_stop_timeout()) {
                tracing::error!("timeout on the applier module termination during shutdown");
                result = Err(error.into());
            }
        }
        result
    }

    /// Registers the session so it can later wait for its certification
    /// outcome.
    pub fn begin_local_transaction(&self, thread_id: u64) -> Result<(), Error> {
        self.latch.register(thread_id).map_err(PluginError::Latch)?;
        Ok(())
    }

    /// Broadcasts a local transaction to the group: context, gid
    /// placeholder, then the engine payload, as one ordered packet.
    pub fn broadcast_transaction(
        &self,
        thread_id: u64,
        snapshot_version: Gno,
        write_set: Vec<WriteSetItem>,
        body: Bytes,
    ) -> Result<(), Error> {
        let mut packet = Vec::new();
        packet.extend_from_slice(&encode_event(&EventKind::TransactionContext(
            TransactionContext {
                origin: self.local.uuid,
                thread_id,
                snapshot_version,
                write_set,
            },
        )));
        packet.extend_from_slice(&encode_event(&EventKind::GidLog {
            gid: Gid::new(self.local.uuid, Gno::ZERO),
        }));
        packet.extend_from_slice(&encode_event(&EventKind::Passthrough(body)));
        self.gcs_communication
            .broadcast(Payload::Transaction, Bytes::from(packet))?;
        Ok(())
    }

    /// Parks the session thread until its transaction's outcome arrives.
    pub fn wait_for_certification(&self, thread_id: u64) -> Result<CertificationOutcome, Error> {
        Ok(self.latch.wait(thread_id).map_err(PluginError::Latch)?)
    }

    /// The single structured status record.
    pub fn status(&self) -> StatusRecord {
        let (running, applier_state, queue_depth) = {
            let modules = self.lock_modules();
            match &modules.applier {
                Some(applier) => (modules.running, applier.state(), applier.queue_size()),
                None => (modules.running, ApplierState::NotStarted, 0),
            }
        };
        let last_certified_gid = self
            .certifier
            .last_certified_gno()
            .map(|gno| format!("{}:{gno}", self.cluster_sid));
        let stable_set = {
            let stable = self.certifier.stable_set();
            (!stable.is_empty()).then(|| stable.to_string())
        };

        StatusRecord {
            running,
            group_name: self.config.group_name.clone(),
            view_id: self.registry.view_id(),
            members: self.registry.members(),
            applier_state,
            queue_depth,
            counters: self.stats.snapshot(),
            positively_certified: self.certifier.positive_certified(),
            negatively_certified: self.certifier.negative_certified(),
            certification_db_size: self.certifier.db_size(),
            last_certified_gid,
            stable_set,
        }
    }

    pub fn registry(&self) -> Arc<MemberRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn certifier(&self) -> Arc<Certifier> {
        Arc::clone(&self.certifier)
    }

    /// Re-publishes the local member record (with its current status) for
    /// the next view's data exchange.
    fn refresh_exchangeable_data(&self) {
        let status = self.registry.local_status();
        self.gcs_control
            .set_exchangeable_data(Bytes::from(encode_member(&Member {
                uuid: self.local.uuid,
                host: self.local.host.clone(),
                port: self.local.port,
                status,
            })));
    }

    fn applier(&self) -> Option<Arc<ApplierModule>> {
        self.lock_modules().applier.clone()
    }

    fn recovery(&self) -> Option<Arc<RecoveryModule>> {
        self.lock_modules().recovery.clone()
    }

    fn lock_op(&self) -> std::sync::MutexGuard<'_, ()> {
        self.lifecycle_op
            .lock()
            .expect("plugin lifecycle lock poisoned")
    }

    fn lock_modules(&self) -> std::sync::MutexGuard<'_, Modules> {
        self.modules.lock().expect("plugin modules lock poisoned")
    }
}

/// The registered GCS event listener; bounded work only.
struct PluginEventHandler {
    plugin: Weak<GcsReplication>,
}

impl PluginEventHandler {
    fn with_plugin(&self, handle: impl FnOnce(&GcsReplication)) {
        if let Some(plugin) = self.plugin.upgrade() {
            handle(&plugin);
        }
    }
}

impl GcsEventListener for PluginEventHandler {
    fn on_message(&self, payload: Payload, data: Bytes, origin: Uuid) {
        self.with_plugin(|plugin| {
            plugin.stats.record_delivery(data.len());
            match payload {
                Payload::Transaction => {
                    if let Some(applier) = plugin.applier() {
                        applier.queue().push(Packet::Data(data));
                    }
                }
                Payload::CertificationEvent => {
                    let members = plugin.registry.member_count();
                    if let Err(error) =
                        plugin.certifier.handle_certifier_data(members, origin, data)
                    {
                        tracing::warn!(%error, %origin, "invalid certification data received");
                    }
                }
                Payload::Recovery => match RecoveryEndMessage::decode(&data) {
                    Ok(message) => {
                        tracing::info!(member = %message.uuid, "member finished recovery");
                        plugin
                            .registry
                            .set_status(message.uuid, MemberStatus::Online);
                        if message.uuid == plugin.local.uuid {
                            plugin.refresh_exchangeable_data();
                        }
                    }
                    Err(error) => {
                        tracing::warn!(%error, %origin, "invalid recovery message received");
                    }
                },
            }
        });
    }

    fn on_view(&self, view: View, left: &[Uuid], joined: &[Uuid]) {
        self.with_plugin(|plugin| {
            plugin.stats.record_view_change();
            plugin.registry.install_view(&view);
            plugin.view_waiter.notify();

            for member in joined {
                if *member != plugin.local.uuid {
                    plugin.registry.set_status(*member, MemberStatus::Recovering);
                }
            }

            let Some(applier) = plugin.applier() else {
                return;
            };

            // Control plane first: drop any half-complete stable-set round,
            // then let the marker flow through the data plane.
            let leaving = left.contains(&plugin.local.uuid);
            if leaving {
                // Out of the group: stable-set broadcasts stop with it.
                plugin
                    .registry
                    .set_status(plugin.local.uuid, MemberStatus::Offline);
            }
            if let Err(error) =
                applier.handle_pipeline_action(&mut PipelineAction::ViewChange { leaving })
            {
                tracing::warn!(%error, "error dispatching the view change to the pipeline");
            }
            applier.queue().push(Packet::ViewChange(view.view_id));

            if joined.contains(&plugin.local.uuid) {
                if view.members.len() == 1 {
                    // Group bootstrap: nobody to recover from, and nothing
                    // to recover.
                    plugin
                        .registry
                        .set_status(plugin.local.uuid, MemberStatus::Online);
                    plugin.refresh_exchangeable_data();
                    return;
                }
                plugin
                    .registry
                    .set_status(plugin.local.uuid, MemberStatus::Recovering);
                applier.suspend();
                if let Some(recovery) = plugin.recovery()
                    && let Err(error) = recovery.start_recovery(view.view_id)
                {
                    tracing::error!(%error, "unable to start the recovery module");
                }
            } else if !left.is_empty()
                && let Some(recovery) = plugin.recovery()
                && let Err(error) = recovery.update_recovery_process(true)
            {
                tracing::warn!(%error, "error updating recovery after members left");
            }
        });
    }

    fn on_exchanged_data(&self, member: Uuid, data: Bytes) {
        self.with_plugin(|plugin| match decode_member(&data) {
            Some(record) => plugin.registry.merge_exchanged(record),
            None => {
                tracing::warn!(%member, "undecodable member record in view data exchange");
            }
        });
    }
}
