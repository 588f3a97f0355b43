//! In-process cluster rig: a totally-ordered message bus standing in for
//! the GCS binding and a scripted engine with synchronous apply.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use uuid::Uuid;

use gcs_replication::config::Config;
use gcs_replication::core::{
    CertificationSnapshot, EventKind, Gno, GnoSet, View, ViewMember, decode_event,
};
use gcs_replication::engine::{
    ConnectionParams, Engine, EngineError, ReplicationChannel, SnapshotSink, ThreadMask,
};
use gcs_replication::gcs::{GcsCommunication, GcsControl, GcsError, GcsEventListener, Payload};
use gcs_replication::latch::CertificationOutcome;
use gcs_replication::plugin::{GcsReplication, LocalServer};

pub fn member_uuid(tag: u8) -> Uuid {
    Uuid::from_bytes([tag; 16])
}

/// Polls until the condition holds; panics after the timeout.
pub fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        if Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        thread::sleep(Duration::from_millis(5));
    }
}

// ---------------------------------------------------------------------------
// Message bus

struct NodeSlot {
    host: String,
    port: u16,
    listener: Option<Arc<dyn GcsEventListener>>,
    exchanged: Bytes,
    member: bool,
}

#[derive(Default)]
struct BusState {
    view_id: u64,
    nodes: BTreeMap<Uuid, NodeSlot>,
}

/// Shared bus: one sequencing lock gives atomic broadcast its total order;
/// the state lock is never held while listeners run.
pub struct Bus {
    sequencer: Mutex<()>,
    state: Mutex<BusState>,
}

impl Bus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sequencer: Mutex::new(()),
            state: Mutex::new(BusState::default()),
        })
    }

    fn register(&self, uuid: Uuid, host: String, port: u16) {
        self.state.lock().expect("bus state").nodes.insert(
            uuid,
            NodeSlot {
                host,
                port,
                listener: None,
                exchanged: Bytes::new(),
                member: false,
            },
        );
    }

    fn members(state: &BusState) -> Vec<(Uuid, String, u16)> {
        state
            .nodes
            .iter()
            .filter(|(_, slot)| slot.member)
            .map(|(uuid, slot)| (*uuid, slot.host.clone(), slot.port))
            .collect()
    }

    fn listeners_of(
        state: &BusState,
        members: &[(Uuid, String, u16)],
    ) -> Vec<(Uuid, Arc<dyn GcsEventListener>)> {
        members
            .iter()
            .filter_map(|(uuid, _, _)| {
                state.nodes[uuid]
                    .listener
                    .clone()
                    .map(|listener| (*uuid, listener))
            })
            .collect()
    }

    fn view_for(members: &[(Uuid, String, u16)], view_id: u64, local: Uuid) -> View {
        View {
            view_id,
            members: members
                .iter()
                .map(|(uuid, host, port)| ViewMember {
                    uuid: *uuid,
                    host: host.clone(),
                    port: *port,
                })
                .collect(),
            local,
        }
    }

    fn install_view(&self, left: &[Uuid], joined: &[Uuid], include_leaver: Option<Uuid>) {
        let (view_id, members, mut deliveries, exchanged) = {
            let mut state = self.state.lock().expect("bus state");
            state.view_id += 1;
            let members = Self::members(&state);
            let deliveries = Self::listeners_of(&state, &members);
            let exchanged: Vec<(Uuid, Bytes)> = members
                .iter()
                .map(|(uuid, _, _)| (*uuid, state.nodes[uuid].exchanged.clone()))
                .collect();
            (state.view_id, members, deliveries, exchanged)
        };

        if let Some(leaver) = include_leaver {
            let listener = {
                let state = self.state.lock().expect("bus state");
                state.nodes[&leaver].listener.clone()
            };
            if let Some(listener) = listener {
                deliveries.push((leaver, listener));
            }
        }

        for (local, listener) in &deliveries {
            for (member, data) in &exchanged {
                if !data.is_empty() {
                    listener.on_exchanged_data(*member, data.clone());
                }
            }
            listener.on_view(Self::view_for(&members, view_id, *local), left, joined);
        }
    }

    fn broadcast(&self, origin: Uuid, payload: Payload, data: Bytes) -> Result<(), GcsError> {
        let _order = self.sequencer.lock().expect("bus sequencer");
        let deliveries = {
            let state = self.state.lock().expect("bus state");
            if !state.nodes.get(&origin).is_some_and(|slot| slot.member) {
                return Err(GcsError::NotInGroup);
            }
            let members = Self::members(&state);
            Self::listeners_of(&state, &members)
        };
        for (_, listener) in deliveries {
            listener.on_message(payload, data.clone(), origin);
        }
        Ok(())
    }
}

/// One node's session with the bus; the plugin's control and communication
/// interfaces.
pub struct GcsNode {
    bus: Arc<Bus>,
    uuid: Uuid,
}

impl GcsControl for GcsNode {
    fn join(&self, group: Uuid) -> Result<(), GcsError> {
        let _order = self.bus.sequencer.lock().expect("bus sequencer");
        {
            let mut state = self.bus.state.lock().expect("bus state");
            let slot = state.nodes.get_mut(&self.uuid).ok_or(GcsError::Join {
                group,
                reason: "unregistered node".to_string(),
            })?;
            slot.member = true;
        }
        self.bus.install_view(&[], &[self.uuid], None);
        Ok(())
    }

    fn leave(&self) -> Result<(), GcsError> {
        let _order = self.bus.sequencer.lock().expect("bus sequencer");
        {
            let mut state = self.bus.state.lock().expect("bus state");
            let slot = state
                .nodes
                .get_mut(&self.uuid)
                .filter(|slot| slot.member)
                .ok_or(GcsError::NotInGroup)?;
            slot.member = false;
        }
        self.bus
            .install_view(&[self.uuid], &[], Some(self.uuid));
        Ok(())
    }

    fn belongs_to_group(&self) -> bool {
        let state = self.bus.state.lock().expect("bus state");
        state.nodes.get(&self.uuid).is_some_and(|slot| slot.member)
    }

    fn current_view(&self) -> Option<View> {
        let state = self.bus.state.lock().expect("bus state");
        if !state.nodes.get(&self.uuid).is_some_and(|slot| slot.member) {
            return None;
        }
        let members = Bus::members(&state);
        Some(Bus::view_for(&members, state.view_id, self.uuid))
    }

    fn set_event_listener(&self, listener: Arc<dyn GcsEventListener>) {
        let mut state = self.bus.state.lock().expect("bus state");
        if let Some(slot) = state.nodes.get_mut(&self.uuid) {
            slot.listener = Some(listener);
        }
    }

    fn set_exchangeable_data(&self, data: Bytes) {
        let mut state = self.bus.state.lock().expect("bus state");
        if let Some(slot) = state.nodes.get_mut(&self.uuid) {
            slot.exchanged = data;
        }
    }
}

impl GcsCommunication for GcsNode {
    fn broadcast(&self, payload: Payload, data: Bytes) -> Result<(), GcsError> {
        self.bus.broadcast(self.uuid, payload, data)
    }
}

/// Control stub for tests that drive the applier module directly.
pub struct NullControl;

impl GcsControl for NullControl {
    fn join(&self, _group: Uuid) -> Result<(), GcsError> {
        Ok(())
    }

    fn leave(&self) -> Result<(), GcsError> {
        Ok(())
    }

    fn belongs_to_group(&self) -> bool {
        false
    }

    fn current_view(&self) -> Option<View> {
        None
    }

    fn set_event_listener(&self, _listener: Arc<dyn GcsEventListener>) {}

    fn set_exchangeable_data(&self, _data: Bytes) {}
}

// ---------------------------------------------------------------------------
// Scripted engine

/// Resolves donor addresses to their engines.
#[derive(Default)]
pub struct Directory {
    engines: Mutex<BTreeMap<(String, u16), Arc<FakeEngine>>>,
}

impl Directory {
    fn insert(&self, host: String, port: u16, engine: Arc<FakeEngine>) {
        self.engines
            .lock()
            .expect("directory")
            .insert((host, port), engine);
    }

    fn resolve(&self, host: &str, port: u16) -> Option<Arc<FakeEngine>> {
        self.engines
            .lock()
            .expect("directory")
            .get(&(host.to_string(), port))
            .cloned()
    }
}

#[derive(Default)]
struct ChannelState {
    params: Option<ConnectionParams>,
    until: Option<(u64, Arc<dyn SnapshotSink>)>,
    io_running: bool,
    sql_running: bool,
    log: Vec<Bytes>,
    last_delivered: Gno,
    streamed: usize,
}

pub struct FakeChannel {
    name: String,
    engine: Weak<FakeEngine>,
    state: Arc<Mutex<ChannelState>>,
}

impl FakeChannel {
    /// Frames queued to this channel's relay log, in order. Donors stream
    /// from here.
    pub fn log(&self) -> Vec<Bytes> {
        self.state.lock().expect("channel state").log.clone()
    }

    fn stream_from_donor(&self, donor: Arc<FakeEngine>) {
        let engine = self.engine.clone();
        let state = Arc::clone(&self.state);
        thread::spawn(move || {
            loop {
                let (stalled, frames, until) = {
                    let guard = state.lock().expect("channel state");
                    if !guard.io_running {
                        return;
                    }
                    if donor.stalled.load(Ordering::SeqCst) {
                        (true, Vec::new(), None)
                    } else {
                        let donor_log = donor.applier_log();
                        let frames = donor_log[guard.streamed.min(donor_log.len())..].to_vec();
                        (false, frames, guard.until.clone())
                    }
                };

                if stalled {
                    thread::sleep(Duration::from_millis(5));
                    continue;
                }

                for frame in frames {
                    {
                        let mut guard = state.lock().expect("channel state");
                        if !guard.io_running {
                            return;
                        }
                        guard.streamed += 1;
                    }
                    let event = decode_event(&frame).expect("donor stream frame");
                    if let Some(engine) = engine.upgrade() {
                        engine.apply_streamed_event(&event);
                    }
                    if let (
                        EventKind::ViewChange { view_id, snapshot },
                        Some((until_id, sink)),
                    ) = (&event, &until)
                        && view_id == until_id
                    {
                        sink.deliver(snapshot.clone().unwrap_or_else(|| {
                            CertificationSnapshot {
                                db: BTreeMap::new(),
                                next_seqno: Gno::ONE,
                            }
                        }));
                        let mut guard = state.lock().expect("channel state");
                        guard.io_running = false;
                        guard.sql_running = false;
                        return;
                    }
                }
                thread::sleep(Duration::from_millis(5));
            }
        });
    }
}

impl ReplicationChannel for FakeChannel {
    fn initialize_repositories(&self) -> Result<(), EngineError> {
        Ok(())
    }

    fn initialize_connection_parameters(
        &self,
        params: &ConnectionParams,
    ) -> Result<(), EngineError> {
        self.state.lock().expect("channel state").params = Some(params.clone());
        Ok(())
    }

    fn initialize_view_id_until_condition(
        &self,
        view_id: u64,
        sink: Arc<dyn SnapshotSink>,
    ) -> Result<(), EngineError> {
        self.state.lock().expect("channel state").until = Some((view_id, sink));
        Ok(())
    }

    fn start_replication_threads(&self, mask: ThreadMask, _wait: bool) -> Result<(), EngineError> {
        if self.name == gcs_replication::engine::APPLIER_CHANNEL {
            self.state.lock().expect("channel state").sql_running = true;
            return Ok(());
        }

        let engine = self.engine.upgrade().ok_or(EngineError::Rejected {
            reason: "engine gone".to_string(),
        })?;
        let params = self
            .state
            .lock()
            .expect("channel state")
            .params
            .clone()
            .ok_or(EngineError::DonorConnect {
                reason: "no connection parameters".to_string(),
            })?;
        let donor = engine
            .directory
            .lock()
            .expect("engine directory")
            .upgrade()
            .and_then(|directory| directory.resolve(&params.host, params.port))
            .ok_or_else(|| EngineError::DonorConnect {
                reason: format!("unknown donor {}:{}", params.host, params.port),
            })?;
        if donor.refuse_donor_connections.load(Ordering::SeqCst) {
            return Err(EngineError::DonorConnect {
                reason: "donor refused the connection".to_string(),
            });
        }

        {
            let mut state = self.state.lock().expect("channel state");
            state.io_running = true;
            if mask.includes_applier() {
                state.sql_running = true;
            }
        }
        self.stream_from_donor(donor);
        Ok(())
    }

    fn stop_threads(&self, _force: bool, mask: ThreadMask) -> Result<(), EngineError> {
        let mut state = self.state.lock().expect("channel state");
        if mask.includes_receiver() {
            state.io_running = false;
        }
        if mask.includes_applier() {
            state.sql_running = false;
        }
        Ok(())
    }

    fn purge_relay_logs(&self) -> Result<(), EngineError> {
        let mut state = self.state.lock().expect("channel state");
        state.log.clear();
        state.streamed = 0;
        Ok(())
    }

    fn purge_master_info(&self) -> Result<(), EngineError> {
        self.state.lock().expect("channel state").params = None;
        Ok(())
    }

    fn clean_thread_repositories(&self) -> Result<(), EngineError> {
        Ok(())
    }

    fn is_io_thread_running(&self) -> bool {
        self.state.lock().expect("channel state").io_running
    }

    fn is_sql_thread_running(&self) -> bool {
        self.state.lock().expect("channel state").sql_running
    }

    fn is_own_event_channel(&self, _thread_id: u64) -> bool {
        false
    }

    fn last_delivered_gno(&self, _sid: Uuid) -> Result<Gno, EngineError> {
        Ok(self.state.lock().expect("channel state").last_delivered)
    }

    fn queue_event(&self, event: Bytes) -> Result<(), EngineError> {
        let engine = self.engine.upgrade().ok_or(EngineError::Rejected {
            reason: "engine gone".to_string(),
        })?;
        if let Some(delay) = *engine.slow_apply.lock().expect("slow apply") {
            thread::sleep(delay);
        }
        let decoded = decode_event(&event).map_err(|error| EngineError::Rejected {
            reason: error.to_string(),
        })?;
        {
            let mut state = self.state.lock().expect("channel state");
            state.log.push(event);
            if let EventKind::GidLog { gid } = &decoded {
                state.last_delivered = state.last_delivered.max(gid.gno);
            }
        }
        // Apply synchronously: the rig's SQL thread never lags.
        engine.apply_streamed_event(&decoded);
        Ok(())
    }

    fn wait_for_event_execution(&self, _timeout: Duration) -> Result<bool, EngineError> {
        Ok(true)
    }
}

pub struct FakeEngine {
    sid: Uuid,
    ready: AtomicBool,
    executed: Mutex<GnoSet>,
    outcomes: Mutex<Vec<(u64, CertificationOutcome)>>,
    channels: Mutex<BTreeMap<String, Arc<FakeChannel>>>,
    directory: Mutex<Weak<Directory>>,
    pub stalled: AtomicBool,
    pub refuse_donor_connections: AtomicBool,
    slow_apply: Mutex<Option<Duration>>,
}

impl FakeEngine {
    pub fn new(sid: Uuid) -> Arc<Self> {
        Arc::new(Self {
            sid,
            ready: AtomicBool::new(true),
            executed: Mutex::new(GnoSet::new(sid)),
            outcomes: Mutex::new(Vec::new()),
            channels: Mutex::new(BTreeMap::new()),
            directory: Mutex::new(Weak::new()),
            stalled: AtomicBool::new(false),
            refuse_donor_connections: AtomicBool::new(false),
            slow_apply: Mutex::new(None),
        })
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn set_slow_apply(&self, delay: Option<Duration>) {
        *self.slow_apply.lock().expect("slow apply") = delay;
    }

    pub fn executed(&self) -> GnoSet {
        self.executed.lock().expect("executed set").clone()
    }

    pub fn outcomes(&self) -> Vec<(u64, CertificationOutcome)> {
        self.outcomes.lock().expect("outcomes").clone()
    }

    pub fn channel(self: &Arc<Self>, name: &str) -> Arc<FakeChannel> {
        let mut channels = self.channels.lock().expect("channels");
        Arc::clone(channels.entry(name.to_string()).or_insert_with(|| {
            Arc::new(FakeChannel {
                name: name.to_string(),
                engine: Arc::downgrade(self),
                state: Arc::new(Mutex::new(ChannelState::default())),
            })
        }))
    }

    fn applier_log(self: &Arc<Self>) -> Vec<Bytes> {
        self.channel(gcs_replication::engine::APPLIER_CHANNEL).log()
    }

    fn apply_streamed_event(&self, event: &EventKind) {
        if let EventKind::GidLog { gid } = event
            && gid.sid == self.sid
        {
            self.executed.lock().expect("executed set").add(gid.gno);
        }
    }
}

// ---------------------------------------------------------------------------
// Cluster rig

pub struct NodeRig {
    pub uuid: Uuid,
    pub plugin: Arc<GcsReplication>,
    pub engine: Arc<FakeEngine>,
    pub gcs: Arc<GcsNode>,
}

impl NodeRig {
    pub fn executed(&self) -> GnoSet {
        self.engine.executed()
    }
}

pub struct Cluster {
    pub group: Uuid,
    pub bus: Arc<Bus>,
    pub directory: Arc<Directory>,
}

impl Cluster {
    pub fn new() -> Self {
        Self {
            group: Uuid::from_bytes([0xC1; 16]),
            bus: Bus::new(),
            directory: Arc::new(Directory::default()),
        }
    }

    pub fn config(&self) -> Config {
        Config {
            group_name: self.group.to_string(),
            ..Config::default()
        }
    }

    /// Builds a node, wires it to the bus and directory, and starts it
    /// (which joins the group).
    pub fn start_node(&self, tag: u8, config: Config) -> NodeRig {
        let rig = self.build_node(tag, config);
        rig.plugin.start().expect("plugin start");
        rig
    }

    /// Builds a node without starting it.
    pub fn build_node(&self, tag: u8, config: Config) -> NodeRig {
        let uuid = member_uuid(tag);
        let host = format!("node-{tag}");
        let port = 3306;

        let engine = FakeEngine::new(self.group);
        *engine.directory.lock().expect("engine directory") = Arc::downgrade(&self.directory);
        self.directory
            .insert(host.clone(), port, Arc::clone(&engine));

        self.bus.register(uuid, host.clone(), port);
        let gcs = Arc::new(GcsNode {
            bus: Arc::clone(&self.bus),
            uuid,
        });

        let plugin = GcsReplication::new(
            config,
            LocalServer { uuid, host, port },
            ArcEngine::wrap(&engine),
            Arc::clone(&gcs) as Arc<dyn GcsControl>,
            Arc::clone(&gcs) as Arc<dyn GcsCommunication>,
        )
        .expect("plugin construction");

        NodeRig {
            uuid,
            plugin,
            engine,
            gcs,
        }
    }
}

/// Adapter giving the engine trait access to the owning `Arc` so channel
/// handles can hold weak back-references.
pub struct ArcEngine {
    inner: Arc<FakeEngine>,
}

impl ArcEngine {
    pub fn wrap(inner: &Arc<FakeEngine>) -> Arc<dyn Engine> {
        Arc::new(Self {
            inner: Arc::clone(inner),
        })
    }
}

impl Engine for ArcEngine {
    fn is_ready(&self) -> bool {
        self.inner.ready.load(Ordering::SeqCst)
    }

    fn executed_set(&self, _sid: Uuid) -> Result<GnoSet, EngineError> {
        Ok(self.inner.executed())
    }

    fn encoded_executed_set(&self) -> Result<Bytes, EngineError> {
        Ok(Bytes::from(self.inner.executed().encode()))
    }

    fn last_executed_gno(&self, _sid: Uuid) -> Result<Gno, EngineError> {
        Ok(self.inner.executed().high_water())
    }

    fn set_transaction_ctx(
        &self,
        thread_id: u64,
        outcome: &CertificationOutcome,
    ) -> Result<(), EngineError> {
        // A committing originator executes under its assigned gid.
        if let CertificationOutcome::Commit(gid) = outcome
            && gid.sid == self.inner.sid
        {
            self.inner
                .executed
                .lock()
                .expect("executed set")
                .add(gid.gno);
        }
        self.inner
            .outcomes
            .lock()
            .expect("outcomes")
            .push((thread_id, *outcome));
        Ok(())
    }

    fn replication_channel(
        &self,
        name: &str,
    ) -> Result<Arc<dyn ReplicationChannel>, EngineError> {
        let channel: Arc<dyn ReplicationChannel> = self.inner.channel(name);
        Ok(channel)
    }
}
