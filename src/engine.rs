//! Interface to the host database engine.
//!
//! The engine owns transaction execution, the executed-set bookkeeping and
//! the relay-log-backed replication channels this core drives. Two channels
//! exist: `sql_applier` for the main apply path and `gcs_recovery` for the
//! donor stream.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use uuid::Uuid;

use crate::core::{CertificationSnapshot, Gno, GnoSet};
use crate::latch::CertificationOutcome;

pub const APPLIER_CHANNEL: &str = "sql_applier";
pub const RECOVERY_CHANNEL: &str = "gcs_recovery";

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("relay log initialization failed for channel `{channel}`: {reason}")]
    RelayLogInit { channel: String, reason: String },
    #[error("replication threads failed to start: {reason}")]
    ThreadStart { reason: String },
    #[error("replication threads failed to stop: {reason}")]
    ThreadStop { reason: String },
    #[error("donor connection failed: {reason}")]
    DonorConnect { reason: String },
    #[error("unknown replication channel `{channel}`")]
    UnknownChannel { channel: String },
    #[error("engine rejected the operation: {reason}")]
    Rejected { reason: String },
}

/// Which replication threads an operation addresses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadMask {
    Receiver,
    Applier,
    Both,
}

impl ThreadMask {
    pub fn includes_receiver(self) -> bool {
        matches!(self, ThreadMask::Receiver | ThreadMask::Both)
    }

    pub fn includes_applier(self) -> bool {
        matches!(self, ThreadMask::Applier | ThreadMask::Both)
    }
}

/// Connection parameters for a donor stream.
#[derive(Clone, Debug)]
pub struct ConnectionParams {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub use_ssl: bool,
    pub heartbeat_period: Duration,
}

/// Receives the certification snapshot attached to a streamed view-change
/// marker. Registered by recovery before the donor threads start.
pub trait SnapshotSink: Send + Sync {
    fn deliver(&self, snapshot: CertificationSnapshot);
}

/// One relay-log-backed replication channel of the engine.
pub trait ReplicationChannel: Send + Sync {
    fn initialize_repositories(&self) -> Result<(), EngineError>;
    fn initialize_connection_parameters(&self, params: &ConnectionParams)
    -> Result<(), EngineError>;
    /// Arms the until-condition: the apply thread stops after executing the
    /// view-change marker for `view_id`, handing its snapshot to `sink`.
    fn initialize_view_id_until_condition(
        &self,
        view_id: u64,
        sink: Arc<dyn SnapshotSink>,
    ) -> Result<(), EngineError>;
    fn start_replication_threads(&self, mask: ThreadMask, wait: bool) -> Result<(), EngineError>;
    fn stop_threads(&self, force: bool, mask: ThreadMask) -> Result<(), EngineError>;
    fn purge_relay_logs(&self) -> Result<(), EngineError>;
    fn purge_master_info(&self) -> Result<(), EngineError>;
    fn clean_thread_repositories(&self) -> Result<(), EngineError>;
    fn is_io_thread_running(&self) -> bool;
    fn is_sql_thread_running(&self) -> bool;
    fn is_own_event_channel(&self, thread_id: u64) -> bool;
    /// Last gno queued to this channel's relay log under `sid`.
    fn last_delivered_gno(&self, sid: Uuid) -> Result<Gno, EngineError>;
    /// Appends one framed event to the channel's relay log for execution.
    fn queue_event(&self, event: Bytes) -> Result<(), EngineError>;
    /// Returns true when every queued event has finished executing before
    /// the timeout, false on timeout.
    fn wait_for_event_execution(&self, timeout: Duration) -> Result<bool, EngineError>;
}

/// Engine-global surface the core consumes.
pub trait Engine: Send + Sync {
    fn is_ready(&self) -> bool;
    fn executed_set(&self, sid: Uuid) -> Result<GnoSet, EngineError>;
    /// Executed set in the engine's opaque encoding, as broadcast to the
    /// group. Must round-trip through `GnoSet::decode`.
    fn encoded_executed_set(&self) -> Result<Bytes, EngineError>;
    fn last_executed_gno(&self, sid: Uuid) -> Result<Gno, EngineError>;
    /// Commits or rolls back the originating session's transaction context.
    fn set_transaction_ctx(
        &self,
        thread_id: u64,
        outcome: &CertificationOutcome,
    ) -> Result<(), EngineError>;
    fn replication_channel(&self, name: &str) -> Result<Arc<dyn ReplicationChannel>, EngineError>;
}
