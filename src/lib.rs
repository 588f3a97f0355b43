#![forbid(unsafe_code)]

pub mod applier;
pub mod certifier;
pub mod config;
pub mod core;
pub mod engine;
pub mod error;
pub mod gcs;
pub mod latch;
pub mod pipeline;
pub mod plugin;
pub mod queue;
pub mod recovery;
pub mod stats;

pub use error::{Effect, Error, Transience};
pub type Result<T> = std::result::Result<T, Error>;

// Re-export core types at crate root for convenience
pub use crate::core::{
    CertificationSnapshot, EventKind, Gid, Gno, GnoSet, Member, MemberRegistry, MemberStatus,
    View, ViewMember, WriteSetItem, decode_event, encode_event,
};
pub use crate::certifier::{Certification, Certifier};
pub use crate::config::{BroadcastFailurePolicy, Config, GcsProtocol, PipelineSpec};
pub use crate::latch::{CertificationLatch, CertificationOutcome};
pub use crate::plugin::{GcsReplication, LocalServer};
