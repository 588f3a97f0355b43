//! Interface to the group communication service.
//!
//! The GCS binding provides totally-ordered atomic broadcast and view
//! management; the core consumes it through these traits. Callback contexts
//! must not block on cluster-wide operations.

use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;
use uuid::Uuid;

use crate::Transience;
use crate::core::View;

#[derive(Debug, Error)]
pub enum GcsError {
    #[error("failed to join group {group}: {reason}")]
    Join { group: Uuid, reason: String },
    #[error("failed to leave the group: {reason}")]
    Leave { reason: String },
    #[error("broadcast failed: {reason}")]
    Broadcast { reason: String },
    #[error("not a member of any group")]
    NotInGroup,
}

impl GcsError {
    pub fn transience(&self) -> Transience {
        match self {
            GcsError::Join { .. } | GcsError::Broadcast { .. } => Transience::Retryable,
            GcsError::Leave { .. } => Transience::Unknown,
            GcsError::NotInGroup => Transience::Permanent,
        }
    }
}

/// Kind of a delivered or broadcast payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Payload {
    /// Opaque transaction-carrying payload, totally ordered.
    Transaction,
    /// A member's encoded executed-transaction set.
    CertificationEvent,
    /// Recovery control traffic (recovery-end announcements).
    Recovery,
}

/// Ordered message delivery and broadcast.
pub trait GcsCommunication: Send + Sync {
    fn broadcast(&self, payload: Payload, data: Bytes) -> Result<(), GcsError>;
}

/// Group membership control.
pub trait GcsControl: Send + Sync {
    fn join(&self, group: Uuid) -> Result<(), GcsError>;
    fn leave(&self) -> Result<(), GcsError>;
    fn belongs_to_group(&self) -> bool;
    fn current_view(&self) -> Option<View>;
    /// Registers the single event listener receiving deliveries, view
    /// installs and view-time data exchange.
    fn set_event_listener(&self, listener: Arc<dyn GcsEventListener>);
    /// Data shipped to other members when the next view installs.
    fn set_exchangeable_data(&self, data: Bytes);
}

/// Callbacks invoked by the binding. Bounded work only: push into queues or
/// update in-memory state under short-held locks.
pub trait GcsEventListener: Send + Sync {
    fn on_message(&self, payload: Payload, data: Bytes, origin: Uuid);
    /// `left` and `joined` are relative to the previously installed view.
    fn on_view(&self, view: View, left: &[Uuid], joined: &[Uuid]);
    fn on_exchanged_data(&self, member: Uuid, data: Bytes);
}
