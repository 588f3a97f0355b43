//! Message counters and the structured status record.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::core::Member;

/// Counters over group traffic, updated from the GCS event path.
#[derive(Debug, Default)]
pub struct MessageStats {
    messages_sent: AtomicU64,
    bytes_sent: AtomicU64,
    messages_received: AtomicU64,
    bytes_received: AtomicU64,
    min_message_length: AtomicU64,
    max_message_length: AtomicU64,
    last_message_timestamp: AtomicU64,
    view_changes: AtomicU64,
}

impl MessageStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_delivery(&self, len: usize) {
        let len = len as u64;
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(len, Ordering::Relaxed);
        self.max_message_length.fetch_max(len, Ordering::Relaxed);
        self.min_message_length
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some(if current == 0 { len } else { current.min(len) })
            })
            .ok();
        self.last_message_timestamp
            .store(unix_timestamp(), Ordering::Relaxed);
    }

    pub fn record_send(&self, len: usize) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(len as u64, Ordering::Relaxed);
    }

    pub fn record_view_change(&self) {
        self.view_changes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MessageCounters {
        MessageCounters {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            min_message_length: self.min_message_length.load(Ordering::Relaxed),
            max_message_length: self.max_message_length.load(Ordering::Relaxed),
            last_message_timestamp: self.last_message_timestamp.load(Ordering::Relaxed),
            view_changes: self.view_changes.load(Ordering::Relaxed),
        }
    }
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MessageCounters {
    pub messages_sent: u64,
    pub bytes_sent: u64,
    pub messages_received: u64,
    pub bytes_received: u64,
    pub min_message_length: u64,
    pub max_message_length: u64,
    pub last_message_timestamp: u64,
    pub view_changes: u64,
}

/// Applier thread state as exposed to operators.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplierState {
    NotStarted,
    Running,
    Suspended,
    Stopped,
    Error,
}

/// Single structured status record for the whole plugin.
#[derive(Clone, Debug, Serialize)]
pub struct StatusRecord {
    pub running: bool,
    pub group_name: String,
    pub view_id: u64,
    pub members: Vec<Member>,
    pub applier_state: ApplierState,
    pub queue_depth: usize,
    pub counters: MessageCounters,
    pub positively_certified: u64,
    pub negatively_certified: u64,
    pub certification_db_size: usize,
    /// Rendered as `group:gno`; absent before the first positive
    /// certification.
    pub last_certified_gid: Option<String>,
    pub stable_set: Option<String>,
}

impl StatusRecord {
    /// Rendering used by the introspection surface.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("status record serializes")
    }
}
