//! Conflict detection for optimistic snapshot-isolation replication.
//!
//! The certifier validates each delivered transaction's write-set against
//! the certification database: the mapping from item fingerprint to the last
//! sequence number that touched it. Positive certification assigns the next
//! monotonic sequence number; negative certification drops the transaction.
//! The stable set (transactions executed on every member) drives garbage
//! collection of the database.

mod broadcast;

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use uuid::Uuid;

use crate::Transience;
use crate::config::BroadcastFailurePolicy;
use crate::core::{CertificationSnapshot, Gno, GnoSet, GnoSetDecodeError, WriteSetItem};

pub use broadcast::{BroadcastContext, CertifierBroadcaster};

#[derive(Debug, Error)]
pub enum CertifierError {
    #[error("certifier is not initialized")]
    NotInitialized,
    #[error("malformed certification data from a member: {0}")]
    MalformedData(#[from] GnoSetDecodeError),
    #[error("broadcast thread failed to stop within the timeout")]
    BroadcasterStopTimeout,
}

impl CertifierError {
    pub fn transience(&self) -> Transience {
        match self {
            CertifierError::NotInitialized => Transience::Permanent,
            CertifierError::MalformedData(_) => Transience::Permanent,
            CertifierError::BroadcasterStopTimeout => Transience::Retryable,
        }
    }
}

/// Outcome of certifying one transaction. Negative is not an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Certification {
    Positive(Gno),
    Negative,
}

struct CertifierState {
    initialized: bool,
    cluster_sid: Uuid,
    next_seqno: Gno,
    last_positive: Option<Gno>,
    db: BTreeMap<WriteSetItem, Gno>,
    stable_set: GnoSet,
    /// Executed-set contributions of the current intersection round, keyed
    /// by member so a duplicate broadcast cannot complete a round early.
    incoming: BTreeMap<Uuid, Bytes>,
}

pub struct Certifier {
    state: Mutex<CertifierState>,
    positive_certified: AtomicU64,
    negative_certified: AtomicU64,
    broadcaster: CertifierBroadcaster,
}

impl Certifier {
    pub fn new(broadcast_period: Duration, broadcast_policy: BroadcastFailurePolicy) -> Self {
        Self {
            state: Mutex::new(CertifierState {
                initialized: false,
                cluster_sid: Uuid::nil(),
                next_seqno: Gno::ONE,
                last_positive: None,
                db: BTreeMap::new(),
                stable_set: GnoSet::new(Uuid::nil()),
                incoming: BTreeMap::new(),
            }),
            positive_certified: AtomicU64::new(0),
            negative_certified: AtomicU64::new(0),
            broadcaster: CertifierBroadcaster::new(broadcast_period, broadcast_policy),
        }
    }

    /// Arms certification and starts the stable-set broadcaster.
    ///
    /// `next_seqno` resumes from the furthest point the node has seen:
    /// either executed locally or already delivered to the apply channel.
    /// Re-initialization (a stop/start cycle) never moves it backwards.
    pub fn initialize(
        &self,
        last_executed_gno: Gno,
        last_delivered_gno: Gno,
        cluster_sid: Uuid,
    ) -> Result<(), CertifierError> {
        {
            let mut state = self.lock();
            let resumed = last_executed_gno.max(last_delivered_gno).next();
            state.next_seqno = state.next_seqno.max(resumed);
            if state.cluster_sid != cluster_sid {
                state.cluster_sid = cluster_sid;
                state.stable_set = GnoSet::new(cluster_sid);
            }
            state.initialized = true;
            tracing::debug!(
                next_seqno = %state.next_seqno,
                %last_executed_gno,
                %last_delivered_gno,
                "certifier initialized"
            );
        }
        self.broadcaster.start();
        Ok(())
    }

    /// Stops the broadcaster. Certification state survives until drop so a
    /// late status read stays coherent.
    pub fn terminate(&self, timeout: Duration) -> Result<(), CertifierError> {
        self.broadcaster.terminate(timeout)
    }

    /// Supplies the interfaces the broadcaster needs; before this call its
    /// ticks are no-ops.
    pub fn set_broadcast_context(&self, context: BroadcastContext) {
        self.broadcaster.set_context(context);
    }

    /// Certifies one transaction.
    ///
    /// Positive iff no write-set item was certified past the transaction's
    /// snapshot version; the database and `next_seqno` mutate only on the
    /// positive path, atomically under the certifier lock.
    pub fn certify(
        &self,
        snapshot_version: Gno,
        write_set: &[WriteSetItem],
    ) -> Result<Certification, CertifierError> {
        let mut state = self.lock();
        if !state.initialized {
            return Err(CertifierError::NotInitialized);
        }

        for item in write_set {
            let certified = state.db.get(item).copied().unwrap_or(Gno::ZERO);
            if certified > snapshot_version {
                drop(state);
                self.negative_certified.fetch_add(1, Ordering::Relaxed);
                return Ok(Certification::Negative);
            }
        }

        let gno = state.next_seqno;
        state.next_seqno = gno.next();
        state.last_positive = Some(gno);
        for item in write_set {
            state.db.insert(item.clone(), gno);
        }
        drop(state);
        self.positive_certified.fetch_add(1, Ordering::Relaxed);
        Ok(Certification::Positive(gno))
    }

    /// Atomic export of the certification state for donor use.
    pub fn certification_snapshot(&self) -> CertificationSnapshot {
        let state = self.lock();
        CertificationSnapshot {
            db: state.db.clone(),
            next_seqno: state.next_seqno,
        }
    }

    /// Replaces the certification state wholesale with a donor snapshot.
    /// Callers must hold the applier suspended.
    pub fn install_snapshot(&self, snapshot: CertificationSnapshot) {
        let mut state = self.lock();
        state.db = snapshot.db;
        state.next_seqno = snapshot.next_seqno;
        state.initialized = true;
        tracing::info!(next_seqno = %state.next_seqno, entries = state.db.len(),
            "certification snapshot installed");
    }

    /// Registers one member's encoded executed-set. Once every member of
    /// the current view has contributed, intersects the sets, merges the
    /// result into the stable set and garbage-collects the database.
    pub fn handle_certifier_data(
        &self,
        member_count: usize,
        origin: Uuid,
        payload: Bytes,
    ) -> Result<(), CertifierError> {
        let mut state = self.lock();
        if !state.initialized {
            return Err(CertifierError::NotInitialized);
        }
        state.incoming.insert(origin, payload);
        if member_count > 0 && state.incoming.len() >= member_count {
            return Self::stable_set_handle(&mut state);
        }
        Ok(())
    }

    /// Drops a half-complete intersection round.
    pub fn handle_view_change(&self) {
        self.lock().incoming.clear();
    }

    pub fn stable_set(&self) -> GnoSet {
        self.lock().stable_set.clone()
    }

    pub fn positive_certified(&self) -> u64 {
        self.positive_certified.load(Ordering::Relaxed)
    }

    pub fn negative_certified(&self) -> u64 {
        self.negative_certified.load(Ordering::Relaxed)
    }

    pub fn db_size(&self) -> usize {
        self.lock().db.len()
    }

    pub fn last_certified_gno(&self) -> Option<Gno> {
        self.lock().last_positive
    }

    pub fn is_initialized(&self) -> bool {
        self.lock().initialized
    }

    fn stable_set_handle(state: &mut CertifierState) -> Result<(), CertifierError> {
        let contributions = std::mem::take(&mut state.incoming);
        let mut executed: Option<GnoSet> = None;
        for payload in contributions.values() {
            let member_set = GnoSet::decode(payload)?;
            executed = Some(match executed {
                None => member_set,
                Some(current) => current.intersection(&member_set),
            });
        }
        let Some(executed) = executed else {
            return Ok(());
        };

        tracing::debug!(stable = %executed, "stable set intersection computed");
        state.stable_set.merge(&executed);
        Self::garbage_collect(state);
        Ok(())
    }

    /// Removes entries whose transaction is executed on every member. Any
    /// later transaction's snapshot already covers those items.
    fn garbage_collect(state: &mut CertifierState) {
        let stable = &state.stable_set;
        let before = state.db.len();
        state.db.retain(|_, gno| !stable.contains(*gno));
        if state.db.len() != before {
            tracing::debug!(
                removed = before - state.db.len(),
                remaining = state.db.len(),
                "certification database garbage collected"
            );
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CertifierState> {
        self.state.lock().expect("certifier lock poisoned")
    }
}
