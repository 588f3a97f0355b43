//! Certifying pipeline stage.
//!
//! Decides the fate of each transaction, relabels positively certified
//! remote transactions with their cluster-assigned gid and attaches
//! certification snapshots to view-change events for donors.

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::certifier::{Certification, Certifier};
use crate::core::{EventKind, Gid, Gno, TransactionContext};
use crate::engine::Engine;
use crate::latch::{CertificationLatch, CertificationOutcome};

use super::{
    ActionFlow, Continuation, EventFlow, EventHandler, HandlerRole, PipelineAction, PipelineError,
};

/// Where the handler stands inside the current transaction.
enum TransactionMode {
    /// Between transactions, or forwarding a certified one.
    Pass,
    /// Positive remote certification: relabel the next gid-log with this
    /// gno.
    Rewrite(Gno),
    /// Local or negatively certified transaction: swallow its remaining
    /// events.
    Discard,
}

pub struct CertificationHandler {
    certifier: Arc<Certifier>,
    latch: Arc<CertificationLatch>,
    engine: Arc<dyn Engine>,
    local_uuid: Uuid,
    cluster_sid: Uuid,
    mode: TransactionMode,
    stop_timeout: Duration,
}

impl CertificationHandler {
    pub fn new(
        certifier: Arc<Certifier>,
        latch: Arc<CertificationLatch>,
        engine: Arc<dyn Engine>,
        local_uuid: Uuid,
    ) -> Self {
        Self {
            certifier,
            latch,
            engine,
            local_uuid,
            cluster_sid: Uuid::nil(),
            mode: TransactionMode::Pass,
            stop_timeout: Duration::from_secs(2),
        }
    }

    fn certify(
        &mut self,
        ctx: TransactionContext,
        cont: &Continuation,
    ) -> Result<EventFlow, PipelineError> {
        let certification = self
            .certifier
            .certify(ctx.snapshot_version, &ctx.write_set)?;

        if ctx.origin == self.local_uuid {
            // Local transaction: hand the outcome to the parked session
            // thread and end the pipeline for this transaction.
            let outcome = match certification {
                Certification::Positive(gno) => {
                    CertificationOutcome::Commit(Gid::new(self.cluster_sid, gno))
                }
                Certification::Negative => CertificationOutcome::Rollback,
            };
            self.engine.set_transaction_ctx(ctx.thread_id, &outcome)?;
            self.latch.release(ctx.thread_id, outcome)?;
            self.mode = TransactionMode::Discard;
            cont.signal(Ok(()), true);
            return Ok(EventFlow::Done);
        }

        match certification {
            Certification::Negative => {
                // Remote conflict: drop silently.
                self.mode = TransactionMode::Discard;
                cont.signal(Ok(()), true);
                Ok(EventFlow::Done)
            }
            Certification::Positive(gno) => {
                self.mode = TransactionMode::Rewrite(gno);
                Ok(EventFlow::Forward(EventKind::TransactionContext(ctx)))
            }
        }
    }

    fn relabel(
        &mut self,
        cont: &Continuation,
    ) -> Result<EventFlow, PipelineError> {
        match std::mem::replace(&mut self.mode, TransactionMode::Pass) {
            TransactionMode::Rewrite(gno) => Ok(EventFlow::Forward(EventKind::GidLog {
                gid: Gid::new(self.cluster_sid, gno),
            })),
            TransactionMode::Discard => {
                self.mode = TransactionMode::Discard;
                cont.signal(Ok(()), true);
                Ok(EventFlow::Done)
            }
            TransactionMode::Pass => Err(PipelineError::MissingTransactionContext),
        }
    }
}

impl EventHandler for CertificationHandler {
    fn role(&self) -> HandlerRole {
        HandlerRole::Certifier
    }

    fn handle_event(
        &mut self,
        event: EventKind,
        cont: &Continuation,
    ) -> Result<EventFlow, PipelineError> {
        match event {
            EventKind::TransactionContext(ctx) => self.certify(ctx, cont),
            EventKind::GidLog { .. } => self.relabel(cont),
            EventKind::ViewChange { view_id, .. } => {
                // Donors hand joiners the certification state as of this
                // view boundary.
                self.mode = TransactionMode::Pass;
                Ok(EventFlow::Forward(EventKind::ViewChange {
                    view_id,
                    snapshot: Some(self.certifier.certification_snapshot()),
                }))
            }
            passthrough @ EventKind::Passthrough(_) => match self.mode {
                TransactionMode::Discard => {
                    cont.signal(Ok(()), true);
                    Ok(EventFlow::Done)
                }
                _ => Ok(EventFlow::Forward(passthrough)),
            },
            raw @ EventKind::Raw(_) => Ok(EventFlow::Forward(raw)),
        }
    }

    fn handle_action(
        &mut self,
        action: &mut PipelineAction,
    ) -> Result<ActionFlow, PipelineError> {
        match action {
            PipelineAction::CertifierConfig {
                last_executed_gno,
                last_delivered_gno,
                cluster_sid,
            } => {
                self.cluster_sid = *cluster_sid;
                self.certifier.initialize(
                    *last_executed_gno,
                    *last_delivered_gno,
                    *cluster_sid,
                )?;
                Ok(ActionFlow::Consumed)
            }
            PipelineAction::InstallCertificationSnapshot { snapshot } => {
                self.certifier.install_snapshot(std::mem::take(snapshot));
                Ok(ActionFlow::Consumed)
            }
            PipelineAction::GcsInterfaces { context } => {
                if let Some(context) = context.take() {
                    self.certifier.set_broadcast_context(context);
                }
                Ok(ActionFlow::Consumed)
            }
            PipelineAction::ViewChange { leaving } => {
                self.certifier.handle_view_change();
                if *leaving {
                    // Leaving aborts whatever transaction was in flight.
                    self.mode = TransactionMode::Pass;
                }
                Ok(ActionFlow::Forward)
            }
            PipelineAction::ApplierConfig { stop_timeout, .. } => {
                self.stop_timeout = *stop_timeout;
                Ok(ActionFlow::Forward)
            }
            PipelineAction::Stop => {
                if let Err(error) = self.certifier.terminate(self.stop_timeout) {
                    tracing::warn!(%error, "certifier broadcaster did not stop cleanly");
                }
                Ok(ActionFlow::Forward)
            }
            PipelineAction::Start => Ok(ActionFlow::Forward),
        }
    }
}
