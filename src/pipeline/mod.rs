//! Composable handler chain the applier pushes every event through.
//!
//! A pipeline is an ordered list of handlers, each tagged with a role. An
//! event travels head to tail with exclusive ownership; a handler either
//! forwards it (possibly rewritten) or completes the traversal by signaling
//! the continuation. Control-plane actions walk the same chain.

mod cataloger;
mod certification;
mod sql_applier;

use std::fmt;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::certifier::{BroadcastContext, Certifier, CertifierError};
use crate::config::PipelineSpec;
use crate::core::{CertificationSnapshot, EventDecodeError, EventKind, Gno};
use crate::engine::{Engine, EngineError};
use crate::latch::{CertificationLatch, LatchError};

pub use cataloger::EventCataloger;
pub use certification::CertificationHandler;
pub use sql_applier::SqlApplierHandler;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("two unique handlers with role {role} in one pipeline")]
    DuplicateUniqueRole { role: HandlerRole },
    #[error("event could not be decoded: {0}")]
    Decode(#[from] EventDecodeError),
    #[error(transparent)]
    Certifier(#[from] CertifierError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("certification outcome could not be delivered: {0}")]
    Latch(#[from] LatchError),
    #[error("gid-log event arrived without a preceding transaction context")]
    MissingTransactionContext,
    #[error("apply handler received an event before its configuration")]
    ApplierNotConfigured,
}

impl PipelineError {
    /// Fatal failures make the applier thread exit and the node leave the
    /// group; the rest are logged and the applier continues.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PipelineError::Decode(_) | PipelineError::MissingTransactionContext
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandlerRole {
    EventCataloger,
    Certifier,
    Applier,
}

impl fmt::Display for HandlerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HandlerRole::EventCataloger => "event_cataloger",
            HandlerRole::Certifier => "certifier",
            HandlerRole::Applier => "applier",
        };
        f.write_str(name)
    }
}

/// What a handler did with an event.
#[derive(Debug)]
pub enum EventFlow {
    /// Pass the (possibly rewritten) event to the next handler.
    Forward(EventKind),
    /// Traversal complete; the handler signaled the continuation.
    Done,
}

/// What a handler did with an action.
pub enum ActionFlow {
    Forward,
    Consumed,
}

/// Control-plane messages walking the handler chain.
#[derive(Debug)]
pub enum PipelineAction {
    Start,
    Stop,
    ApplierConfig {
        reset_logs: bool,
        stop_timeout: Duration,
        cluster_sid: Uuid,
        /// Filled by the apply handler: last gno already queued to its
        /// relay log.
        last_queued_gno: Option<Gno>,
    },
    CertifierConfig {
        last_executed_gno: Gno,
        last_delivered_gno: Gno,
        cluster_sid: Uuid,
    },
    InstallCertificationSnapshot {
        snapshot: CertificationSnapshot,
    },
    ViewChange {
        leaving: bool,
    },
    GcsInterfaces {
        context: Option<BroadcastContext>,
    },
}

pub trait EventHandler: Send {
    fn role(&self) -> HandlerRole;
    fn is_unique(&self) -> bool {
        true
    }
    fn initialize(&mut self) -> Result<(), PipelineError> {
        Ok(())
    }
    fn terminate(&mut self) -> Result<(), PipelineError> {
        Ok(())
    }
    fn handle_event(
        &mut self,
        event: EventKind,
        cont: &Continuation,
    ) -> Result<EventFlow, PipelineError>;
    fn handle_action(&mut self, action: &mut PipelineAction)
    -> Result<ActionFlow, PipelineError>;
}

#[derive(Default)]
struct ContinuationState {
    signaled: Option<(Result<(), PipelineError>, bool)>,
}

/// Single-shot rendezvous for one pipeline traversal: the completing
/// handler signals, the injecting thread waits. Reusable after each wait.
#[derive(Default)]
pub struct Continuation {
    state: Mutex<ContinuationState>,
    cond: Condvar,
}

impl Continuation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signal(&self, result: Result<(), PipelineError>, transaction_discarded: bool) {
        let mut state = self.lock();
        // Exactly one signal per traversal; keep the first.
        if state.signaled.is_none() {
            state.signaled = Some((result, transaction_discarded));
        }
        self.cond.notify_all();
    }

    /// Blocks until the traversal signals; returns whether the transaction
    /// was discarded. Consumes the signal, resetting for the next event.
    pub fn wait(&self) -> Result<bool, PipelineError> {
        let mut state = self.lock();
        loop {
            if let Some((result, discarded)) = state.signaled.take() {
                return result.map(|_| discarded);
            }
            state = self.cond.wait(state).expect("continuation lock poisoned");
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ContinuationState> {
        self.state.lock().expect("continuation lock poisoned")
    }
}

/// Ordered handler chain.
pub struct Pipeline {
    handlers: Vec<Box<dyn EventHandler>>,
}

impl Pipeline {
    /// Injects one event at the head. The traversal always signals the
    /// continuation, also on error.
    pub fn handle_event(&mut self, event: EventKind, cont: &Continuation) {
        let mut current = event;
        for handler in &mut self.handlers {
            match handler.handle_event(current, cont) {
                Ok(EventFlow::Forward(next)) => current = next,
                Ok(EventFlow::Done) => return,
                Err(error) => {
                    cont.signal(Err(error), false);
                    return;
                }
            }
        }
        // Ran off the tail; no handler claimed the event.
        cont.signal(Ok(()), false);
    }

    pub fn handle_action(&mut self, action: &mut PipelineAction) -> Result<(), PipelineError> {
        for handler in &mut self.handlers {
            match handler.handle_action(action)? {
                ActionFlow::Forward => continue,
                ActionFlow::Consumed => break,
            }
        }
        Ok(())
    }

    pub fn terminate(&mut self) -> Result<(), PipelineError> {
        for handler in &mut self.handlers {
            handler.terminate()?;
        }
        Ok(())
    }
}

/// Everything the concrete handlers need at construction time.
pub struct PipelineContext {
    pub certifier: Arc<Certifier>,
    pub latch: Arc<CertificationLatch>,
    pub engine: Arc<dyn Engine>,
    pub local_uuid: Uuid,
}

/// Builds the handler chain for a named pipeline type, validating the
/// unique-role discipline and initializing every handler.
pub fn create_pipeline(
    spec: PipelineSpec,
    context: &PipelineContext,
) -> Result<Pipeline, PipelineError> {
    let handlers: Vec<Box<dyn EventHandler>> = match spec {
        PipelineSpec::Standard => vec![
            Box::new(EventCataloger::new()),
            Box::new(CertificationHandler::new(
                Arc::clone(&context.certifier),
                Arc::clone(&context.latch),
                Arc::clone(&context.engine),
                context.local_uuid,
            )),
            Box::new(SqlApplierHandler::new(Arc::clone(&context.engine))),
        ],
    };
    build(handlers)
}

fn build(mut handlers: Vec<Box<dyn EventHandler>>) -> Result<Pipeline, PipelineError> {
    for (index, handler) in handlers.iter().enumerate() {
        if !handler.is_unique() {
            continue;
        }
        let role = handler.role();
        if handlers[..index].iter().any(|other| other.role() == role) {
            return Err(PipelineError::DuplicateUniqueRole { role });
        }
    }
    for handler in &mut handlers {
        handler.initialize()?;
    }
    Ok(Pipeline { handlers })
}

#[cfg(test)]
pub(crate) fn build_for_test(
    handlers: Vec<Box<dyn EventHandler>>,
) -> Result<Pipeline, PipelineError> {
    build(handlers)
}
