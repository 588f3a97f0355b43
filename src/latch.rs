//! Rendezvous between originating session threads and the pipeline.
//!
//! A session thread registers its ticket before broadcasting a transaction,
//! then parks until the certification handler publishes the outcome. Each
//! registration observes exactly one outcome.

use std::collections::HashMap;
use std::sync::{Condvar, Mutex};

use thiserror::Error;

use crate::core::Gid;

/// What the session thread does with its transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CertificationOutcome {
    /// Positively certified: commit under this global identifier.
    Commit(Gid),
    /// Negatively certified: roll the transaction back.
    Rollback,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LatchError {
    #[error("thread {thread_id} is already registered")]
    AlreadyRegistered { thread_id: u64 },
    #[error("thread {thread_id} is not registered")]
    NotRegistered { thread_id: u64 },
    #[error("outcome for thread {thread_id} was already delivered")]
    AlreadyDelivered { thread_id: u64 },
}

enum Ticket {
    Waiting,
    Released(CertificationOutcome),
}

/// One-shot ticket per session thread id.
#[derive(Default)]
pub struct CertificationLatch {
    tickets: Mutex<HashMap<u64, Ticket>>,
    released: Condvar,
}

impl CertificationLatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, thread_id: u64) -> Result<(), LatchError> {
        let mut tickets = self.lock();
        if tickets.contains_key(&thread_id) {
            return Err(LatchError::AlreadyRegistered { thread_id });
        }
        tickets.insert(thread_id, Ticket::Waiting);
        Ok(())
    }

    /// Blocks until the outcome for `thread_id` is released, then consumes
    /// the ticket. Spurious wakeups re-check the ticket state.
    pub fn wait(&self, thread_id: u64) -> Result<CertificationOutcome, LatchError> {
        let mut tickets = self.lock();
        loop {
            match tickets.get(&thread_id) {
                None => return Err(LatchError::NotRegistered { thread_id }),
                Some(Ticket::Released(outcome)) => {
                    let outcome = *outcome;
                    tickets.remove(&thread_id);
                    return Ok(outcome);
                }
                Some(Ticket::Waiting) => {
                    tickets = self
                        .released
                        .wait(tickets)
                        .expect("certification latch lock poisoned");
                }
            }
        }
    }

    /// Publishes the outcome. A second release for the same ticket is an
    /// error and never overwrites the delivered outcome.
    pub fn release(
        &self,
        thread_id: u64,
        outcome: CertificationOutcome,
    ) -> Result<(), LatchError> {
        let mut tickets = self.lock();
        match tickets.get(&thread_id) {
            None => return Err(LatchError::NotRegistered { thread_id }),
            Some(Ticket::Released(_)) => {
                return Err(LatchError::AlreadyDelivered { thread_id });
            }
            Some(Ticket::Waiting) => {
                tickets.insert(thread_id, Ticket::Released(outcome));
            }
        }
        self.released.notify_all();
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Ticket>> {
        self.tickets
            .lock()
            .expect("certification latch lock poisoned")
    }
}
