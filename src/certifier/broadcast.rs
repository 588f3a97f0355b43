//! Periodic broadcast of the local executed-transaction set.

use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use crate::config::BroadcastFailurePolicy;
use crate::core::{MemberRegistry, MemberStatus};
use crate::engine::Engine;
use crate::gcs::{GcsCommunication, Payload};

use super::CertifierError;

/// Interfaces the broadcaster ticks against, supplied once the GCS layer is
/// up.
pub struct BroadcastContext {
    pub gcs: Arc<dyn GcsCommunication>,
    pub engine: Arc<dyn Engine>,
    pub registry: Arc<MemberRegistry>,
}

impl std::fmt::Debug for BroadcastContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastContext").finish_non_exhaustive()
    }
}

#[derive(Default)]
struct BroadcasterFlags {
    aborted: bool,
    running: bool,
}

struct BroadcasterShared {
    period: Duration,
    policy: BroadcastFailurePolicy,
    context: Mutex<Option<BroadcastContext>>,
    flags: Mutex<BroadcasterFlags>,
    cond: Condvar,
}

/// Timer thread publishing this node's executed set every period while the
/// local member is online. Failures are logged and retried next tick.
pub struct CertifierBroadcaster {
    shared: Arc<BroadcasterShared>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl CertifierBroadcaster {
    pub fn new(period: Duration, policy: BroadcastFailurePolicy) -> Self {
        Self {
            shared: Arc::new(BroadcasterShared {
                period,
                policy,
                context: Mutex::new(None),
                flags: Mutex::new(BroadcasterFlags::default()),
                cond: Condvar::new(),
            }),
            handle: Mutex::new(None),
        }
    }

    pub fn set_context(&self, context: BroadcastContext) {
        *self
            .shared
            .context
            .lock()
            .expect("broadcaster context lock poisoned") = Some(context);
    }

    /// Starts the dispatcher thread; returns once it has published RUNNING.
    /// Idempotent while the thread is alive.
    pub fn start(&self) {
        let mut flags = self.lock_flags();
        if flags.running {
            return;
        }
        flags.aborted = false;
        drop(flags);

        let shared = Arc::clone(&self.shared);
        let handle = thread::spawn(move || dispatcher(shared));
        *self.handle.lock().expect("broadcaster handle lock poisoned") = Some(handle);

        let mut flags = self.lock_flags();
        while !flags.running {
            flags = self
                .shared
                .cond
                .wait(flags)
                .expect("broadcaster flags lock poisoned");
        }
    }

    /// Cooperative stop: abort flag plus wakeup, then a bounded wait for the
    /// thread to publish NOT RUNNING. Idempotent once stopped.
    pub fn terminate(&self, timeout: Duration) -> Result<(), CertifierError> {
        {
            let mut flags = self.lock_flags();
            if !flags.running {
                return Ok(());
            }
            flags.aborted = true;
            self.shared.cond.notify_all();

            let mut remaining = timeout;
            while flags.running {
                let slice = remaining.min(Duration::from_secs(2));
                let (next, wait) = self
                    .shared
                    .cond
                    .wait_timeout(flags, slice)
                    .expect("broadcaster flags lock poisoned");
                flags = next;
                if wait.timed_out() {
                    remaining = remaining.saturating_sub(slice);
                    if remaining.is_zero() && flags.running {
                        return Err(CertifierError::BroadcasterStopTimeout);
                    }
                }
            }
        }

        if let Some(handle) = self
            .handle
            .lock()
            .expect("broadcaster handle lock poisoned")
            .take()
        {
            let _ = handle.join();
        }
        Ok(())
    }

    fn lock_flags(&self) -> std::sync::MutexGuard<'_, BroadcasterFlags> {
        self.shared
            .flags
            .lock()
            .expect("broadcaster flags lock poisoned")
    }
}

fn dispatcher(shared: Arc<BroadcasterShared>) {
    {
        let mut flags = shared.flags.lock().expect("broadcaster flags lock poisoned");
        flags.running = true;
        shared.cond.notify_all();
    }

    loop {
        {
            let flags = shared.flags.lock().expect("broadcaster flags lock poisoned");
            if flags.aborted {
                break;
            }
        }

        broadcast_executed_set(&shared);

        let flags = shared.flags.lock().expect("broadcaster flags lock poisoned");
        if flags.aborted {
            break;
        }
        let (flags, _) = shared
            .cond
            .wait_timeout(flags, shared.period)
            .expect("broadcaster flags lock poisoned");
        drop(flags);
    }

    let mut flags = shared.flags.lock().expect("broadcaster flags lock poisoned");
    flags.running = false;
    shared.cond.notify_all();
}

fn broadcast_executed_set(shared: &BroadcasterShared) {
    let context = shared
        .context
        .lock()
        .expect("broadcaster context lock poisoned");
    let Some(context) = context.as_ref() else {
        return;
    };

    // Only broadcast while online.
    if context.registry.local_status() != MemberStatus::Online {
        return;
    }

    let encoded = match context.engine.encoded_executed_set() {
        Ok(encoded) => encoded,
        Err(error) => {
            tracing::warn!(%error, "could not encode the executed set for broadcast");
            return;
        }
    };

    if let Err(error) = context
        .gcs
        .broadcast(Payload::CertificationEvent, encoded)
    {
        match shared.policy {
            BroadcastFailurePolicy::Ignore => {
                tracing::debug!(%error, "stable set broadcast failed; retrying next tick");
            }
            BroadcastFailurePolicy::Offline => {
                tracing::warn!(%error,
                    "stable set broadcast failed; marking the local member offline");
                context
                    .registry
                    .set_status(context.registry.local_uuid(), MemberStatus::Offline);
            }
        }
    }
}
