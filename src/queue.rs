//! Synchronized FIFO between callback contexts and worker threads.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, unbounded};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue disconnected")]
    Disconnected,
}

/// Unbounded multi-producer queue with a blocking single-consumer pop.
///
/// Producers are delivery callbacks and control paths; the consumer is a
/// worker thread. Out-of-band sentinels travel as ordinary items of the
/// element type, so a push is always enough to wake the consumer.
pub struct SynchronizedQueue<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
    len: Arc<AtomicUsize>,
}

impl<T> Clone for SynchronizedQueue<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
            len: Arc::clone(&self.len),
        }
    }
}

impl<T> Default for SynchronizedQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SynchronizedQueue<T> {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self {
            tx,
            rx,
            len: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn push(&self, item: T) {
        self.len.fetch_add(1, Ordering::SeqCst);
        // Send on an unbounded channel only fails when every receiver is
        // gone, and we hold one.
        self.tx.send(item).expect("queue receiver alive");
    }

    /// Blocks until an item is available.
    pub fn pop(&self) -> Result<T, QueueError> {
        match self.rx.recv() {
            Ok(item) => {
                self.len.fetch_sub(1, Ordering::SeqCst);
                Ok(item)
            }
            Err(_) => Err(QueueError::Disconnected),
        }
    }

    pub fn pop_timeout(&self, timeout: Duration) -> Result<Option<T>, QueueError> {
        match self.rx.recv_timeout(timeout) {
            Ok(item) => {
                self.len.fetch_sub(1, Ordering::SeqCst);
                Ok(Some(item))
            }
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(QueueError::Disconnected),
        }
    }

    pub fn try_pop(&self) -> Result<Option<T>, QueueError> {
        match self.rx.try_recv() {
            Ok(item) => {
                self.len.fetch_sub(1, Ordering::SeqCst);
                Ok(Some(item))
            }
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(QueueError::Disconnected),
        }
    }

    pub fn size(&self) -> usize {
        self.len.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }
}
