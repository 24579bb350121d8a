//! Strict FIFO, concurrency-1 admission gate for hypervisor-mutating work.
//!
//! The control plane misbehaves under overlapping mutations (racing
//! next-id allocation, task-id collisions), so every clone, snapshot,
//! rollback and power sequence runs inside a unit admitted here.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::{mpsc, oneshot};

use crate::QueueError;

type Unit = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

#[derive(Debug, Default)]
struct Counters {
    admitted: AtomicUsize,
    pending: AtomicUsize,
}

/// Process-wide serialized task queue.
///
/// Construct once at startup (inside a Tokio runtime) and share by cloning.
/// The worker exits once every clone has been dropped and the backlog has
/// drained. The backlog is unbounded.
#[derive(Debug, Clone)]
pub struct TaskQueue {
    tx: mpsc::UnboundedSender<Unit>,
    counters: Arc<Counters>,
}

impl TaskQueue {
    /// Spawn the worker and return a handle to it.
    ///
    /// # Panics
    /// Panics if called outside a Tokio runtime.
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let counters = Arc::new(Counters::default());
        tokio::spawn(run_worker(rx, Arc::clone(&counters)));
        Self { tx, counters }
    }

    /// Admit `unit`. It runs after every previously admitted unit has
    /// finished; the returned handle resolves with its output.
    ///
    /// Admission happens in this call, so the order of `add` calls is the
    /// execution order even if the handles are awaited out of order.
    pub fn add<Fut, T>(&self, unit: Fut) -> UnitHandle<T>
    where
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        let boxed: Unit = Box::pin(async move {
            let out = unit.await;
            // Submitter may have stopped waiting.
            let _ = done_tx.send(out);
        });

        let seq = self.counters.admitted.fetch_add(1, Ordering::SeqCst);
        self.counters.pending.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(boxed).is_err() {
            // Worker gone; dropping the unit drops `done_tx`, so the handle
            // resolves to `UnitAborted`.
            self.counters.pending.fetch_sub(1, Ordering::SeqCst);
            tracing::error!(seq, "task queue worker is gone; unit rejected");
        } else {
            tracing::debug!(seq, "unit admitted to task queue");
        }

        UnitHandle { rx: done_rx }
    }

    /// Units admitted but not yet finished, including the running one.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.counters.pending.load(Ordering::SeqCst)
    }

    /// Total units ever admitted.
    #[must_use]
    pub fn admitted(&self) -> usize {
        self.counters.admitted.load(Ordering::SeqCst)
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_worker(mut rx: mpsc::UnboundedReceiver<Unit>, counters: Arc<Counters>) {
    while let Some(unit) = rx.recv().await {
        // Run each unit as its own task so a panic is contained to it.
        if let Err(e) = tokio::spawn(unit).await {
            tracing::warn!(error = %e, "queued unit aborted");
        }
        counters.pending.fetch_sub(1, Ordering::SeqCst);
    }
    tracing::debug!("task queue worker stopped");
}

/// Resolves with the output of one admitted unit.
#[derive(Debug)]
#[must_use = "a unit handle does nothing unless awaited"]
pub struct UnitHandle<T> {
    rx: oneshot::Receiver<T>,
}

impl<T> Future for UnitHandle<T> {
    type Output = Result<T, QueueError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.map_err(|_| QueueError::UnitAborted))
    }
}
