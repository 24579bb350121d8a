//! Waiting for long-running control-plane tasks.
//!
//! Polling is written against a [`Clock`] so tests can drive time by hand
//! instead of sleeping for real.

use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use breakfix_core::TaskId;
use serde::Deserialize;

use crate::config::{DEFAULT_POLL_INTERVAL, DEFAULT_TASK_TIMEOUT};
use crate::HypervisorError;

/// Source of time for polling loops.
#[async_trait]
pub trait Clock: Send + Sync {
    /// Current instant.
    fn now(&self) -> Instant;

    /// Suspend for `duration`.
    async fn sleep(&self, duration: Duration);
}

/// Wall-clock time via Tokio.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// A clock that only advances when slept on. Sleeping yields to the
/// scheduler once so other tasks still make progress.
#[derive(Debug)]
pub struct ManualClock {
    start: Instant,
    elapsed: Mutex<Duration>,
}

impl ManualClock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            elapsed: Mutex::new(Duration::ZERO),
        }
    }

    /// Total simulated time slept so far.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        *self
            .elapsed
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.start + self.elapsed()
    }

    async fn sleep(&self, duration: Duration) {
        {
            let mut elapsed = self
                .elapsed
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            *elapsed += duration;
        }
        tokio::task::yield_now().await;
    }
}

/// Raw task status as reported by the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TaskStatus {
    /// `running` or `stopped`.
    pub status: String,
    /// Present once stopped; `OK` on success.
    #[serde(default, rename = "exitstatus")]
    pub exit_status: Option<String>,
}

impl TaskStatus {
    #[must_use]
    pub fn running() -> Self {
        Self {
            status: "running".to_owned(),
            exit_status: None,
        }
    }

    #[must_use]
    pub fn stopped(exit_status: impl Into<String>) -> Self {
        Self {
            status: "stopped".to_owned(),
            exit_status: Some(exit_status.into()),
        }
    }

    /// `Ok(true)` when finished successfully, `Ok(false)` while running.
    ///
    /// # Errors
    /// Returns [`HypervisorError::TaskFailed`] for any other terminal status.
    pub fn settle(&self, task_id: &TaskId) -> Result<bool, HypervisorError> {
        if self.status != "stopped" {
            return Ok(false);
        }
        match self.exit_status.as_deref() {
            Some("OK") => Ok(true),
            other => Err(HypervisorError::TaskFailed {
                task_id: task_id.clone(),
                exit_status: other.unwrap_or("<none>").to_owned(),
            }),
        }
    }
}

/// Polls a long-running operation until it settles or the budget runs out.
#[derive(Debug)]
pub struct TaskWaiter<C: Clock = TokioClock> {
    clock: C,
    interval: Duration,
    timeout: Duration,
}

impl Default for TaskWaiter<TokioClock> {
    fn default() -> Self {
        Self::new(TokioClock, DEFAULT_POLL_INTERVAL, DEFAULT_TASK_TIMEOUT)
    }
}

impl<C: Clock> TaskWaiter<C> {
    #[must_use]
    pub fn new(clock: C, interval: Duration, timeout: Duration) -> Self {
        Self {
            clock,
            interval,
            timeout,
        }
    }

    /// The configured budget.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Call `poll` every interval until it yields `Some`, an error, or the
    /// budget elapses.
    ///
    /// # Errors
    /// Propagates poll errors; returns [`HypervisorError::TaskTimeout`] once
    /// the budget is spent.
    pub async fn wait<T, F, Fut>(&self, task_id: &TaskId, mut poll: F) -> Result<T, HypervisorError>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<Option<T>, HypervisorError>> + Send,
        T: Send,
    {
        let started = self.clock.now();
        loop {
            if let Some(done) = poll().await? {
                return Ok(done);
            }

            let waited = self.clock.now().saturating_duration_since(started);
            if waited >= self.timeout {
                return Err(HypervisorError::TaskTimeout {
                    task_id: task_id.clone(),
                    waited,
                });
            }

            tracing::debug!(task = %task_id, waited_ms = waited.as_millis(), "task still running");
            self.clock.sleep(self.interval.min(self.timeout - waited)).await;
        }
    }

    /// Poll a control-plane task status until it is stopped.
    ///
    /// # Errors
    /// Returns [`HypervisorError::TaskFailed`] for a non-OK exit status and
    /// [`HypervisorError::TaskTimeout`] past the budget.
    pub async fn wait_for_status<F, Fut>(&self, task_id: &TaskId, mut status: F) -> Result<(), HypervisorError>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<TaskStatus, HypervisorError>> + Send,
    {
        self.wait(task_id, || {
            let fut = status();
            async move {
                let current = fut.await?;
                Ok(current.settle(task_id)?.then_some(()))
            }
        })
        .await
    }
}
