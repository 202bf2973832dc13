//! "Run this work after a delay", the only scheduling capability the retry loop needs.
//!
//! Scheduling can fail immediately (the scheduler was shut down, no runtime is available), and
//! that failure is reported by [`DelayedScheduler::schedule`] itself, distinct from anything the
//! scheduled work does later. Shutting a scheduler down cancels work that has not run yet.
//!
//! Production code uses [`TokioScheduler`]; tests can inject [`TrackingScheduler`], which runs
//! work immediately and records the delays it was asked for.

use crate::ClientError;
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::{AbortHandle, JoinSet};

/// A unit of work handed to a scheduler.
pub type Work = BoxFuture<'static, ()>;

/// Delay-then-run scheduling abstraction.
pub trait DelayedScheduler: Send + Sync + std::fmt::Debug {
    /// Run `work` once `delay` has elapsed.
    fn schedule(&self, delay: Duration, work: Work) -> Result<ScheduledTask, ClientError>;

    /// Refuse new work and cancel work that has not finished.
    fn shutdown(&self);

    fn is_shut_down(&self) -> bool;
}

/// Handle to work accepted by a scheduler.
#[derive(Debug)]
pub struct ScheduledTask {
    abort: AbortHandle,
}

impl ScheduledTask {
    /// Cancel the work if it has not run to completion.
    pub fn cancel(&self) {
        self.abort.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.abort.is_finished()
    }
}

/// Scheduler backed by tokio timers on a runtime handle.
pub struct TokioScheduler {
    handle: Handle,
    tasks: Mutex<JoinSet<()>>,
    shut_down: AtomicBool,
}

impl std::fmt::Debug for TokioScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokioScheduler")
            .field("shut_down", &self.shut_down.load(Ordering::Relaxed))
            .finish()
    }
}

impl TokioScheduler {
    pub fn new(handle: Handle) -> Self {
        Self { handle, tasks: Mutex::new(JoinSet::new()), shut_down: AtomicBool::new(false) }
    }

    /// Scheduler on the runtime the caller is running in.
    pub fn current() -> Result<Self, ClientError> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|e| ClientError::Scheduling(format!("no tokio runtime available: {e}")))
    }

    /// Number of accepted tasks that have not been reaped yet.
    pub fn pending(&self) -> usize {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        while tasks.try_join_next().is_some() {}
        tasks.len()
    }
}

impl DelayedScheduler for TokioScheduler {
    fn schedule(&self, delay: Duration, work: Work) -> Result<ScheduledTask, ClientError> {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        if self.shut_down.load(Ordering::Acquire) {
            return Err(ClientError::Scheduling("scheduler is shut down".into()));
        }
        // reap finished work so the set does not grow with every retry
        while tasks.try_join_next().is_some() {}
        let abort = tasks.spawn_on(
            async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                work.await;
            },
            &self.handle,
        );
        Ok(ScheduledTask { abort })
    }

    fn shutdown(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.shut_down.swap(true, Ordering::AcqRel) {
            tracing::debug!(target: "eventline::scheduler", pending = tasks.len(), "scheduler shutting down");
        }
        tasks.abort_all();
    }

    fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }
}

/// Test scheduler that ignores delays, runs work right away, and records every request.
#[derive(Debug, Clone, Default)]
pub struct TrackingScheduler {
    delays: Arc<Mutex<Vec<Duration>>>,
    accept_limit: Arc<Mutex<Option<usize>>>,
    shut_down: Arc<AtomicBool>,
}

impl TrackingScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept the first `accepted` requests, refuse everything after.
    pub fn reject_after(self, accepted: usize) -> Self {
        *self.accept_limit.lock().unwrap_or_else(PoisonError::into_inner) = Some(accepted);
        self
    }

    /// Delays requested so far, in order.
    pub fn delays(&self) -> Vec<Duration> {
        self.delays.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn calls(&self) -> usize {
        self.delays.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl DelayedScheduler for TrackingScheduler {
    fn schedule(&self, delay: Duration, work: Work) -> Result<ScheduledTask, ClientError> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(ClientError::Scheduling("scheduler is shut down".into()));
        }
        let mut delays = self.delays.lock().unwrap_or_else(PoisonError::into_inner);
        let limit = *self.accept_limit.lock().unwrap_or_else(PoisonError::into_inner);
        if limit.is_some_and(|max| delays.len() >= max) {
            return Err(ClientError::Scheduling("tracking scheduler refused the request".into()));
        }
        let handle = Handle::try_current()
            .map_err(|e| ClientError::Scheduling(format!("no tokio runtime available: {e}")))?;
        delays.push(delay);
        let task = handle.spawn(work);
        Ok(ScheduledTask { abort: task.abort_handle() })
    }

    fn shutdown(&self) {
        self.shut_down.store(true, Ordering::Release);
    }

    fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }
}
