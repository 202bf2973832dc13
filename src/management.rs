//! Management-plane requests and the deadline-bounded retry loop that drives them.
//!
//! A management request is a free-form key/value map. [`ManagementRetry`] sends it over a
//! [`ManagementChannel`] and, on failure, asks the [`RetryPolicy`] whether the time left before
//! the deadline justifies another attempt. Attempts are strictly sequential: attempt `n + 1` is
//! handed to the [`DelayedScheduler`] only after attempt `n` has been classified.
//!
//! The loop resolves its [`ManagementOutcome`] exactly once:
//! - `Ok(Some(response))` on the first successful attempt,
//! - `Err(error)` with the classified error once the policy gives up or scheduling fails,
//! - `Ok(None)` when the final attempt produced neither a response nor an error (the channel
//!   or the per-attempt deadline timed out) and the policy declined to retry.
//!
//! The last case reports "no data" rather than a timeout. Callers that need a value should map
//! `None` to [`ClientError::Timeout`] themselves, as the client does.
//!
//! Every call to [`ManagementRetry::execute_until`] is its own loop: the policy sees it under an
//! operation key (`<client_id>#<n>`), so attempt history never leaks from one operation into the
//! next or between concurrent operations. The key is forgotten as soon as the loop settles.

use crate::scheduler::DelayedScheduler;
use crate::telemetry::{ClientEvent, Telemetry};
use crate::transport::ManagementChannel;
use crate::{ClientError, RetryPolicy};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::{Duration, SystemTime};
use tokio::sync::oneshot;
use tokio::time::Instant;

// Process-wide so two retry loops never share a policy key, even across clients with one id.
static OPERATION_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Well-known request and response keys.
pub mod keys {
    pub const ENTITY_TYPE: &str = "type";
    pub const ENTITY_NAME: &str = "name";
    pub const PARTITION_NAME: &str = "partition";
    pub const OPERATION: &str = "operation";
    pub const SECURITY_TOKEN: &str = "security_token";

    pub const CREATED_AT: &str = "created_at";
    pub const PARTITION_COUNT: &str = "partition_count";
    pub const PARTITION_IDS: &str = "partition_ids";
    pub const BEGIN_SEQUENCE_NUMBER: &str = "begin_sequence_number";
    pub const LAST_ENQUEUED_SEQUENCE_NUMBER: &str = "last_enqueued_sequence_number";
    pub const LAST_ENQUEUED_OFFSET: &str = "last_enqueued_offset";
    pub const LAST_ENQUEUED_TIME_UTC: &str = "last_enqueued_time_utc";

    /// Entity type of a whole event hub.
    pub const EVENTHUB_ENTITY_TYPE: &str = "com.microsoft:eventhub";
    /// Entity type of a single partition.
    pub const PARTITION_ENTITY_TYPE: &str = "com.microsoft:partition";
    pub const READ_OPERATION: &str = "READ";
}

/// A value carried in a management request or response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagementValue {
    String(String),
    Int(i32),
    Long(i64),
    Timestamp(SystemTime),
    StringList(Vec<String>),
}

impl ManagementValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ManagementValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Integer view; `Int` widens losslessly.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ManagementValue::Int(v) => Some(i64::from(*v)),
            ManagementValue::Long(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<SystemTime> {
        match self {
            ManagementValue::Timestamp(t) => Some(*t),
            _ => None,
        }
    }

    pub fn as_string_list(&self) -> Option<&[String]> {
        match self {
            ManagementValue::StringList(items) => Some(items),
            _ => None,
        }
    }
}

impl From<&str> for ManagementValue {
    fn from(value: &str) -> Self {
        ManagementValue::String(value.to_string())
    }
}

impl From<String> for ManagementValue {
    fn from(value: String) -> Self {
        ManagementValue::String(value)
    }
}

impl From<i32> for ManagementValue {
    fn from(value: i32) -> Self {
        ManagementValue::Int(value)
    }
}

impl From<i64> for ManagementValue {
    fn from(value: i64) -> Self {
        ManagementValue::Long(value)
    }
}

impl From<SystemTime> for ManagementValue {
    fn from(value: SystemTime) -> Self {
        ManagementValue::Timestamp(value)
    }
}

impl From<Vec<String>> for ManagementValue {
    fn from(value: Vec<String>) -> Self {
        ManagementValue::StringList(value)
    }
}

pub type ManagementRequest = HashMap<String, ManagementValue>;
pub type ManagementResponse = HashMap<String, ManagementValue>;

type OutcomeResult = Result<Option<ManagementResponse>, ClientError>;

/// Single-assignment slot shared by every attempt of one request.
#[derive(Debug)]
struct OutcomeSlot {
    tx: Mutex<Option<oneshot::Sender<OutcomeResult>>>,
}

impl OutcomeSlot {
    fn new(tx: oneshot::Sender<OutcomeResult>) -> Self {
        Self { tx: Mutex::new(Some(tx)) }
    }

    /// Returns `false` when the slot was already resolved; the late value is dropped.
    fn resolve(&self, result: OutcomeResult) -> bool {
        let taken = self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
        match taken {
            Some(tx) => {
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }

    fn is_resolved(&self) -> bool {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).is_none()
    }

    /// The caller dropped its [`ManagementOutcome`].
    fn is_abandoned(&self) -> bool {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).as_ref().is_some_and(|tx| tx.is_closed())
    }
}

/// State of one attempt, passed explicitly from attempt to attempt.
#[derive(Debug, Clone)]
struct Attempt {
    number: u32,
    /// Key the policy tracks this operation's history under.
    operation: Arc<str>,
    request: Arc<ManagementRequest>,
    deadline: Instant,
    started: Instant,
    outcome: Arc<OutcomeSlot>,
}

/// Future resolved once by a [`ManagementRetry`] loop.
#[derive(Debug)]
#[must_use = "the outcome of a management request should be awaited"]
pub struct ManagementOutcome {
    rx: oneshot::Receiver<OutcomeResult>,
}

impl ManagementOutcome {
    fn resolved(result: OutcomeResult) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self { rx }
    }
}

impl Future for ManagementOutcome {
    type Output = OutcomeResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|received| {
            received.unwrap_or_else(|_| {
                Err(ClientError::Scheduling(
                    "management request was cancelled before it completed".into(),
                ))
            })
        })
    }
}

/// Drives management requests through the retry policy until they settle.
///
/// Cloning is cheap; clones share the channel, policy, scheduler and telemetry.
#[derive(Clone)]
pub struct ManagementRetry {
    client_id: Arc<str>,
    channel: Arc<dyn ManagementChannel>,
    policy: Arc<dyn RetryPolicy>,
    scheduler: Arc<dyn DelayedScheduler>,
    telemetry: Telemetry,
}

impl std::fmt::Debug for ManagementRetry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagementRetry")
            .field("client_id", &self.client_id)
            .field("policy", &self.policy)
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}

impl ManagementRetry {
    pub fn new(
        client_id: impl Into<String>,
        channel: Arc<dyn ManagementChannel>,
        policy: Arc<dyn RetryPolicy>,
        scheduler: Arc<dyn DelayedScheduler>,
    ) -> Self {
        Self {
            client_id: Arc::from(client_id.into()),
            channel,
            policy,
            scheduler,
            telemetry: Telemetry::null(),
        }
    }

    pub fn with_telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Run `request` with a deadline `timeout` from now.
    pub fn execute(&self, request: ManagementRequest, timeout: Duration) -> ManagementOutcome {
        self.execute_until(request, Instant::now() + timeout)
    }

    /// Run `request` until it settles or `deadline` passes.
    ///
    /// The first attempt goes through the scheduler with no delay. If the scheduler refuses it,
    /// the returned outcome is already failed.
    pub fn execute_until(&self, request: ManagementRequest, deadline: Instant) -> ManagementOutcome {
        let (tx, rx) = oneshot::channel();
        let sequence = OPERATION_SEQUENCE.fetch_add(1, Ordering::Relaxed) + 1;
        let attempt = Attempt {
            number: 1,
            operation: Arc::from(format!("{}#{}", self.client_id, sequence)),
            request: Arc::new(request),
            deadline,
            started: Instant::now(),
            outcome: Arc::new(OutcomeSlot::new(tx)),
        };
        let slot = attempt.outcome.clone();
        let operation = attempt.operation.clone();
        if let Err(error) = self.scheduler.schedule(Duration::ZERO, self.clone().run_attempt(attempt)) {
            tracing::warn!(target: "eventline::management", client_id = %self.client_id, error = %error, "could not schedule management request");
            slot.resolve(Err(error));
            self.policy.reset_retry_count(&operation);
        }
        ManagementOutcome { rx }
    }

    /// Outcome that has already failed, for errors detected before the loop starts.
    pub(crate) fn failed(error: ClientError) -> ManagementOutcome {
        ManagementOutcome::resolved(Err(error))
    }

    // Returns a boxed future so each attempt can schedule its successor.
    fn run_attempt(self, attempt: Attempt) -> BoxFuture<'static, ()> {
        async move {
            if attempt.outcome.is_resolved() {
                self.policy.reset_retry_count(&attempt.operation);
                return;
            }
            if attempt.outcome.is_abandoned() {
                tracing::debug!(target: "eventline::management", client_id = %self.client_id, attempt = attempt.number, "outcome dropped by caller, stopping");
                self.policy.reset_retry_count(&attempt.operation);
                return;
            }

            let budget = attempt.deadline.saturating_duration_since(Instant::now());
            tracing::debug!(target: "eventline::management", client_id = %self.client_id, attempt = attempt.number, remaining_ms = budget.as_millis() as u64, "sending management request");

            let result = match tokio::time::timeout(budget, self.channel.request(&attempt.request)).await {
                Ok(result) => result,
                Err(_elapsed) => Ok(None),
            };

            let error = match result {
                Ok(Some(response)) => {
                    self.policy.reset_retry_count(&attempt.operation);
                    if attempt.outcome.resolve(Ok(Some(response))) {
                        self.telemetry
                            .emit(ClientEvent::RequestSucceeded {
                                attempts: attempt.number,
                                elapsed: attempt.started.elapsed(),
                            })
                            .await;
                    }
                    return;
                }
                Ok(None) => None,
                Err(failure) => Some(failure.classify()),
            };

            // Timeouts must still reach the policy, so they get a retryable error of their own.
            let last_error = error
                .clone()
                .unwrap_or_else(|| ClientError::Timeout("management request timed out".into()));
            let remaining = attempt.deadline.saturating_duration_since(Instant::now());

            match self.policy.next_retry_interval(&attempt.operation, &last_error, remaining) {
                None => {
                    self.policy.reset_retry_count(&attempt.operation);
                    tracing::warn!(target: "eventline::management", client_id = %self.client_id, attempts = attempt.number, error = %last_error, "giving up on management request");
                    let settled = match error {
                        Some(error) => Err(error),
                        None => Ok(None),
                    };
                    if attempt.outcome.resolve(settled) {
                        self.telemetry
                            .emit(ClientEvent::RetryGaveUp {
                                attempts: attempt.number,
                                elapsed: attempt.started.elapsed(),
                            })
                            .await;
                    }
                }
                Some(delay) => {
                    let next = Attempt { number: attempt.number + 1, ..attempt };
                    let slot = next.outcome.clone();
                    let operation = next.operation.clone();
                    let number = next.number;
                    tracing::debug!(target: "eventline::management", client_id = %self.client_id, next_attempt = number, delay_ms = delay.as_millis() as u64, error = %last_error, "retrying management request");
                    let work = self.clone().run_attempt(next);
                    match self.scheduler.schedule(delay, work) {
                        Ok(_) => {
                            self.telemetry.emit(ClientEvent::RetryScheduled { attempt: number, delay }).await;
                        }
                        Err(refused) => {
                            tracing::warn!(target: "eventline::management", client_id = %self.client_id, error = %refused, "could not schedule retry");
                            slot.resolve(Err(refused));
                            self.policy.reset_retry_count(&operation);
                        }
                    }
                }
            }
        }
        .boxed()
    }
}
