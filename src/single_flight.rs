//! Single-flight creation of a shared, lazily created resource.
//!
//! The first caller of [`SingleFlight::ensure_created`] starts the creation; every caller that
//! arrives while it is in flight awaits the same shared future, and every caller after it has
//! settled observes the same resource or the same failure.
//!
//! - Fast path: once the resource is published, callers read it without touching the lock.
//! - Slow path: the lock guards only the "has creation started" transition.
//!
//! A failed creation stays cached under [`CreationFailurePolicy::Permanent`]. Under
//! [`CreationFailurePolicy::RetryOnNextCall`], the first call after a settled failure starts a
//! new creation.

use crate::ClientError;
use arc_swap::ArcSwapOption;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::runtime::Handle;

/// What a caller sees after a creation attempt has failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CreationFailurePolicy {
    /// The failure is returned to every later caller.
    #[default]
    Permanent,
    /// The next call after a settled failure starts a fresh creation.
    RetryOnNextCall,
}

type Flight<R> = Shared<BoxFuture<'static, Result<R, ClientError>>>;

/// Exactly-once creator for a resource of type `R`.
pub struct SingleFlight<R> {
    started: AtomicBool,
    gate: Mutex<Option<Flight<R>>>,
    resource: Arc<ArcSwapOption<R>>,
    attempts: AtomicUsize,
    policy: CreationFailurePolicy,
}

impl<R> std::fmt::Debug for SingleFlight<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleFlight")
            .field("started", &self.started.load(Ordering::Relaxed))
            .field("created", &self.resource.load().is_some())
            .field("attempts", &self.attempts.load(Ordering::Relaxed))
            .field("policy", &self.policy)
            .finish()
    }
}

impl<R> Default for SingleFlight<R>
where
    R: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new(CreationFailurePolicy::default())
    }
}

impl<R> SingleFlight<R>
where
    R: Clone + Send + Sync + 'static,
{
    pub fn new(policy: CreationFailurePolicy) -> Self {
        Self {
            started: AtomicBool::new(false),
            gate: Mutex::new(None),
            resource: Arc::new(ArcSwapOption::empty()),
            attempts: AtomicUsize::new(0),
            policy,
        }
    }

    /// Resolve to the shared resource, running `create` only if no creation has started
    /// (or, under `RetryOnNextCall`, the previous one failed).
    ///
    /// `create` is not called at all on the fast path. The creation future is driven on the
    /// current tokio runtime when there is one, so it completes even if every caller stops
    /// waiting.
    pub async fn ensure_created<F, Fut>(&self, create: F) -> Result<R, ClientError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<R, ClientError>> + Send + 'static,
    {
        if self.started.load(Ordering::Acquire) {
            if let Some(resource) = self.get() {
                return Ok(resource);
            }
        }
        let flight = self.flight(create);
        flight.await
    }

    fn flight<F, Fut>(&self, create: F) -> Flight<R>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<R, ClientError>> + Send + 'static,
    {
        let mut gate = self.gate.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(flight) = gate.as_ref() {
            let failed = matches!(flight.peek(), Some(Err(_)));
            if !(failed && self.policy == CreationFailurePolicy::RetryOnNextCall) {
                return flight.clone();
            }
            tracing::debug!(target: "eventline::single_flight", "previous creation failed, starting again");
        }

        let attempt = self.attempts.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::debug!(target: "eventline::single_flight", attempt, "starting creation");

        let published = self.resource.clone();
        let creation = create();
        let flight = async move {
            let created = creation.await?;
            published.store(Some(Arc::new(created.clone())));
            Ok(created)
        }
        .boxed()
        .shared();

        if let Ok(handle) = Handle::try_current() {
            let driver = flight.clone();
            handle.spawn(async move {
                let _ = driver.await;
            });
        }

        *gate = Some(flight.clone());
        self.started.store(true, Ordering::Release);
        flight
    }

    /// The resource, if creation has succeeded.
    pub fn get(&self) -> Option<R> {
        self.resource.load_full().map(|resource| R::clone(&resource))
    }

    /// Wait for the latest creation, if one was ever started, and return how it settled.
    pub async fn settled(&self) -> Option<Result<R, ClientError>> {
        let flight = self.gate.lock().unwrap_or_else(PoisonError::into_inner).clone()?;
        Some(flight.await)
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Number of creations started so far.
    pub fn creation_attempts(&self) -> usize {
        self.attempts.load(Ordering::Acquire)
    }

    pub fn policy(&self) -> CreationFailurePolicy {
        self.policy
    }
}
