use super::events::ClientEvent;
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use tower::util::BoxCloneService;
use tower::{BoxError, Service, ServiceExt};

type SinkFuture<E> = Pin<Box<dyn Future<Output = Result<(), E>> + Send>>;

/// A telemetry sink that consumes client events.
pub trait TelemetrySink:
    tower::Service<ClientEvent, Response = (), Error = Self::SinkError> + Clone + Send + 'static
{
    /// The error type for this sink.
    type SinkError: std::error::Error + Send + Sync + 'static;
}

/// Best-effort emit helper that honors `poll_ready` and swallows errors.
pub async fn emit_best_effort<S>(sink: S, event: ClientEvent)
where
    S: tower::Service<ClientEvent, Response = ()> + Send + 'static,
    S::Error: Send + 'static,
    S::Future: Send + 'static,
{
    if let Ok(mut ready_sink) = sink.ready_oneshot().await {
        let _ = ready_sink.call(event).await;
    }
}

/// A no-op telemetry sink that discards all events.
#[derive(Clone, Debug, Default)]
pub struct NullSink;

impl Service<ClientEvent> for NullSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture<Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _event: ClientEvent) -> Self::Future {
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for NullSink {
    type SinkError = Infallible;
}

/// A telemetry sink that logs events using the `tracing` crate.
///
/// Each event kind is logged with its own fields under the `eventline::telemetry` target.
/// Lease steals, sender creation failures and exhausted retries log at `WARN`; everything else
/// logs at `INFO`.
#[derive(Clone, Debug, Default)]
pub struct LogSink;

impl LogSink {
    fn log(event: &ClientEvent) {
        let kind = event.kind();
        match event {
            ClientEvent::RetryScheduled { attempt, delay } => {
                tracing::info!(target: "eventline::telemetry", kind, attempt, delay_ms = delay.as_millis() as u64, "retry scheduled");
            }
            ClientEvent::RetryGaveUp { attempts, elapsed } => {
                tracing::warn!(target: "eventline::telemetry", kind, attempts, elapsed_ms = elapsed.as_millis() as u64, "retry gave up");
            }
            ClientEvent::RequestSucceeded { attempts, elapsed } => {
                tracing::info!(target: "eventline::telemetry", kind, attempts, elapsed_ms = elapsed.as_millis() as u64, "request succeeded");
            }
            ClientEvent::SenderCreated => {
                tracing::info!(target: "eventline::telemetry", kind, "sender created");
            }
            ClientEvent::SenderCreationFailed { reason } => {
                tracing::warn!(target: "eventline::telemetry", kind, reason = %reason, "sender creation failed");
            }
            ClientEvent::LeaseAcquired { partition_id, owner, epoch } => {
                tracing::info!(target: "eventline::telemetry", kind, partition_id = %partition_id, owner = %owner, epoch, "lease acquired");
            }
            ClientEvent::LeaseStolen { partition_id, previous_owner, new_owner, epoch } => {
                tracing::warn!(target: "eventline::telemetry", kind, partition_id = %partition_id, previous_owner = %previous_owner, new_owner = %new_owner, epoch, "lease stolen");
            }
            ClientEvent::LeaseReleased { partition_id } => {
                tracing::info!(target: "eventline::telemetry", kind, partition_id = %partition_id, "lease released");
            }
        }
    }
}

impl Service<ClientEvent> for LogSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture<Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: ClientEvent) -> Self::Future {
        Self::log(&event);
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for LogSink {
    type SinkError = Infallible;
}

/// A telemetry sink that keeps the most recent events in memory. Clones share storage.
#[derive(Clone, Debug)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<ClientEvent>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
            capacity: capacity.max(1),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn events(&self) -> Vec<ClientEvent> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Events dropped because the sink was full.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<ClientEvent> for MemorySink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture<Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: ClientEvent) -> Self::Future {
        let mut guard = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.len() >= self.capacity {
            guard.remove(0);
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        guard.push(event);
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for MemorySink {
    type SinkError = Infallible;
}

/// Type-erased sink handle shared by the components of one client.
///
/// Emission clones the boxed service out of the lock and never holds the lock across an await.
#[derive(Clone)]
pub struct Telemetry {
    sink: Arc<Mutex<BoxCloneService<ClientEvent, (), BoxError>>>,
}

impl Telemetry {
    pub fn new<S>(sink: S) -> Self
    where
        S: TelemetrySink,
        S::Future: Send + 'static,
    {
        let erased = sink.map_err(|e: S::SinkError| -> BoxError { Box::new(e) });
        Self { sink: Arc::new(Mutex::new(BoxCloneService::new(erased))) }
    }

    /// Handle that drops every event.
    pub fn null() -> Self {
        Self::new(NullSink)
    }

    pub async fn emit(&self, event: ClientEvent) {
        let sink = self.sink.lock().unwrap_or_else(PoisonError::into_inner).clone();
        emit_best_effort(sink, event).await;
    }
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::null()
    }
}

impl std::fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Telemetry").finish_non_exhaustive()
    }
}
