//! Convenient re-exports for common eventline types.
pub use crate::{
    client::{EventStreamClient, SendFuture},
    config::ClientConfig,
    error::{conditions, ClientError, LeaseError},
    lease::{ExpiryChecker, Lease, Ownership},
    lease_manager::{InMemoryLeaseManager, LeaseManager},
    retry::{ExponentialRetryPolicy, FixedDelayRetryPolicy, RetryPolicy},
    scheduler::DelayedScheduler,
    single_flight::CreationFailurePolicy,
    telemetry::{ClientEvent, LogSink, MemorySink, NullSink, TelemetrySink},
    transport::{BatchOptions, EventData, EventPosition},
    Backoff, Jitter,
};
