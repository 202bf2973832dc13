#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # eventline
//!
//! Resilience and coordination core for event-streaming clients.
//!
//! ## Features
//!
//! - **Single-flight sender creation**: concurrent first sends open exactly one link
//! - **Deadline-bounded management retries** with pluggable policies and error classification
//! - **Partition leases** with monotonic epochs, so a new owner preempts the old one
//! - **Structured telemetry** through `tower::Service` sinks
//!
//! ## Quick Start
//!
//! ```rust
//! use eventline::{InMemoryLeaseManager, LeaseManager};
//!
//! #[tokio::main]
//! async fn main() {
//!     let leases = InMemoryLeaseManager::default();
//!     let lease = leases.create_lease_if_not_exists("0").await.unwrap();
//!
//!     let mine = leases.acquire_lease(&lease, "host-a").await.unwrap();
//!     assert_eq!(mine.epoch(), 0);
//!
//!     // another host takes the partition over; the epoch moves forward
//!     let theirs = leases.acquire_lease(&mine, "host-b").await.unwrap();
//!     assert_eq!(theirs.epoch(), 1);
//! }
//! ```

pub mod backoff;
pub mod client;
pub mod clock;
pub mod config;
pub mod error;
pub mod jitter;
pub mod lease;
pub mod lease_manager;
pub mod management;
pub mod prelude;
pub mod retry;
pub mod runtime_info;
pub mod scheduler;
pub mod single_flight;
pub mod telemetry;
pub mod transport;

// Re-exports
pub use backoff::{Backoff, BackoffError};
pub use client::{EventStreamClient, SendFuture};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::{ClientConfig, ClientConfigBuilder, ConfigError};
pub use error::{ClientError, LeaseError, ProtocolError, SecurityError, TransportFailure};
pub use jitter::Jitter;
pub use lease::{ExpiryChecker, Lease, NeverExpires, Ownership, UNKNOWN_PARTITION_ID};
pub use lease_manager::{InMemoryLeaseManager, LeaseManager};
pub use management::{
    ManagementOutcome, ManagementRequest, ManagementResponse, ManagementRetry, ManagementValue,
};
pub use retry::{
    ExponentialRetryPolicy, ExponentialRetryPolicyBuilder, FixedDelayRetryPolicy, NoRetry,
    RetryPolicy, RetryPolicyError,
};
pub use runtime_info::{HubRuntimeInformation, PartitionRuntimeInformation};
pub use scheduler::{DelayedScheduler, ScheduledTask, TokioScheduler, TrackingScheduler};
pub use single_flight::{CreationFailurePolicy, SingleFlight};
pub use transport::{
    BatchOptions, EventData, EventDataBatch, EventPosition, EventSender, ManagementChannel,
    MessagingFactory, PartitionReceiver, ReceiverLink, ReceiverOptions, TokenProvider,
};
