//! Telemetry for the client core.
//!
//! The retry executor, the sender creator and the lease manager emit [`ClientEvent`]s through a
//! [`TelemetrySink`], which is a `tower::Service<ClientEvent>` so sinks compose like any other
//! service. Emission is best-effort: a failing sink never fails the operation that emitted.
//!
//! - **Retries**: `RetryScheduled`, `RetryGaveUp`, `RequestSucceeded`
//! - **Sender**: `SenderCreated`, `SenderCreationFailed`
//! - **Leases**: `LeaseAcquired`, `LeaseStolen`, `LeaseReleased`

pub mod events;
pub mod sinks;

#[cfg(feature = "telemetry-json")]
pub use events::event_to_json;
pub use events::ClientEvent;
pub use sinks::{emit_best_effort, LogSink, MemorySink, NullSink, Telemetry, TelemetrySink};
