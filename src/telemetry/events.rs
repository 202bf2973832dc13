use std::fmt;
use std::time::Duration;

#[cfg(feature = "telemetry-json")]
use serde_json::json;

/// Structured events emitted by the client core.
///
/// Events describe what the resilience machinery did, not what the service returned: a retry
/// being scheduled, a management request settling, the shared sender coming up (or failing to),
/// and partition leases changing hands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// A management attempt failed with a retryable error and another one was scheduled.
    RetryScheduled {
        /// The attempt that will run next (1-indexed).
        attempt: u32,
        /// Delay before that attempt.
        delay: Duration,
    },
    /// The retry policy refused another attempt; the request settled with its last failure.
    RetryGaveUp {
        /// Attempts made in total.
        attempts: u32,
        /// Time since the first attempt started.
        elapsed: Duration,
    },
    /// A management request produced a response.
    RequestSucceeded {
        attempts: u32,
        elapsed: Duration,
    },
    /// The shared sender was created.
    SenderCreated,
    /// Creating the shared sender failed.
    SenderCreationFailed {
        /// Display form of the failure.
        reason: String,
    },
    /// A partition lease was claimed without taking it from a live owner.
    LeaseAcquired {
        partition_id: String,
        owner: String,
        epoch: i64,
    },
    /// A partition lease was taken over from another owner; `epoch` is the new, bumped value.
    LeaseStolen {
        partition_id: String,
        previous_owner: String,
        new_owner: String,
        epoch: i64,
    },
    /// A partition lease was given up by its owner.
    LeaseReleased {
        partition_id: String,
    },
}

impl ClientEvent {
    /// Short snake_case name of the event kind.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientEvent::RetryScheduled { .. } => "retry_scheduled",
            ClientEvent::RetryGaveUp { .. } => "retry_gave_up",
            ClientEvent::RequestSucceeded { .. } => "request_succeeded",
            ClientEvent::SenderCreated => "sender_created",
            ClientEvent::SenderCreationFailed { .. } => "sender_creation_failed",
            ClientEvent::LeaseAcquired { .. } => "lease_acquired",
            ClientEvent::LeaseStolen { .. } => "lease_stolen",
            ClientEvent::LeaseReleased { .. } => "lease_released",
        }
    }
}

impl fmt::Display for ClientEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientEvent::RetryScheduled { attempt, delay } => {
                write!(f, "Retry::Scheduled(#{}, delay={:?})", attempt, delay)
            }
            ClientEvent::RetryGaveUp { attempts, elapsed } => {
                write!(f, "Retry::GaveUp(attempts={}, elapsed={:?})", attempts, elapsed)
            }
            ClientEvent::RequestSucceeded { attempts, elapsed } => {
                write!(f, "Request::Succeeded(attempts={}, elapsed={:?})", attempts, elapsed)
            }
            ClientEvent::SenderCreated => write!(f, "Sender::Created"),
            ClientEvent::SenderCreationFailed { reason } => {
                write!(f, "Sender::CreationFailed({})", reason)
            }
            ClientEvent::LeaseAcquired { partition_id, owner, epoch } => {
                write!(f, "Lease::Acquired(partition={}, owner={}, epoch={})", partition_id, owner, epoch)
            }
            ClientEvent::LeaseStolen { partition_id, previous_owner, new_owner, epoch } => write!(
                f,
                "Lease::Stolen(partition={}, {} -> {}, epoch={})",
                partition_id, previous_owner, new_owner, epoch
            ),
            ClientEvent::LeaseReleased { partition_id } => {
                write!(f, "Lease::Released(partition={})", partition_id)
            }
        }
    }
}

#[cfg(feature = "telemetry-json")]
#[inline]
fn clamp_u64(val: u128) -> u64 {
    val.min(u128::from(u64::MAX)) as u64
}

/// Convert a ClientEvent into a JSON value for sinks.
#[cfg(feature = "telemetry-json")]
pub fn event_to_json(event: &ClientEvent) -> serde_json::Value {
    let kind = event.kind();
    match event {
        ClientEvent::RetryScheduled { attempt, delay } => json!({
            "kind": kind,
            "attempt": *attempt,
            "delay_ms": clamp_u64(delay.as_millis()),
        }),
        ClientEvent::RetryGaveUp { attempts, elapsed }
        | ClientEvent::RequestSucceeded { attempts, elapsed } => json!({
            "kind": kind,
            "attempts": *attempts,
            "elapsed_ms": clamp_u64(elapsed.as_millis()),
        }),
        ClientEvent::SenderCreated => json!({ "kind": kind }),
        ClientEvent::SenderCreationFailed { reason } => json!({ "kind": kind, "reason": reason }),
        ClientEvent::LeaseAcquired { partition_id, owner, epoch } => json!({
            "kind": kind,
            "partition_id": partition_id,
            "owner": owner,
            "epoch": *epoch,
        }),
        ClientEvent::LeaseStolen { partition_id, previous_owner, new_owner, epoch } => json!({
            "kind": kind,
            "partition_id": partition_id,
            "previous_owner": previous_owner,
            "new_owner": new_owner,
            "epoch": *epoch,
        }),
        ClientEvent::LeaseReleased { partition_id } => {
            json!({ "kind": kind, "partition_id": partition_id })
        }
    }
}

#[cfg(all(test, feature = "telemetry-json"))]
mod json_tests {
    use super::*;

    #[test]
    fn retry_scheduled_json() {
        let v = event_to_json(&ClientEvent::RetryScheduled {
            attempt: 3,
            delay: Duration::from_millis(150),
        });
        assert_eq!(v["kind"], "retry_scheduled");
        assert_eq!(v["attempt"], 3);
        assert_eq!(v["delay_ms"], 150);
    }

    #[test]
    fn lease_stolen_json() {
        let v = event_to_json(&ClientEvent::LeaseStolen {
            partition_id: "2".into(),
            previous_owner: "host-a".into(),
            new_owner: "host-b".into(),
            epoch: 8,
        });
        assert_eq!(v["kind"], "lease_stolen");
        assert_eq!(v["previous_owner"], "host-a");
        assert_eq!(v["epoch"], 8);
    }
}
