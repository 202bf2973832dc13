//! Lease store contract and an in-memory reference store.
//!
//! The store is the only place where lease changes are serialized. Every mutating call carries
//! the caller's last-read copy of the lease and is applied only if the stored token still matches
//! it, so two hosts racing to steal the same partition cannot both win and the epochs handed to
//! receivers strictly increase per partition.
//!
//! Acquisition rules:
//! - unowned lease: claimed, epoch unchanged;
//! - lease already held by the caller: refreshed, epoch unchanged;
//! - lease held by someone else, expired or not: taken over, epoch incremented.
//!
//! Every acquisition issues a fresh opaque token.

use crate::clock::{Clock, MonotonicClock};
use crate::error::LeaseError;
use crate::lease::{ExpiryChecker, Lease};
use crate::telemetry::{ClientEvent, Telemetry};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use uuid::Uuid;

/// Lease lifetime when none is configured.
pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(30);

/// Operations a lease store offers to partition owners.
#[async_trait]
pub trait LeaseManager: Send + Sync {
    /// Return the stored lease, creating an unclaimed one first if none exists.
    async fn create_lease_if_not_exists(&self, partition_id: &str) -> Result<Lease, LeaseError>;

    async fn get_lease(&self, partition_id: &str) -> Result<Option<Lease>, LeaseError>;

    async fn get_all_leases(&self) -> Result<Vec<Lease>, LeaseError>;

    /// Claim `lease` for `owner`. `lease` is the caller's last-read copy.
    async fn acquire_lease(&self, lease: &Lease, owner: &str) -> Result<Lease, LeaseError>;

    /// Extend the caller's claim.
    async fn renew_lease(&self, lease: &Lease) -> Result<Lease, LeaseError>;

    /// Give the partition up. The epoch is kept for the next owner.
    async fn release_lease(&self, lease: &Lease) -> Result<(), LeaseError>;

    /// Write the caller's copy back, provided nobody changed the lease since it was read.
    async fn update_lease(&self, lease: &Lease) -> Result<Lease, LeaseError>;
}

#[derive(Debug, Clone)]
struct StoredLease {
    lease: Lease,
    expires_at_millis: u64,
}

impl StoredLease {
    fn is_expired(&self, now_millis: u64) -> bool {
        self.lease.owner().is_empty() || now_millis >= self.expires_at_millis
    }
}

/// Process-local lease store with TTL expiry.
#[derive(Debug)]
pub struct InMemoryLeaseManager {
    leases: Mutex<HashMap<String, StoredLease>>,
    clock: Arc<dyn Clock>,
    lease_duration: Duration,
    telemetry: Telemetry,
}

impl Default for InMemoryLeaseManager {
    fn default() -> Self {
        Self::new(DEFAULT_LEASE_DURATION)
    }
}

impl InMemoryLeaseManager {
    pub fn new(lease_duration: Duration) -> Self {
        Self {
            leases: Mutex::new(HashMap::new()),
            clock: Arc::new(MonotonicClock::default()),
            lease_duration,
            telemetry: Telemetry::null(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn lease_duration(&self) -> Duration {
        self.lease_duration
    }

    fn expiry_from(&self, now_millis: u64) -> u64 {
        let ttl = u64::try_from(self.lease_duration.as_millis()).unwrap_or(u64::MAX);
        now_millis.saturating_add(ttl)
    }

    fn with_stored<T>(
        &self,
        partition_id: &str,
        f: impl FnOnce(&mut StoredLease, u64) -> Result<T, LeaseError>,
    ) -> Result<T, LeaseError> {
        let mut leases = self.leases.lock().unwrap_or_else(PoisonError::into_inner);
        let stored = leases
            .get_mut(partition_id)
            .ok_or_else(|| LeaseError::NotFound { partition_id: partition_id.to_string() })?;
        f(stored, self.clock.now_millis())
    }
}

fn lost(lease: &Lease) -> LeaseError {
    LeaseError::Lost { partition_id: lease.partition_id().to_string(), owner: lease.owner().to_string() }
}

fn conflict(lease: &Lease) -> LeaseError {
    LeaseError::Conflict { partition_id: lease.partition_id().to_string() }
}

// Caller's copy still names the current holder under the current token.
fn still_held(stored: &StoredLease, lease: &Lease) -> bool {
    !lease.owner().is_empty()
        && stored.lease.is_owned_by(lease.owner())
        && stored.lease.token() == lease.token()
}

#[async_trait]
impl LeaseManager for InMemoryLeaseManager {
    async fn create_lease_if_not_exists(&self, partition_id: &str) -> Result<Lease, LeaseError> {
        let mut leases = self.leases.lock().unwrap_or_else(PoisonError::into_inner);
        let stored = leases
            .entry(partition_id.to_string())
            .or_insert_with(|| StoredLease { lease: Lease::new(partition_id), expires_at_millis: 0 });
        Ok(stored.lease.clone())
    }

    async fn get_lease(&self, partition_id: &str) -> Result<Option<Lease>, LeaseError> {
        let leases = self.leases.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(leases.get(partition_id).map(|stored| stored.lease.clone()))
    }

    async fn get_all_leases(&self) -> Result<Vec<Lease>, LeaseError> {
        let leases = self.leases.lock().unwrap_or_else(PoisonError::into_inner);
        let mut all: Vec<Lease> = leases.values().map(|stored| stored.lease.clone()).collect();
        all.sort_by(|a, b| a.partition_id().cmp(b.partition_id()));
        Ok(all)
    }

    async fn acquire_lease(&self, lease: &Lease, owner: &str) -> Result<Lease, LeaseError> {
        if owner.is_empty() {
            return Err(LeaseError::Store("owner name must not be empty".into()));
        }
        let (acquired, event) = self.with_stored(lease.partition_id(), |stored, now| {
            if stored.lease.token() != lease.token() {
                return Err(conflict(lease));
            }
            let previous_owner = stored.lease.owner().to_string();
            let expired = stored.is_expired(now);

            let event = if previous_owner.is_empty() || previous_owner == owner {
                ClientEvent::LeaseAcquired {
                    partition_id: lease.partition_id().to_string(),
                    owner: owner.to_string(),
                    epoch: stored.lease.epoch(),
                }
            } else {
                let epoch = stored.lease.increment_epoch();
                tracing::warn!(target: "eventline::lease", partition_id = %lease.partition_id(), previous_owner = %previous_owner, new_owner = %owner, epoch, expired, "lease stolen");
                ClientEvent::LeaseStolen {
                    partition_id: lease.partition_id().to_string(),
                    previous_owner,
                    new_owner: owner.to_string(),
                    epoch,
                }
            };

            stored.lease.set_owner(owner);
            stored.lease.set_token(Uuid::new_v4().to_string());
            stored.expires_at_millis = self.expiry_from(now);
            Ok((stored.lease.clone(), event))
        })?;

        tracing::debug!(target: "eventline::lease", partition_id = %acquired.partition_id(), owner = %owner, epoch = acquired.epoch(), "lease acquired");
        self.telemetry.emit(event).await;
        Ok(acquired)
    }

    async fn renew_lease(&self, lease: &Lease) -> Result<Lease, LeaseError> {
        self.with_stored(lease.partition_id(), |stored, now| {
            if !still_held(stored, lease) {
                return Err(lost(lease));
            }
            stored.expires_at_millis = self.expiry_from(now);
            Ok(stored.lease.clone())
        })
    }

    async fn release_lease(&self, lease: &Lease) -> Result<(), LeaseError> {
        self.with_stored(lease.partition_id(), |stored, _now| {
            if !still_held(stored, lease) {
                return Err(lost(lease));
            }
            stored.lease.set_owner("");
            stored.lease.set_token("");
            stored.expires_at_millis = 0;
            Ok(())
        })?;
        tracing::debug!(target: "eventline::lease", partition_id = %lease.partition_id(), owner = %lease.owner(), "lease released");
        self.telemetry
            .emit(ClientEvent::LeaseReleased { partition_id: lease.partition_id().to_string() })
            .await;
        Ok(())
    }

    async fn update_lease(&self, lease: &Lease) -> Result<Lease, LeaseError> {
        self.with_stored(lease.partition_id(), |stored, _now| {
            if stored.lease.token() != lease.token() || lease.epoch() < stored.lease.epoch() {
                return Err(conflict(lease));
            }
            if !still_held(stored, lease) {
                return Err(lost(lease));
            }
            stored.lease = lease.clone();
            Ok(stored.lease.clone())
        })
    }
}

#[async_trait]
impl ExpiryChecker for InMemoryLeaseManager {
    /// Expired when unowned, lapsed, or re-acquired under a different token since `lease` was read.
    async fn is_expired(&self, lease: &Lease) -> Result<bool, LeaseError> {
        self.with_stored(lease.partition_id(), |stored, now| {
            Ok(stored.lease.token() != lease.token() || stored.is_expired(now))
        })
    }
}
