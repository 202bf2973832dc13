//! Partition lease value and its expiry capability.
//!
//! A [`Lease`] is a plain value: partition identity, owner name, opaque store token, and an epoch
//! that only moves forward. It carries no locking. Components that share a lease either
//! synchronize externally or work on a clone (`lease.clone()` is a deep copy) and publish it back
//! through the lease store, which is where compare-and-set happens.
//!
//! Whether a lease has lapsed is not a property of the value. Stores answer it through
//! [`ExpiryChecker`], which may need I/O and may fail.

use crate::error::LeaseError;
use async_trait::async_trait;

/// Partition id given to a lease deserialized without one.
pub const UNKNOWN_PARTITION_ID: &str = "-1";

/// Ownership claim over one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "persistence", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "persistence", serde(rename_all = "camelCase", from = "LeaseRecord"))]
pub struct Lease {
    partition_id: String,
    epoch: i64,
    owner: String,
    token: String,
}

impl Lease {
    /// Unclaimed lease: epoch 0, no owner, no token.
    pub fn new(partition_id: impl Into<String>) -> Self {
        Self { partition_id: partition_id.into(), epoch: 0, owner: String::new(), token: String::new() }
    }

    // Only the deserialization boundary builds these.
    pub(crate) fn unknown() -> Self {
        Self::new(UNKNOWN_PARTITION_ID)
    }

    /// True for a lease that was read without a partition id.
    pub fn is_unknown(&self) -> bool {
        self.partition_id == UNKNOWN_PARTITION_ID
    }

    pub fn partition_id(&self) -> &str {
        &self.partition_id
    }

    pub fn epoch(&self) -> i64 {
        self.epoch
    }

    /// Overwrite the epoch. Epochs are expected to move forward only; a lower value is still
    /// stored but logged, since it means the caller lost track of the partition's history.
    pub fn set_epoch(&mut self, epoch: i64) {
        if epoch < self.epoch {
            tracing::warn!(target: "eventline::lease", partition_id = %self.partition_id, current = self.epoch, requested = epoch, "lease epoch moved backwards");
        }
        self.epoch = epoch;
    }

    /// Bump the epoch by one and return the new value.
    pub fn increment_epoch(&mut self) -> i64 {
        self.epoch = self.epoch.saturating_add(1);
        self.epoch
    }

    /// Current owner; empty when unowned.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn set_owner(&mut self, owner: impl Into<String>) {
        self.owner = owner.into();
    }

    /// Whether `candidate` holds this lease. An unowned lease is held by nobody.
    pub fn is_owned_by(&self, candidate: &str) -> bool {
        !self.owner.is_empty() && self.owner == candidate
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn set_token(&mut self, token: impl Into<String>) {
        self.token = token.into();
    }

    /// Ownership state given the store's expiry verdict.
    pub fn ownership(&self, expired: bool) -> Ownership<'_> {
        if self.owner.is_empty() {
            Ownership::Unclaimed { epoch: self.epoch }
        } else if expired {
            Ownership::Expired { last_owner: &self.owner, epoch: self.epoch }
        } else {
            Ownership::Held { owner: &self.owner, epoch: self.epoch }
        }
    }

    /// [`Lease::ownership`] with the verdict taken from `checker`.
    pub async fn ownership_with(&self, checker: &dyn ExpiryChecker) -> Result<Ownership<'_>, LeaseError> {
        let expired = checker.is_expired(self).await?;
        Ok(self.ownership(expired))
    }
}

/// Who holds a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership<'a> {
    /// Nobody holds it; `epoch` is retained from earlier owners.
    Unclaimed { epoch: i64 },
    Held { owner: &'a str, epoch: i64 },
    /// The last owner's claim lapsed; kept for audit until someone re-acquires.
    Expired { last_owner: &'a str, epoch: i64 },
}

/// Store-specific answer to "is this claim still honored".
#[async_trait]
pub trait ExpiryChecker: Send + Sync {
    async fn is_expired(&self, lease: &Lease) -> Result<bool, LeaseError>;
}

/// Leases never lapse.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverExpires;

#[async_trait]
impl ExpiryChecker for NeverExpires {
    async fn is_expired(&self, _lease: &Lease) -> Result<bool, LeaseError> {
        Ok(false)
    }
}

#[cfg(feature = "persistence")]
#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct LeaseRecord {
    partition_id: Option<String>,
    epoch: i64,
    owner: String,
    token: String,
}

#[cfg(feature = "persistence")]
impl Default for LeaseRecord {
    fn default() -> Self {
        Self { partition_id: None, epoch: 0, owner: String::new(), token: String::new() }
    }
}

#[cfg(feature = "persistence")]
impl From<LeaseRecord> for Lease {
    fn from(record: LeaseRecord) -> Self {
        let mut lease = match record.partition_id {
            Some(partition_id) => Lease::new(partition_id),
            None => Lease::unknown(),
        };
        lease.epoch = record.epoch;
        lease.owner = record.owner;
        lease.token = record.token;
        lease
    }
}
