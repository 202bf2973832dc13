//! Client configuration.
//!
//! ```rust
//! use std::time::Duration;
//! use eventline::{ClientConfig, CreationFailurePolicy, FixedDelayRetryPolicy};
//!
//! let config = ClientConfig::builder("telemetry-hub")
//!     .operation_timeout(Duration::from_secs(30))
//!     .retry_policy(FixedDelayRetryPolicy::new(Duration::from_millis(200)))
//!     .creation_failure_policy(CreationFailurePolicy::RetryOnNextCall)
//!     .build()
//!     .unwrap();
//! assert_eq!(config.entity_path(), "telemetry-hub");
//! assert_eq!(config.max_partition_key_length(), 128);
//! ```

use crate::retry::{ExponentialRetryPolicy, RetryPolicy};
use crate::scheduler::DelayedScheduler;
use crate::single_flight::CreationFailurePolicy;
use crate::telemetry::{Telemetry, TelemetrySink};
use std::sync::Arc;
use std::time::Duration;

/// Deadline applied to each management operation when none is configured.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(60);

/// Longest partition key accepted when none is configured.
pub const MAX_PARTITION_KEY_LENGTH: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("entity path must not be empty")]
    EmptyEntityPath,
    #[error("operation timeout must be greater than zero")]
    ZeroOperationTimeout,
    #[error("maximum partition key length must be greater than zero")]
    ZeroPartitionKeyLength,
}

/// Validated settings for an [`crate::EventStreamClient`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    entity_path: String,
    operation_timeout: Duration,
    retry_policy: Arc<dyn RetryPolicy>,
    creation_failure_policy: CreationFailurePolicy,
    max_partition_key_length: usize,
    telemetry: Telemetry,
    scheduler: Option<Arc<dyn DelayedScheduler>>,
}

impl ClientConfig {
    pub fn builder(entity_path: impl Into<String>) -> ClientConfigBuilder {
        ClientConfigBuilder::new(entity_path)
    }

    pub fn entity_path(&self) -> &str {
        &self.entity_path
    }

    pub fn operation_timeout(&self) -> Duration {
        self.operation_timeout
    }

    pub fn retry_policy(&self) -> &Arc<dyn RetryPolicy> {
        &self.retry_policy
    }

    pub fn creation_failure_policy(&self) -> CreationFailurePolicy {
        self.creation_failure_policy
    }

    pub fn max_partition_key_length(&self) -> usize {
        self.max_partition_key_length
    }

    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    /// Scheduler supplied by the caller; `None` means the client creates and owns one.
    pub fn scheduler(&self) -> Option<&Arc<dyn DelayedScheduler>> {
        self.scheduler.as_ref()
    }
}

/// Builder for [`ClientConfig`].
#[derive(Debug, Clone)]
pub struct ClientConfigBuilder {
    entity_path: String,
    operation_timeout: Duration,
    retry_policy: Option<Arc<dyn RetryPolicy>>,
    creation_failure_policy: CreationFailurePolicy,
    max_partition_key_length: usize,
    telemetry: Telemetry,
    scheduler: Option<Arc<dyn DelayedScheduler>>,
}

impl ClientConfigBuilder {
    pub fn new(entity_path: impl Into<String>) -> Self {
        Self {
            entity_path: entity_path.into(),
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            retry_policy: None,
            creation_failure_policy: CreationFailurePolicy::default(),
            max_partition_key_length: MAX_PARTITION_KEY_LENGTH,
            telemetry: Telemetry::null(),
            scheduler: None,
        }
    }

    pub fn operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    pub fn retry_policy<P: RetryPolicy + 'static>(mut self, policy: P) -> Self {
        self.retry_policy = Some(Arc::new(policy));
        self
    }

    /// Share one policy (and its per-client counters) between clients.
    pub fn shared_retry_policy(mut self, policy: Arc<dyn RetryPolicy>) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn creation_failure_policy(mut self, policy: CreationFailurePolicy) -> Self {
        self.creation_failure_policy = policy;
        self
    }

    pub fn max_partition_key_length(mut self, length: usize) -> Self {
        self.max_partition_key_length = length;
        self
    }

    pub fn telemetry_sink<S>(mut self, sink: S) -> Self
    where
        S: TelemetrySink,
        S::Future: Send + 'static,
    {
        self.telemetry = Telemetry::new(sink);
        self
    }

    pub fn scheduler(mut self, scheduler: Arc<dyn DelayedScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn build(self) -> Result<ClientConfig, ConfigError> {
        if self.entity_path.trim().is_empty() {
            return Err(ConfigError::EmptyEntityPath);
        }
        if self.operation_timeout.is_zero() {
            return Err(ConfigError::ZeroOperationTimeout);
        }
        if self.max_partition_key_length == 0 {
            return Err(ConfigError::ZeroPartitionKeyLength);
        }
        Ok(ClientConfig {
            entity_path: self.entity_path,
            operation_timeout: self.operation_timeout,
            retry_policy: self
                .retry_policy
                .unwrap_or_else(|| Arc::new(ExponentialRetryPolicy::default())),
            creation_failure_policy: self.creation_failure_policy,
            max_partition_key_length: self.max_partition_key_length,
            telemetry: self.telemetry,
            scheduler: self.scheduler,
        })
    }
}
