//! Error taxonomy for the client core.
//!
//! Every failure a caller can observe is a [`ClientError`]. Raw transport outcomes arrive as
//! [`TransportFailure`] values, which may be wrapped any number of times by the layers that
//! produced them; [`TransportFailure::classify`] peels the wrappers, translates protocol
//! conditions, and yields the domain error the retry policy reasons about.
//!
//! Classes:
//! - validation: caller supplied invalid arguments; surfaced synchronously, never retried.
//! - security: token acquisition failed; short-circuits before any attempt is made.
//! - retryable transport: [`ClientError::Timeout`], [`ClientError::ServerBusy`], and
//!   [`ClientError::Transport`] with `retryable: true`.
//! - non-retryable transport: every other protocol condition and unexpected errors.
//! - scheduling: the delay scheduler refused the next attempt.

use std::fmt;
use std::sync::Arc;

/// Well-known protocol condition codes and their meaning to the retry loop.
pub mod conditions {
    /// The service did not answer within its own deadline.
    pub const TIMEOUT: &str = "com.microsoft:timeout";
    /// The service is throttling; retry after a longer pause.
    pub const SERVER_BUSY: &str = "com.microsoft:server-busy";
    /// Transient failure inside the service.
    pub const INTERNAL_ERROR: &str = "amqp:internal-error";
    /// The connection was closed by the service.
    pub const CONNECTION_FORCED: &str = "amqp:connection:forced";
    /// The link was detached by the service.
    pub const LINK_DETACH_FORCED: &str = "amqp:link:detach-forced";
    /// The addressed entity does not exist.
    pub const NOT_FOUND: &str = "amqp:not-found";
    /// The addressed entity does not exist (service-specific spelling).
    pub const ENTITY_NOT_FOUND: &str = "com.microsoft:entity-not-found";
    /// The presented token does not grant access.
    pub const UNAUTHORIZED_ACCESS: &str = "amqp:unauthorized-access";
    /// A namespace or entity quota was exhausted.
    pub const RESOURCE_LIMIT_EXCEEDED: &str = "amqp:resource-limit-exceeded";
    /// A receiver with a higher epoch took over the partition.
    pub const LINK_STOLEN: &str = "amqp:link:stolen";
    /// The request carried an invalid argument.
    pub const ARGUMENT_ERROR: &str = "com.microsoft:argument-error";
    /// The request carried an argument outside its allowed range.
    pub const ARGUMENT_OUT_OF_RANGE: &str = "com.microsoft:argument-out-of-range";
}

/// Failure acquiring a security token for a management request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SecurityError {
    /// The signing key was rejected.
    #[error("invalid signing key: {0}")]
    InvalidKey(String),
    /// The signing algorithm is unavailable.
    #[error("signing algorithm unavailable: {0}")]
    Algorithm(String),
    /// The token source could not be reached.
    #[error("token source i/o failure: {0}")]
    Io(String),
}

/// Domain error delivered to callers of the client.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClientError {
    /// Caller supplied invalid arguments.
    #[error("invalid argument: {0}")]
    Validation(String),
    /// Token acquisition failed.
    #[error("security token acquisition failed: {0}")]
    Security(#[from] SecurityError),
    /// An attempt produced no answer before its deadline.
    #[error("operation timed out: {0}")]
    Timeout(String),
    /// The service asked the caller to back off.
    #[error("server busy: {0}")]
    ServerBusy(String),
    /// Protocol-level failure not covered by a more specific variant.
    #[error("{description} (condition: {condition}, retryable: {retryable})")]
    Transport { condition: String, description: String, retryable: bool },
    /// The addressed entity does not exist.
    #[error("entity not found: {0}")]
    IllegalEntity(String),
    /// The presented credentials do not grant access.
    #[error("unauthorized: {0}")]
    Authorization(String),
    /// A service quota was exhausted.
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),
    /// A consumer with a higher epoch preempted this one.
    #[error("receiver disconnected: {0}")]
    ReceiverDisconnected(String),
    /// Something failed that the core has no classification for.
    #[error("unexpected failure: {0}")]
    Internal(String),
    /// The scheduler refused to run the next attempt.
    #[error("could not schedule work: {0}")]
    Scheduling(String),
    /// A management response lacked a field or carried the wrong type.
    #[error("malformed management response: {0}")]
    MalformedResponse(String),
    /// The client was closed.
    #[error("client is closed")]
    Closed,
}

impl ClientError {
    /// Convenience constructor for a protocol failure the caller wants retried.
    pub fn retryable(condition: impl Into<String>, description: impl Into<String>) -> Self {
        Self::Transport { condition: condition.into(), description: description.into(), retryable: true }
    }

    /// Whether the retry loop may attempt the operation again after this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::ServerBusy(_) => true,
            Self::Transport { retryable, .. } => *retryable,
            _ => false,
        }
    }

    /// Check if this error was raised by argument validation.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Check if this error is a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    /// Check if this error means the service is throttling.
    pub fn is_server_busy(&self) -> bool {
        matches!(self, Self::ServerBusy(_))
    }
}

/// Protocol-level error object as reported by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolError {
    condition: String,
    description: String,
}

impl ProtocolError {
    pub fn new(condition: impl Into<String>, description: impl Into<String>) -> Self {
        Self { condition: condition.into(), description: description.into() }
    }

    pub fn condition(&self) -> &str {
        &self.condition
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Translate the condition code into the domain taxonomy.
    pub fn to_client_error(&self) -> ClientError {
        let description = self.description.clone();
        match self.condition.as_str() {
            conditions::TIMEOUT => ClientError::Timeout(description),
            conditions::SERVER_BUSY => ClientError::ServerBusy(description),
            conditions::INTERNAL_ERROR
            | conditions::CONNECTION_FORCED
            | conditions::LINK_DETACH_FORCED => {
                ClientError::retryable(self.condition.clone(), description)
            }
            conditions::NOT_FOUND | conditions::ENTITY_NOT_FOUND => {
                ClientError::IllegalEntity(description)
            }
            conditions::UNAUTHORIZED_ACCESS => ClientError::Authorization(description),
            conditions::RESOURCE_LIMIT_EXCEEDED => ClientError::QuotaExceeded(description),
            conditions::LINK_STOLEN => ClientError::ReceiverDisconnected(description),
            conditions::ARGUMENT_ERROR | conditions::ARGUMENT_OUT_OF_RANGE => {
                ClientError::Validation(description)
            }
            other => ClientError::Transport {
                condition: other.to_string(),
                description,
                retryable: false,
            },
        }
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.condition, self.description)
    }
}

impl std::error::Error for ProtocolError {}

/// Raw failure returned by a transport call, before classification.
#[derive(Debug)]
pub enum TransportFailure {
    /// A protocol error object.
    Protocol(ProtocolError),
    /// An error that is already part of the domain taxonomy.
    Client(ClientError),
    /// A composition or execution wrapper around the actual cause.
    Wrapped { context: String, source: Box<TransportFailure> },
    /// Anything else the transport surfaced.
    Other(Arc<dyn std::error::Error + Send + Sync>),
}

impl TransportFailure {
    /// Wrap `self` in a layer of context, the way executors wrap task failures.
    pub fn wrap(self, context: impl Into<String>) -> Self {
        Self::Wrapped { context: context.into(), source: Box::new(self) }
    }

    /// Box an arbitrary error as an unclassified failure.
    pub fn other<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Other(Arc::new(error))
    }

    /// Strip every wrapper and return the innermost failure.
    pub fn into_root_cause(self) -> Self {
        let mut current = self;
        while let Self::Wrapped { source, .. } = current {
            current = *source;
        }
        current
    }

    /// Unwrap to the root cause and map it into the domain taxonomy.
    pub fn classify(self) -> ClientError {
        match self.into_root_cause() {
            Self::Protocol(protocol) => protocol.to_client_error(),
            Self::Client(error) => error,
            Self::Other(error) => ClientError::Internal(format!("got an unexpected error: {error}")),
            Self::Wrapped { context, .. } => ClientError::Internal(context),
        }
    }
}

impl fmt::Display for TransportFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Protocol(p) => write!(f, "protocol error {}", p),
            Self::Client(e) => write!(f, "{}", e),
            Self::Wrapped { context, source } => write!(f, "{}: {}", context, source),
            Self::Other(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for TransportFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Protocol(p) => Some(p),
            Self::Client(e) => Some(e),
            Self::Wrapped { source, .. } => Some(source.as_ref()),
            Self::Other(e) => Some(e.as_ref()),
        }
    }
}

impl From<ProtocolError> for TransportFailure {
    fn from(error: ProtocolError) -> Self {
        Self::Protocol(error)
    }
}

impl From<ClientError> for TransportFailure {
    fn from(error: ClientError) -> Self {
        Self::Client(error)
    }
}

/// Errors raised by lease bookkeeping and lease stores.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LeaseError {
    /// No lease exists for the partition.
    #[error("no lease exists for partition {partition_id}")]
    NotFound { partition_id: String },
    /// The caller no longer holds the lease.
    #[error("lease for partition {partition_id} is no longer held by {owner:?}")]
    Lost { partition_id: String, owner: String },
    /// Another actor changed the lease since the caller last read it.
    #[error("lease for partition {partition_id} was modified concurrently")]
    Conflict { partition_id: String },
    /// The backing store failed.
    #[error("lease store failure: {0}")]
    Store(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;
    use std::io;

    #[test]
    fn retryable_classes() {
        assert!(ClientError::Timeout("t".into()).is_retryable());
        assert!(ClientError::ServerBusy("b".into()).is_retryable());
        assert!(ClientError::retryable("x", "y").is_retryable());
        assert!(!ClientError::Validation("v".into()).is_retryable());
        assert!(!ClientError::Scheduling("s".into()).is_retryable());
        assert!(!ClientError::Security(SecurityError::Io("down".into())).is_retryable());
    }

    #[test]
    fn protocol_conditions_translate() {
        let busy = ProtocolError::new(conditions::SERVER_BUSY, "slow down").to_client_error();
        assert!(busy.is_server_busy());
        let stolen = ProtocolError::new(conditions::LINK_STOLEN, "epoch 4 wins").to_client_error();
        assert!(matches!(stolen, ClientError::ReceiverDisconnected(_)));
        assert!(!stolen.is_retryable());
        let internal = ProtocolError::new(conditions::INTERNAL_ERROR, "oops").to_client_error();
        assert!(internal.is_retryable());
        let unknown = ProtocolError::new("vendor:odd", "?").to_client_error();
        assert!(matches!(unknown, ClientError::Transport { retryable: false, .. }));
    }

    #[test]
    fn classify_peels_every_wrapper() {
        let failure = TransportFailure::from(ProtocolError::new(conditions::TIMEOUT, "late"))
            .wrap("execution failed")
            .wrap("completion failed");
        let error = failure.classify();
        assert!(error.is_timeout(), "got {error:?}");
    }

    #[test]
    fn unexpected_errors_are_not_retryable() {
        let failure =
            TransportFailure::other(io::Error::new(io::ErrorKind::Other, "disk on fire")).wrap("x");
        let error = failure.classify();
        assert!(matches!(error, ClientError::Internal(ref m) if m.contains("disk on fire")));
        assert!(!error.is_retryable());
    }

    #[test]
    fn wrapped_failure_exposes_source_chain() {
        let failure = TransportFailure::from(ClientError::Closed).wrap("outer");
        let source = failure.source().expect("source");
        assert!(source.to_string().contains("client is closed"));
        assert!(failure.to_string().starts_with("outer"));
    }

    #[test]
    fn security_error_converts() {
        let error: ClientError = SecurityError::InvalidKey("short".into()).into();
        assert!(error.to_string().contains("invalid signing key"));
    }
}
