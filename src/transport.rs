//! Collaborators the client core consumes but does not implement: the messaging factory that
//! owns the connection, the senders and receivers it opens, the management channel, and the
//! token provider. Also the event and batch types that cross those seams.

use crate::error::{ClientError, SecurityError, TransportFailure};
use crate::management::{ManagementRequest, ManagementResponse};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// One event: an opaque body plus application properties.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventData {
    body: Vec<u8>,
    properties: BTreeMap<String, String>,
}

impl EventData {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self { body: body.into(), properties: BTreeMap::new() }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    /// Bytes this event contributes to a batch.
    pub fn size_in_bytes(&self) -> usize {
        self.properties
            .iter()
            .fold(self.body.len(), |acc, (k, v)| acc.saturating_add(k.len()).saturating_add(v.len()))
    }
}

impl From<&str> for EventData {
    fn from(body: &str) -> Self {
        EventData::new(body.as_bytes())
    }
}

/// Options for [`crate::EventStreamClient::create_batch`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOptions {
    /// Upper bound for the batch; defaults to the sender's maximum message size.
    pub max_message_size: Option<usize>,
    /// Route the whole batch by this key.
    pub partition_key: Option<String>,
}

impl BatchOptions {
    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = Some(size);
        self
    }

    pub fn with_partition_key(mut self, key: impl Into<String>) -> Self {
        self.partition_key = Some(key.into());
        self
    }
}

/// Size-bounded batch of events built ahead of a send.
#[derive(Debug, Clone)]
pub struct EventDataBatch {
    max_size: usize,
    partition_key: Option<String>,
    events: Vec<EventData>,
    size: usize,
}

impl EventDataBatch {
    pub fn new(max_size: usize, partition_key: Option<String>) -> Self {
        Self { max_size, partition_key, events: Vec::new(), size: 0 }
    }

    /// Add `event` if it fits; returns `false` and leaves the batch unchanged otherwise.
    pub fn try_add(&mut self, event: EventData) -> bool {
        let size = self.size.saturating_add(event.size_in_bytes());
        if size > self.max_size {
            return false;
        }
        self.size = size;
        self.events.push(event);
        true
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn size_in_bytes(&self) -> usize {
        self.size
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn partition_key(&self) -> Option<&str> {
        self.partition_key.as_deref()
    }

    pub fn events(&self) -> &[EventData] {
        &self.events
    }

    pub(crate) fn into_parts(self) -> (Vec<EventData>, Option<String>) {
        (self.events, self.partition_key)
    }
}

/// Where a receiver starts reading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventPosition {
    StartOfStream,
    EndOfStream,
    Offset { offset: String, inclusive: bool },
    SequenceNumber { sequence_number: i64, inclusive: bool },
    EnqueuedTime(SystemTime),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiverOptions {
    /// Name reported to the service, visible in "receiver disconnected" errors of other owners.
    pub identifier: Option<String>,
    pub prefetch_count: u32,
    pub receiver_runtime_metrics: bool,
}

impl Default for ReceiverOptions {
    fn default() -> Self {
        Self { identifier: None, prefetch_count: 500, receiver_runtime_metrics: false }
    }
}

/// Everything the factory needs to open a partition receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiverLink {
    pub consumer_group: String,
    pub partition_id: String,
    pub position: EventPosition,
    /// `Some` opens an exclusive receiver that preempts any receiver with a lower epoch.
    pub epoch: Option<i64>,
    pub options: ReceiverOptions,
}

/// Data-plane sender shared by every send on a client.
#[async_trait]
pub trait EventSender: Send + Sync {
    /// Largest message the link accepts, in bytes.
    fn max_message_size(&self) -> usize;

    async fn send(&self, events: Vec<EventData>, partition_key: Option<String>) -> Result<(), ClientError>;

    async fn close(&self) -> Result<(), ClientError>;
}

/// Request/response channel for management operations.
///
/// `Ok(None)` means the channel gave up waiting without an error to report.
#[async_trait]
pub trait ManagementChannel: Send + Sync {
    async fn request(
        &self,
        request: &ManagementRequest,
    ) -> Result<Option<ManagementResponse>, TransportFailure>;
}

/// Issues security tokens for management requests.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn get_token(&self, audience: &str, refresh_interval: Duration) -> Result<String, SecurityError>;
}

#[async_trait]
pub trait PartitionReceiver: Send + Sync {
    fn partition_id(&self) -> &str;

    /// `None` for a non-exclusive receiver.
    fn epoch(&self) -> Option<i64>;

    async fn receive(&self, max_event_count: usize) -> Result<Vec<EventData>, ClientError>;

    async fn close(&self) -> Result<(), ClientError>;
}

/// Connection-level factory owning the underlying session.
#[async_trait]
pub trait MessagingFactory: Send + Sync {
    fn host_name(&self) -> &str;

    fn management_channel(&self) -> Arc<dyn ManagementChannel>;

    fn token_provider(&self) -> Arc<dyn TokenProvider>;

    async fn create_sender(
        &self,
        link_name: &str,
        entity_path: &str,
    ) -> Result<Arc<dyn EventSender>, ClientError>;

    async fn create_receiver(
        &self,
        entity_path: &str,
        link: ReceiverLink,
    ) -> Result<Box<dyn PartitionReceiver>, ClientError>;

    async fn close(&self) -> Result<(), ClientError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_refuses_overflow() {
        let mut batch = EventDataBatch::new(10, None);
        assert!(batch.try_add(EventData::new(vec![0u8; 6])));
        assert!(!batch.try_add(EventData::new(vec![0u8; 6])));
        assert!(batch.try_add(EventData::from("abcd")));
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.size_in_bytes(), 10);
    }

    #[test]
    fn properties_count_towards_size() {
        let event = EventData::from("body").with_property("k", "value");
        assert_eq!(event.size_in_bytes(), 4 + 1 + 5);
        assert_eq!(event.properties().get("k").map(String::as_str), Some("value"));
    }

    #[test]
    fn batch_keeps_partition_key() {
        let batch = EventDataBatch::new(100, Some("device-7".into()));
        assert_eq!(batch.partition_key(), Some("device-7"));
        assert!(batch.is_empty());
        let (events, key) = batch.into_parts();
        assert!(events.is_empty());
        assert_eq!(key.as_deref(), Some("device-7"));
    }
}
