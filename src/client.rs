//! The event-stream client: send path, management path, receivers and shutdown.
//!
//! Sends validate their arguments synchronously and return a [`SendFuture`]; everything else
//! (closed client, sender creation failure, transport failure) arrives through that future.
//! The shared sender is created on first use by a [`SingleFlight`], so concurrent first sends
//! open exactly one link.
//!
//! Management queries acquire a fresh security token, then run through [`ManagementRetry`] with
//! a deadline of [`ClientConfig::operation_timeout`] from the start of the call. They are plain
//! `async fn`s, so argument validation (an empty partition id, for example) is reported by the
//! returned future rather than synchronously. It still runs before any token or request work.

use crate::config::ClientConfig;
use crate::lease::Lease;
use crate::management::{keys, ManagementRequest, ManagementResponse, ManagementRetry, ManagementValue};
use crate::runtime_info::{HubRuntimeInformation, PartitionRuntimeInformation};
use crate::scheduler::{DelayedScheduler, TokioScheduler};
use crate::single_flight::SingleFlight;
use crate::telemetry::ClientEvent;
use crate::transport::{
    BatchOptions, EventData, EventDataBatch, EventPosition, EventSender, MessagingFactory,
    PartitionReceiver, ReceiverLink, ReceiverOptions,
};
use crate::ClientError;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// How long a management token stays valid.
pub const TOKEN_REFRESH_INTERVAL: Duration = Duration::from_secs(600);

/// Completion of a send: `Ok(())` once the sender accepted the events.
pub type SendFuture = BoxFuture<'static, Result<(), ClientError>>;

/// Client for one event hub. Clones share the connection, sender and retry state.
#[derive(Clone, Debug)]
pub struct EventStreamClient {
    inner: Arc<Inner>,
}

struct Inner {
    config: ClientConfig,
    client_id: String,
    factory: Arc<dyn MessagingFactory>,
    sender: SingleFlight<Arc<dyn EventSender>>,
    management: ManagementRetry,
    scheduler: Arc<dyn DelayedScheduler>,
    owns_scheduler: bool,
    // Shared with sender creations so one that finishes after close can undo itself.
    closed: Arc<AtomicBool>,
}

impl std::fmt::Debug for Inner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStreamClient")
            .field("entity_path", &self.config.entity_path())
            .field("client_id", &self.client_id)
            .field("sender", &self.sender)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Inner {
    fn ensure_open(&self) -> Result<(), ClientError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ClientError::Closed);
        }
        Ok(())
    }

    async fn sender(&self) -> Result<Arc<dyn EventSender>, ClientError> {
        let factory = self.factory.clone();
        let entity_path = self.config.entity_path().to_string();
        let telemetry = self.config.telemetry().clone();
        let closed = self.closed.clone();
        self.sender
            .ensure_created(move || async move {
                let link_name = Uuid::new_v4().to_string();
                match factory.create_sender(&link_name, &entity_path).await {
                    Ok(sender) if closed.load(Ordering::Acquire) => {
                        tracing::debug!(target: "eventline::client", entity_path = %entity_path, link_name = %link_name, "client closed during sender creation, closing new sender");
                        if let Err(error) = sender.close().await {
                            tracing::warn!(target: "eventline::client", entity_path = %entity_path, error = %error, "closing late sender failed");
                        }
                        Err(ClientError::Closed)
                    }
                    Ok(sender) => {
                        tracing::info!(target: "eventline::client", entity_path = %entity_path, link_name = %link_name, "sender created");
                        telemetry.emit(ClientEvent::SenderCreated).await;
                        Ok(sender)
                    }
                    Err(error) => {
                        tracing::warn!(target: "eventline::client", entity_path = %entity_path, error = %error, "sender creation failed");
                        telemetry
                            .emit(ClientEvent::SenderCreationFailed { reason: error.to_string() })
                            .await;
                        Err(error)
                    }
                }
            })
            .await
    }

    fn audience(&self) -> String {
        format!("amqp://{}/{}", self.factory.host_name(), self.config.entity_path())
    }

    async fn management(&self, mut request: ManagementRequest) -> Result<ManagementResponse, ClientError> {
        self.ensure_open()?;
        let token = self
            .factory
            .token_provider()
            .get_token(&self.audience(), TOKEN_REFRESH_INTERVAL)
            .await?;
        request.insert(keys::SECURITY_TOKEN.to_string(), ManagementValue::String(token));

        let timeout = self.config.operation_timeout();
        match self.management.execute(request, timeout).await? {
            Some(response) => Ok(response),
            None => Err(ClientError::Timeout(format!(
                "management request produced no response within {timeout:?}"
            ))),
        }
    }

    fn validate_partition_key(&self, partition_key: String) -> Result<String, ClientError> {
        let max = self.config.max_partition_key_length();
        if partition_key.chars().count() > max {
            return Err(ClientError::Validation(format!(
                "PartitionKey exceeds the maximum allowed length of partitionKey: {max}"
            )));
        }
        Ok(partition_key)
    }
}

fn require_events(events: Vec<EventData>) -> Result<Vec<EventData>, ClientError> {
    if events.is_empty() {
        return Err(ClientError::Validation("Empty batch of EventData cannot be sent.".into()));
    }
    Ok(events)
}

fn require_name(what: &str, value: &str) -> Result<(), ClientError> {
    if value.is_empty() {
        return Err(ClientError::Validation(format!("{what} cannot be empty")));
    }
    Ok(())
}

impl EventStreamClient {
    /// Build a client on an established factory.
    ///
    /// Uses the scheduler from `config` when one is set; otherwise creates a [`TokioScheduler`]
    /// on the current runtime and shuts it down on [`EventStreamClient::close`].
    pub fn new(factory: Arc<dyn MessagingFactory>, config: ClientConfig) -> Result<Self, ClientError> {
        let (scheduler, owns_scheduler): (Arc<dyn DelayedScheduler>, bool) = match config.scheduler() {
            Some(scheduler) => (scheduler.clone(), false),
            None => (Arc::new(TokioScheduler::current()?) as Arc<dyn DelayedScheduler>, true),
        };
        let client_id = format!("{}-{}", config.entity_path(), Uuid::new_v4().simple());
        let management = ManagementRetry::new(
            client_id.clone(),
            factory.management_channel(),
            config.retry_policy().clone(),
            scheduler.clone(),
        )
        .with_telemetry(config.telemetry().clone());

        tracing::debug!(target: "eventline::client", client_id = %client_id, entity_path = %config.entity_path(), "client created");
        Ok(Self {
            inner: Arc::new(Inner {
                sender: SingleFlight::new(config.creation_failure_policy()),
                config,
                client_id,
                factory,
                management,
                scheduler,
                owns_scheduler,
                closed: Arc::new(AtomicBool::new(false)),
            }),
        })
    }

    /// Establish the factory with `connect`, then build the client on it.
    pub async fn connect<Fut>(connect: Fut, config: ClientConfig) -> Result<Self, ClientError>
    where
        Fut: Future<Output = Result<Arc<dyn MessagingFactory>, ClientError>>,
    {
        let factory = connect.await?;
        Self::new(factory, config)
    }

    pub fn entity_path(&self) -> &str {
        self.inner.config.entity_path()
    }

    /// Identifier the retry policy keys its attempt counters by.
    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Whether the shared sender has been created.
    pub fn has_sender(&self) -> bool {
        self.inner.sender.get().is_some()
    }

    fn dispatch(&self, events: Vec<EventData>, partition_key: Option<String>) -> SendFuture {
        let inner = self.inner.clone();
        async move {
            inner.ensure_open()?;
            let sender = inner.sender().await?;
            sender.send(events, partition_key).await
        }
        .boxed()
    }

    pub fn send(&self, event: EventData) -> Result<SendFuture, ClientError> {
        Ok(self.dispatch(vec![event], None))
    }

    pub fn send_with_partition_key(
        &self,
        event: EventData,
        partition_key: impl Into<String>,
    ) -> Result<SendFuture, ClientError> {
        let partition_key = self.inner.validate_partition_key(partition_key.into())?;
        Ok(self.dispatch(vec![event], Some(partition_key)))
    }

    /// Send events as one batch. An empty batch is rejected before any work starts.
    pub fn send_batch<I>(&self, events: I) -> Result<SendFuture, ClientError>
    where
        I: IntoIterator<Item = EventData>,
    {
        let events = require_events(events.into_iter().collect())?;
        Ok(self.dispatch(events, None))
    }

    pub fn send_batch_with_partition_key<I>(
        &self,
        events: I,
        partition_key: impl Into<String>,
    ) -> Result<SendFuture, ClientError>
    where
        I: IntoIterator<Item = EventData>,
    {
        let events = require_events(events.into_iter().collect())?;
        let partition_key = self.inner.validate_partition_key(partition_key.into())?;
        Ok(self.dispatch(events, Some(partition_key)))
    }

    /// Send a batch built with [`EventStreamClient::create_batch`], routed by its partition key.
    pub fn send_event_batch(&self, batch: EventDataBatch) -> Result<SendFuture, ClientError> {
        let (events, partition_key) = batch.into_parts();
        match partition_key {
            Some(key) => self.send_batch_with_partition_key(events, key),
            None => self.send_batch(events),
        }
    }

    /// Empty batch sized for the shared sender. Creates the sender if needed.
    pub async fn create_batch(&self, options: BatchOptions) -> Result<EventDataBatch, ClientError> {
        self.inner.ensure_open()?;
        let partition_key = options
            .partition_key
            .map(|key| self.inner.validate_partition_key(key))
            .transpose()?;
        let sender = self.inner.sender().await?;
        let link_max = sender.max_message_size();
        match options.max_message_size {
            None => Ok(EventDataBatch::new(link_max, partition_key)),
            Some(requested) if requested > link_max => Err(ClientError::Validation(format!(
                "The maxMessageSize set in BatchOptions is too large. You set a maxMessageSize of {requested}. The maximum allowed size is {link_max}."
            ))),
            Some(requested) => Ok(EventDataBatch::new(requested, partition_key)),
        }
    }

    pub async fn get_runtime_information(&self) -> Result<HubRuntimeInformation, ClientError> {
        let request = ManagementRequest::from([
            (keys::ENTITY_TYPE.to_string(), ManagementValue::from(keys::EVENTHUB_ENTITY_TYPE)),
            (keys::ENTITY_NAME.to_string(), ManagementValue::from(self.entity_path())),
            (keys::OPERATION.to_string(), ManagementValue::from(keys::READ_OPERATION)),
        ]);
        let response = self.inner.management(request).await?;
        HubRuntimeInformation::try_from(&response)
    }

    /// Runtime information for one partition.
    ///
    /// An empty `partition_id` fails with [`ClientError::Validation`] when the returned future is
    /// first polled. No token is requested and nothing reaches the management channel.
    pub async fn get_partition_runtime_information(
        &self,
        partition_id: &str,
    ) -> Result<PartitionRuntimeInformation, ClientError> {
        require_name("partition id", partition_id)?;
        let request = ManagementRequest::from([
            (keys::ENTITY_TYPE.to_string(), ManagementValue::from(keys::PARTITION_ENTITY_TYPE)),
            (keys::ENTITY_NAME.to_string(), ManagementValue::from(self.entity_path())),
            (keys::PARTITION_NAME.to_string(), ManagementValue::from(partition_id)),
            (keys::OPERATION.to_string(), ManagementValue::from(keys::READ_OPERATION)),
        ]);
        let response = self.inner.management(request).await?;
        PartitionRuntimeInformation::try_from(&response)
    }

    /// Open a receiver described by `link`.
    pub async fn open_receiver(&self, link: ReceiverLink) -> Result<Box<dyn PartitionReceiver>, ClientError> {
        self.inner.ensure_open()?;
        require_name("consumer group", &link.consumer_group)?;
        require_name("partition id", &link.partition_id)?;
        tracing::debug!(target: "eventline::client", partition_id = %link.partition_id, epoch = ?link.epoch, "opening receiver");
        self.inner.factory.create_receiver(self.entity_path(), link).await
    }

    /// Non-exclusive receiver.
    pub async fn create_receiver(
        &self,
        consumer_group: &str,
        partition_id: &str,
        position: EventPosition,
    ) -> Result<Box<dyn PartitionReceiver>, ClientError> {
        self.open_receiver(ReceiverLink {
            consumer_group: consumer_group.to_string(),
            partition_id: partition_id.to_string(),
            position,
            epoch: None,
            options: ReceiverOptions::default(),
        })
        .await
    }

    /// Exclusive receiver; preempts receivers on the same partition with a lower epoch.
    pub async fn create_epoch_receiver(
        &self,
        consumer_group: &str,
        partition_id: &str,
        position: EventPosition,
        epoch: i64,
    ) -> Result<Box<dyn PartitionReceiver>, ClientError> {
        self.open_receiver(ReceiverLink {
            consumer_group: consumer_group.to_string(),
            partition_id: partition_id.to_string(),
            position,
            epoch: Some(epoch),
            options: ReceiverOptions::default(),
        })
        .await
    }

    /// Exclusive receiver for the partition `lease` covers, at the lease's epoch, identified
    /// by the lease owner.
    pub async fn create_receiver_for_lease(
        &self,
        consumer_group: &str,
        lease: &Lease,
        position: EventPosition,
    ) -> Result<Box<dyn PartitionReceiver>, ClientError> {
        if lease.is_unknown() {
            return Err(ClientError::Validation("lease does not name a partition".into()));
        }
        if lease.owner().is_empty() {
            return Err(ClientError::Validation(format!(
                "lease for partition {} is not owned",
                lease.partition_id()
            )));
        }
        self.open_receiver(ReceiverLink {
            consumer_group: consumer_group.to_string(),
            partition_id: lease.partition_id().to_string(),
            position,
            epoch: Some(lease.epoch()),
            options: ReceiverOptions { identifier: Some(lease.owner().to_string()), ..ReceiverOptions::default() },
        })
        .await
    }

    /// Close the sender (if it was created) and then the factory. Later calls return `Ok(())`.
    ///
    /// A sender creation still in flight is waited for, up to
    /// [`ClientConfig::operation_timeout`], so its link is closed before the factory. A send
    /// waiting on that creation fails with [`ClientError::Closed`].
    pub async fn close(&self) -> Result<(), ClientError> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        tracing::debug!(target: "eventline::client", client_id = %self.inner.client_id, "closing client");

        let sender_closed = match self.inner.sender.get() {
            Some(sender) => sender.close().await,
            None => self.close_pending_sender().await,
        };
        let result = match sender_closed {
            Ok(()) => self.inner.factory.close().await,
            Err(error) => Err(error),
        };

        if self.inner.owns_scheduler {
            self.inner.scheduler.shutdown();
        }
        result
    }

    // A creation that saw the closed flag closes its own sender and settles with `Closed`.
    // One that finished just before the flag was set is published and closed here.
    async fn close_pending_sender(&self) -> Result<(), ClientError> {
        let timeout = self.inner.config.operation_timeout();
        match tokio::time::timeout(timeout, self.inner.sender.settled()).await {
            Ok(Some(Ok(sender))) => sender.close().await,
            Ok(Some(Err(_))) | Ok(None) => Ok(()),
            Err(_elapsed) => {
                tracing::warn!(target: "eventline::client", client_id = %self.inner.client_id, timeout_ms = timeout.as_millis() as u64, "sender creation still pending at close");
                Ok(())
            }
        }
    }
}
