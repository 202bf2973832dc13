mod common;

use common::{CountingTokenProvider, FailingTokenProvider, FakeFactory, ScriptedChannel};
use eventline::error::{conditions, ProtocolError};
use eventline::management::keys;
use eventline::telemetry::{ClientEvent, MemorySink};
use eventline::{
    BatchOptions, ClientConfig, ClientError, CreationFailurePolicy, EventData, EventPosition,
    EventStreamClient, InMemoryLeaseManager, Lease, LeaseManager, ManagementResponse,
    ManagementValue, NoRetry,
};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

fn hub_response() -> ManagementResponse {
    ManagementResponse::from([
        (keys::ENTITY_NAME.to_string(), ManagementValue::from("hub1")),
        (keys::CREATED_AT.to_string(), ManagementValue::from(SystemTime::UNIX_EPOCH)),
        (keys::PARTITION_COUNT.to_string(), ManagementValue::from(4)),
        (
            keys::PARTITION_IDS.to_string(),
            ManagementValue::from(vec!["0".to_string(), "1".into(), "2".into(), "3".into()]),
        ),
    ])
}

fn client_on(factory: Arc<FakeFactory>) -> EventStreamClient {
    let config = ClientConfig::builder("hub1").retry_policy(NoRetry).build().unwrap();
    EventStreamClient::new(factory, config).unwrap()
}

fn answering_factory() -> Arc<FakeFactory> {
    Arc::new(FakeFactory::new(ScriptedChannel::new(|_| Ok(Some(hub_response())))))
}

#[tokio::test]
async fn empty_batch_is_rejected_synchronously() {
    let factory = answering_factory();
    let client = client_on(factory.clone());

    let error = client.send_batch(Vec::new()).err().expect("empty batch must be rejected");
    assert!(error.is_validation());
    assert!(error.to_string().contains("Empty batch of EventData cannot be sent."));

    let error = client.send_event_batch(eventline::EventDataBatch::new(1024, None)).err().unwrap();
    assert!(error.is_validation());
    assert_eq!(factory.creations(), 0, "validation must not start any work");
}

#[tokio::test]
async fn overlong_partition_key_is_rejected_synchronously() {
    let factory = answering_factory();
    let client = client_on(factory.clone());
    let key = "k".repeat(129);

    assert!(client.send_with_partition_key(EventData::from("a"), key.clone()).is_err());
    assert!(client.send_batch_with_partition_key(vec![EventData::from("a")], key).is_err());
    assert_eq!(factory.creations(), 0);

    client
        .send_batch_with_partition_key(vec![EventData::from("a")], "k".repeat(128))
        .unwrap()
        .await
        .unwrap();
    client.send_with_partition_key(EventData::from("b"), "").unwrap().await.unwrap();

    let sent = factory.sender.sent.lock().unwrap().clone();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[1].1.as_deref(), Some(""), "an empty key is passed through");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_first_sends_create_one_sender() {
    let factory = Arc::new(
        FakeFactory::new(ScriptedChannel::new(|_| Ok(None))).with_creation_delay(Duration::from_millis(30)),
    );
    let client = client_on(factory.clone());
    let barrier = Arc::new(tokio::sync::Barrier::new(16));

    let tasks: Vec<_> = (0..16)
        .map(|i| {
            let client = client.clone();
            let barrier = barrier.clone();
            tokio::spawn(async move {
                barrier.wait().await;
                client.send(EventData::from(format!("event-{i}").as_str())).unwrap().await
            })
        })
        .collect();

    for task in futures::future::join_all(tasks).await {
        task.unwrap().unwrap();
    }
    assert_eq!(factory.creations(), 1);
    assert_eq!(factory.sender.sent.lock().unwrap().len(), 16);
    assert!(client.has_sender());
}

#[tokio::test]
async fn permanent_creation_failure_is_reported_to_every_caller() {
    let factory = Arc::new(answering_factory_with_failures(1));
    let client = client_on(factory.clone());

    let first = client.send(EventData::from("a")).unwrap().await.unwrap_err();
    let second = client.send(EventData::from("b")).unwrap().await.unwrap_err();
    assert!(first.is_server_busy());
    assert!(second.is_server_busy());
    assert_eq!(factory.creations(), 1);
}

#[tokio::test]
async fn creation_can_be_retried_on_next_call() {
    let factory = Arc::new(answering_factory_with_failures(1));
    let config = ClientConfig::builder("hub1")
        .creation_failure_policy(CreationFailurePolicy::RetryOnNextCall)
        .build()
        .unwrap();
    let client = EventStreamClient::new(factory.clone(), config).unwrap();

    assert!(client.send(EventData::from("a")).unwrap().await.is_err());
    client.send(EventData::from("b")).unwrap().await.unwrap();
    assert_eq!(factory.creations(), 2);
}

fn answering_factory_with_failures(count: usize) -> FakeFactory {
    FakeFactory::new(ScriptedChannel::new(|_| Ok(Some(hub_response())))).failing_creations(count)
}

#[tokio::test]
async fn runtime_information_is_mapped_and_token_is_attached() {
    let channel = ScriptedChannel::new(|_| Ok(Some(hub_response())));
    let factory = Arc::new(FakeFactory::new(channel.clone()));
    let client = client_on(factory);

    let info = client.get_runtime_information().await.unwrap();
    assert_eq!(info.path, "hub1");
    assert_eq!(info.partition_count, 4);
    assert_eq!(info.partition_ids, vec!["0", "1", "2", "3"]);
    assert_eq!(info.created_at, SystemTime::UNIX_EPOCH);

    let requests = channel.requests();
    assert_eq!(requests.len(), 1);
    let request = &requests[0];
    assert_eq!(request[keys::SECURITY_TOKEN].as_str(), Some("token-123"));
    assert_eq!(request[keys::ENTITY_TYPE].as_str(), Some(keys::EVENTHUB_ENTITY_TYPE));
    assert_eq!(request[keys::ENTITY_NAME].as_str(), Some("hub1"));
    assert_eq!(request[keys::OPERATION].as_str(), Some(keys::READ_OPERATION));
}

#[tokio::test]
async fn partition_information_request_names_the_partition() {
    let channel = ScriptedChannel::new(|_| {
        Ok(Some(ManagementResponse::from([
            (keys::ENTITY_NAME.to_string(), ManagementValue::from("hub1")),
            (keys::PARTITION_NAME.to_string(), ManagementValue::from("2")),
            (keys::BEGIN_SEQUENCE_NUMBER.to_string(), ManagementValue::from(10_i64)),
            (keys::LAST_ENQUEUED_SEQUENCE_NUMBER.to_string(), ManagementValue::from(99_i64)),
            (keys::LAST_ENQUEUED_OFFSET.to_string(), ManagementValue::from("4096")),
            (keys::LAST_ENQUEUED_TIME_UTC.to_string(), ManagementValue::from(SystemTime::UNIX_EPOCH)),
        ])))
    });
    let client = client_on(Arc::new(FakeFactory::new(channel.clone())));

    let info = client.get_partition_runtime_information("2").await.unwrap();
    assert_eq!(info.partition_id, "2");
    assert_eq!(info.last_enqueued_sequence_number, 99);
    assert_eq!(info.last_enqueued_offset, "4096");

    let request = &channel.requests()[0];
    assert_eq!(request[keys::ENTITY_TYPE].as_str(), Some(keys::PARTITION_ENTITY_TYPE));
    assert_eq!(request[keys::PARTITION_NAME].as_str(), Some("2"));

    let error = client.get_partition_runtime_information("").await.unwrap_err();
    assert!(error.is_validation());
    assert_eq!(channel.calls(), 1);
}

#[tokio::test]
async fn partition_id_validation_fails_through_the_future_before_any_work() {
    let channel = ScriptedChannel::new(|_| Ok(Some(hub_response())));
    let tokens = Arc::new(CountingTokenProvider::default());
    let factory = FakeFactory::new(channel.clone()).with_tokens(tokens.clone());
    let client = client_on(Arc::new(factory));

    let pending = client.get_partition_runtime_information("");
    assert_eq!(tokens.requests.load(std::sync::atomic::Ordering::SeqCst), 0);

    let error = pending.await.unwrap_err();
    assert!(error.is_validation(), "got {error:?}");
    assert_eq!(tokens.requests.load(std::sync::atomic::Ordering::SeqCst), 0, "no token was requested");
    assert_eq!(channel.calls(), 0, "no management request was sent");
}

#[tokio::test]
async fn token_failure_short_circuits_before_any_attempt() {
    let channel = ScriptedChannel::new(|_| Ok(Some(hub_response())));
    let factory = Arc::new(FakeFactory::new(channel.clone()).with_tokens(Arc::new(FailingTokenProvider)));
    let client = client_on(factory);

    let error = client.get_runtime_information().await.unwrap_err();
    assert!(matches!(error, ClientError::Security(_)), "got {error:?}");
    assert_eq!(channel.calls(), 0);
}

#[tokio::test]
async fn empty_management_answer_becomes_timeout() {
    let channel = ScriptedChannel::new(|_| Ok(None));
    let client = client_on(Arc::new(FakeFactory::new(channel)));

    let error = client.get_runtime_information().await.unwrap_err();
    assert!(error.is_timeout(), "got {error:?}");
}

#[tokio::test]
async fn management_errors_are_classified() {
    let channel = ScriptedChannel::new(|_| {
        Err(ProtocolError::new(conditions::UNAUTHORIZED_ACCESS, "claim missing").into())
    });
    let client = client_on(Arc::new(FakeFactory::new(channel.clone())));

    let error = client.get_runtime_information().await.unwrap_err();
    assert!(matches!(error, ClientError::Authorization(_)), "got {error:?}");
    assert_eq!(channel.calls(), 1);
}

#[tokio::test]
async fn close_shuts_down_sender_then_factory_once() {
    let factory = answering_factory();
    let client = client_on(factory.clone());
    client.send(EventData::from("a")).unwrap().await.unwrap();

    client.close().await.unwrap();
    client.close().await.unwrap();
    assert_eq!(factory.shutdown_log(), vec!["sender", "factory"]);
    assert!(client.is_closed());

    let error = client.send(EventData::from("late")).unwrap().await.unwrap_err();
    assert!(matches!(error, ClientError::Closed));
    let error = client.get_runtime_information().await.unwrap_err();
    assert!(matches!(error, ClientError::Closed));
}

#[tokio::test(start_paused = true)]
async fn close_during_sender_creation_closes_the_late_sender_first() {
    let factory = Arc::new(
        FakeFactory::new(ScriptedChannel::new(|_| Ok(None))).with_creation_delay(Duration::from_millis(200)),
    );
    let client = client_on(factory.clone());
    let send = tokio::spawn(client.send(EventData::from("racing")).unwrap());
    while factory.creations() == 0 {
        tokio::task::yield_now().await;
    }

    client.close().await.unwrap();
    assert_eq!(factory.shutdown_log(), vec!["sender", "factory"]);
    assert!(!client.has_sender());

    let error = send.await.unwrap().unwrap_err();
    assert!(matches!(error, ClientError::Closed), "got {error:?}");
    assert!(factory.sender.sent.lock().unwrap().is_empty());
}

#[tokio::test]
async fn close_without_sender_only_closes_factory() {
    let factory = answering_factory();
    let client = client_on(factory.clone());
    client.close().await.unwrap();
    assert_eq!(factory.shutdown_log(), vec!["factory"]);
    assert_eq!(factory.creations(), 0);
}

#[tokio::test]
async fn batches_are_sized_by_the_sender() {
    let factory = answering_factory();
    let client = client_on(factory.clone());

    let error = client
        .create_batch(BatchOptions::default().with_max_message_size(4096))
        .await
        .unwrap_err();
    assert!(error.is_validation());
    assert!(error.to_string().contains("maximum allowed size is 1024"));

    let mut batch = client
        .create_batch(BatchOptions::default().with_partition_key("device-7"))
        .await
        .unwrap();
    assert_eq!(batch.max_size(), 1024);
    assert!(batch.try_add(EventData::from("reading")));
    assert!(!batch.try_add(EventData::new(vec![0_u8; 2048])));

    client.send_event_batch(batch).unwrap().await.unwrap();
    let sent = factory.sender.sent.lock().unwrap().clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0.len(), 1);
    assert_eq!(sent[0].1.as_deref(), Some("device-7"));
}

#[tokio::test]
async fn lease_receiver_carries_epoch_and_owner() {
    let factory = answering_factory();
    let client = client_on(factory.clone());
    let leases = InMemoryLeaseManager::default();

    let lease = leases.create_lease_if_not_exists("3").await.unwrap();
    let lease = leases.acquire_lease(&lease, "host-a").await.unwrap();
    let lease = leases.acquire_lease(&lease, "host-b").await.unwrap();

    let receiver = client
        .create_receiver_for_lease("$Default", &lease, EventPosition::StartOfStream)
        .await
        .unwrap();
    assert_eq!(receiver.partition_id(), "3");
    assert_eq!(receiver.epoch(), Some(1));

    let links = factory.receivers.lock().unwrap().clone();
    assert_eq!(links[0].options.identifier.as_deref(), Some("host-b"));

    let unowned = Lease::new("4");
    let error = client
        .create_receiver_for_lease("$Default", &unowned, EventPosition::StartOfStream)
        .await
        .err()
        .unwrap();
    assert!(error.is_validation());
}

#[tokio::test]
async fn plain_receiver_has_no_epoch() {
    let factory = answering_factory();
    let client = client_on(factory.clone());

    let receiver = client.create_receiver("$Default", "0", EventPosition::EndOfStream).await.unwrap();
    assert_eq!(receiver.epoch(), None);

    let receiver = client
        .create_epoch_receiver("$Default", "1", EventPosition::EndOfStream, 7)
        .await
        .unwrap();
    assert_eq!(receiver.epoch(), Some(7));

    assert!(client.create_receiver("", "0", EventPosition::EndOfStream).await.is_err());
}

#[tokio::test]
async fn sender_creation_is_reported_through_telemetry() {
    let sink = MemorySink::new();
    let factory = answering_factory();
    let config = ClientConfig::builder("hub1").telemetry_sink(sink.clone()).build().unwrap();
    let client = EventStreamClient::new(factory, config).unwrap();

    client.send(EventData::from("a")).unwrap().await.unwrap();
    client.send(EventData::from("b")).unwrap().await.unwrap();

    let created: Vec<_> = sink.events().into_iter().filter(|e| matches!(e, ClientEvent::SenderCreated)).collect();
    assert_eq!(created.len(), 1);
}
