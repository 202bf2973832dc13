#![allow(dead_code)]

use async_trait::async_trait;
use eventline::error::TransportFailure;
use eventline::{
    ClientError, EventData, EventSender, ManagementChannel, ManagementRequest, ManagementResponse,
    MessagingFactory, PartitionReceiver, ReceiverLink, SecurityError, TokenProvider,
};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::fmt::MakeWriter;

pub type Script = dyn Fn(u32) -> Result<Option<ManagementResponse>, TransportFailure> + Send + Sync;

/// Management channel whose answer depends on the 1-based call number.
pub struct ScriptedChannel {
    calls: AtomicU32,
    script: Box<Script>,
    requests: Mutex<Vec<ManagementRequest>>,
}

impl ScriptedChannel {
    pub fn new(
        script: impl Fn(u32) -> Result<Option<ManagementResponse>, TransportFailure> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self { calls: AtomicU32::new(0), script: Box::new(script), requests: Mutex::new(Vec::new()) })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<ManagementRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ManagementChannel for ScriptedChannel {
    async fn request(
        &self,
        request: &ManagementRequest,
    ) -> Result<Option<ManagementResponse>, TransportFailure> {
        self.requests.lock().unwrap().push(request.clone());
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        (self.script)(call)
    }
}

pub struct StaticTokenProvider(pub String);

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn get_token(&self, _audience: &str, _refresh: Duration) -> Result<String, SecurityError> {
        Ok(self.0.clone())
    }
}

/// Hands out a fixed token and counts how often it was asked.
#[derive(Default)]
pub struct CountingTokenProvider {
    pub requests: AtomicUsize,
}

#[async_trait]
impl TokenProvider for CountingTokenProvider {
    async fn get_token(&self, _audience: &str, _refresh: Duration) -> Result<String, SecurityError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        Ok("token-counted".into())
    }
}

pub struct FailingTokenProvider;

#[async_trait]
impl TokenProvider for FailingTokenProvider {
    async fn get_token(&self, _audience: &str, _refresh: Duration) -> Result<String, SecurityError> {
        Err(SecurityError::InvalidKey("key rejected".into()))
    }
}

/// Records what was sent and when it was closed.
pub struct FakeSender {
    pub max_message_size: usize,
    pub sent: Mutex<Vec<(Vec<EventData>, Option<String>)>>,
    shutdown_log: Arc<Mutex<Vec<&'static str>>>,
}

#[async_trait]
impl EventSender for FakeSender {
    fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    async fn send(&self, events: Vec<EventData>, partition_key: Option<String>) -> Result<(), ClientError> {
        self.sent.lock().unwrap().push((events, partition_key));
        Ok(())
    }

    async fn close(&self) -> Result<(), ClientError> {
        self.shutdown_log.lock().unwrap().push("sender");
        Ok(())
    }
}

pub struct FakeReceiver {
    link: ReceiverLink,
}

#[async_trait]
impl PartitionReceiver for FakeReceiver {
    fn partition_id(&self) -> &str {
        &self.link.partition_id
    }

    fn epoch(&self) -> Option<i64> {
        self.link.epoch
    }

    async fn receive(&self, _max_event_count: usize) -> Result<Vec<EventData>, ClientError> {
        Ok(Vec::new())
    }

    async fn close(&self) -> Result<(), ClientError> {
        Ok(())
    }
}

pub struct FakeFactory {
    pub channel: Arc<ScriptedChannel>,
    pub tokens: Arc<dyn TokenProvider>,
    pub sender: Arc<FakeSender>,
    pub sender_creations: AtomicUsize,
    /// Sender creations that fail before one succeeds.
    pub failing_creations: AtomicUsize,
    pub creation_delay: Duration,
    pub receivers: Mutex<Vec<ReceiverLink>>,
    pub shutdown_log: Arc<Mutex<Vec<&'static str>>>,
}

impl FakeFactory {
    pub fn new(channel: Arc<ScriptedChannel>) -> Self {
        let shutdown_log = Arc::new(Mutex::new(Vec::new()));
        Self {
            channel,
            tokens: Arc::new(StaticTokenProvider("token-123".into())),
            sender: Arc::new(FakeSender {
                max_message_size: 1024,
                sent: Mutex::new(Vec::new()),
                shutdown_log: shutdown_log.clone(),
            }),
            sender_creations: AtomicUsize::new(0),
            failing_creations: AtomicUsize::new(0),
            creation_delay: Duration::ZERO,
            receivers: Mutex::new(Vec::new()),
            shutdown_log,
        }
    }

    pub fn with_tokens(mut self, tokens: Arc<dyn TokenProvider>) -> Self {
        self.tokens = tokens;
        self
    }

    pub fn with_creation_delay(mut self, delay: Duration) -> Self {
        self.creation_delay = delay;
        self
    }

    pub fn failing_creations(self, count: usize) -> Self {
        self.failing_creations.store(count, Ordering::SeqCst);
        self
    }

    pub fn creations(&self) -> usize {
        self.sender_creations.load(Ordering::SeqCst)
    }

    pub fn shutdown_log(&self) -> Vec<&'static str> {
        self.shutdown_log.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessagingFactory for FakeFactory {
    fn host_name(&self) -> &str {
        "example.servicebus.windows.net"
    }

    fn management_channel(&self) -> Arc<dyn ManagementChannel> {
        self.channel.clone()
    }

    fn token_provider(&self) -> Arc<dyn TokenProvider> {
        self.tokens.clone()
    }

    async fn create_sender(
        &self,
        _link_name: &str,
        _entity_path: &str,
    ) -> Result<Arc<dyn EventSender>, ClientError> {
        self.sender_creations.fetch_add(1, Ordering::SeqCst);
        if !self.creation_delay.is_zero() {
            tokio::time::sleep(self.creation_delay).await;
        }
        let failing = self.failing_creations.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_creations.store(failing - 1, Ordering::SeqCst);
            return Err(ClientError::ServerBusy("link refused".into()));
        }
        Ok(self.sender.clone())
    }

    async fn create_receiver(
        &self,
        _entity_path: &str,
        link: ReceiverLink,
    ) -> Result<Box<dyn PartitionReceiver>, ClientError> {
        self.receivers.lock().unwrap().push(link.clone());
        Ok(Box::new(FakeReceiver { link }))
    }

    async fn close(&self) -> Result<(), ClientError> {
        self.shutdown_log.lock().unwrap().push("factory");
        Ok(())
    }
}

/// Captures formatted log output for assertions.
#[derive(Clone, Default)]
pub struct SharedWriter(pub Arc<Mutex<Vec<u8>>>);

impl<'a> MakeWriter<'a> for SharedWriter {
    type Writer = SharedGuard;
    fn make_writer(&'a self) -> Self::Writer {
        SharedGuard(self.0.clone())
    }
}

pub struct SharedGuard(Arc<Mutex<Vec<u8>>>);

impl std::io::Write for SharedGuard {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl SharedWriter {
    pub fn contents(&self) -> String {
        String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
    }
}

/// Install a thread-local subscriber writing into the returned buffer.
pub fn capture_logs() -> (SharedWriter, tracing::subscriber::DefaultGuard) {
    let writer = SharedWriter::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(BoxMakeWriter::new(writer.clone()))
        .with_target(true)
        .with_max_level(tracing::Level::DEBUG)
        .without_time()
        .with_ansi(false)
        .finish();
    let guard = tracing::subscriber::set_default(subscriber);
    (writer, guard)
}
