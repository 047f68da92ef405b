//! A single session to one broker.

use crate::config::{ClientConfig, ClientSettings};
use crate::correlator::{lock, Correlator, Response};
use crate::documents::{Deployment, Task, WorkflowInstance};
use crate::envelope::{CommandEnvelope, EnvelopeBuilder};
use crate::error::{ClientError, ClientResult};
use crate::subscription::{DeliveredItem, SubscriptionSlot, SubscriptionSpec, TaskSubscription};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use zb_proto::{read_frame, write_frame, BrokerFrame, ClientFrame, SubscribedTask};

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Serialises every write on the connection.
pub(crate) struct FrameWriter {
    inner: tokio::sync::Mutex<BoxedWriter>,
}

impl FrameWriter {
    fn new(writer: BoxedWriter) -> Self {
        Self {
            inner: tokio::sync::Mutex::new(writer),
        }
    }

    pub(crate) async fn send(&self, frame: &ClientFrame) -> ClientResult<()> {
        let mut writer = self.inner.lock().await;
        write_frame(&mut *writer, frame)
            .await
            .map_err(|e| ClientError::transport(format!("Failed to send frame: {}", e)))
    }

    /// Write several frames without interleaving other writers.
    pub(crate) async fn send_all(&self, frames: &[ClientFrame]) -> ClientResult<()> {
        let mut writer = self.inner.lock().await;
        for frame in frames {
            write_frame(&mut *writer, frame)
                .await
                .map_err(|e| ClientError::transport(format!("Failed to send frame: {}", e)))?;
        }
        Ok(())
    }

    async fn shutdown(&self) {
        let mut writer = self.inner.lock().await;
        if let Err(e) = writer.shutdown().await {
            debug!("Error shutting down connection writer: {}", e);
        }
    }
}

/// State shared by the connection, its reader task and its subscriptions.
pub(crate) struct Shared {
    pub(crate) address: String,
    pub(crate) writer: FrameWriter,
    correlator: Correlator,
    subscriptions: Mutex<HashMap<u64, SubscriptionSlot>>,
}

impl Shared {
    /// Issue a request through the correlator.
    pub(crate) async fn request(
        &self,
        frame: ClientFrame,
        subscription: Option<SubscriptionSlot>,
    ) -> ClientResult<BrokerFrame> {
        if !frame.expects_response() {
            return Err(ClientError::invalid_argument(
                "frame does not expect a response from the broker",
            ));
        }
        self.correlator
            .request(&self.writer, frame, subscription)
            .await
    }

    pub(crate) fn deregister(&self, subscriber_key: u64) {
        lock(&self.subscriptions).remove(&subscriber_key);
    }

    fn register(&self, subscriber_key: u64, slot: SubscriptionSlot) {
        if lock(&self.subscriptions).insert(subscriber_key, slot).is_some() {
            warn!("Subscriber key {} was already registered, replacing it", subscriber_key);
        }
    }

    async fn dispatch(&self, frame: BrokerFrame) {
        match frame {
            BrokerFrame::Task(task) => self.deliver(task).await,
            response => {
                let orphan = self
                    .correlator
                    .complete(response, |key, slot| self.register(key, slot));
                if let Some(subscriber_key) = orphan {
                    self.close_orphan(subscriber_key).await;
                }
            }
        }
    }

    /// Close a subscription the broker opened for a request that stopped waiting.
    async fn close_orphan(&self, subscriber_key: u64) {
        self.deregister(subscriber_key);
        warn!(
            "Closing subscription {} that was confirmed after its request gave up",
            subscriber_key
        );
        if let Err(e) = self
            .writer
            .send(&ClientFrame::close_subscription(subscriber_key))
            .await
        {
            warn!("Failed to close subscription {}: {}", subscriber_key, e);
        }
    }

    async fn deliver(&self, task: SubscribedTask) {
        let subscriber_key = task.subscriber_key;
        let slot = {
            let subscriptions = lock(&self.subscriptions);
            subscriptions
                .get(&subscriber_key)
                .map(|slot| (slot.sender.clone(), slot.credits.clone()))
        };
        let Some((sender, credits)) = slot else {
            warn!(
                "Dropping task {} for unknown subscription {}",
                task.key, subscriber_key
            );
            return;
        };

        if !credits.try_take() {
            warn!(
                "Broker pushed task {} beyond the credit grant of subscription {}, dropping it",
                task.key, subscriber_key
            );
            return;
        }

        let item = match DeliveredItem::from_frame(task) {
            Ok(item) => item,
            Err(e) => {
                warn!("Skipping malformed task on subscription {}: {}", subscriber_key, e);
                credits.restore(1);
                let replenish = ClientFrame::increase_credits(subscriber_key, 1);
                if let Err(e) = self.writer.send(&replenish).await {
                    warn!("Failed to return credit for a malformed task: {}", e);
                }
                return;
            }
        };

        match sender.try_send(item) {
            Ok(()) => {}
            Err(TrySendError::Full(item)) => {
                warn!(
                    "Hand-off for subscription {} is full, dropping task {}",
                    subscriber_key, item.key
                );
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Subscription {} was dropped, deregistering", subscriber_key);
                self.deregister(subscriber_key);
            }
        }
    }

    /// Fail the pending request and end every subscription stream.
    fn shutdown(&self) {
        self.correlator.close();
        let drained: Vec<_> = lock(&self.subscriptions).drain().collect();
        if !drained.is_empty() {
            debug!("Closing {} subscription stream(s)", drained.len());
        }
    }
}

/// Runs connection teardown when the reader task ends, including on abort.
struct ShutdownGuard(Arc<Shared>);

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        self.0.shutdown();
    }
}

async fn read_loop<R>(mut reader: R, shared: Arc<Shared>)
where
    R: AsyncRead + Unpin,
{
    let _guard = ShutdownGuard(shared.clone());
    loop {
        match read_frame::<_, BrokerFrame>(&mut reader).await {
            Ok(Some(frame)) => shared.dispatch(frame).await,
            Ok(None) => {
                info!("Broker at {} closed the connection", shared.address);
                break;
            }
            Err(e) => {
                error!("Connection to {} failed: {}", shared.address, e);
                break;
            }
        }
    }
}

/// One logical session to a broker endpoint.
///
/// Requests are serialised (one outstanding request at a time); subscription
/// pushes are routed concurrently by a background reader task. Dropping the
/// connection ends every subscription opened through it.
pub struct Connection {
    shared: Arc<Shared>,
    envelopes: EnvelopeBuilder,
    reader: JoinHandle<()>,
}

impl Connection {
    /// Connect to the broker named in `config`.
    pub async fn open(config: &ClientConfig) -> ClientResult<Self> {
        let address = config.broker_address();
        let timeout = config.client.request_timeout();
        let stream = tokio::time::timeout(timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| {
                ClientError::transport(format!(
                    "Timed out after {:?} connecting to {}",
                    timeout, address
                ))
            })?
            .map_err(|e| ClientError::transport(format!("Failed to connect to {}: {}", address, e)))?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not disable Nagle on {}: {}", address, e);
        }

        info!("Connected to broker at {}", address);
        Ok(Self::from_stream(stream, address, &config.client))
    }

    /// Run the protocol over an already established byte stream.
    pub fn from_stream<S>(stream: S, address: impl Into<String>, settings: &ClientSettings) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let shared = Arc::new(Shared {
            address: address.into(),
            writer: FrameWriter::new(Box::new(write_half)),
            correlator: Correlator::new(settings.request_timeout()),
            subscriptions: Mutex::new(HashMap::new()),
        });
        let reader = tokio::spawn(read_loop(read_half, shared.clone()));

        Self {
            shared,
            envelopes: EnvelopeBuilder::new(settings.task_topic_policy),
            reader,
        }
    }

    pub fn address(&self) -> &str {
        &self.shared.address
    }

    /// Whether the broker side of the connection is still open.
    pub fn is_open(&self) -> bool {
        !self.reader.is_finished()
    }

    /// Envelope builder configured for this connection.
    pub fn envelopes(&self) -> EnvelopeBuilder {
        self.envelopes
    }

    /// Send one command envelope and wait for its response.
    pub async fn send(&self, envelope: CommandEnvelope) -> ClientResult<Response> {
        debug!(
            "Sending {} command to topic {}",
            envelope.command_kind(),
            envelope.topic_name()
        );
        let frame = self.shared.request(envelope.into_frame(), None).await?;
        Response::from_frame(frame)
    }

    pub async fn create_task(&self, topic: &str, task: &Task) -> ClientResult<Response> {
        let envelope = self.envelopes.task(topic, task)?;
        self.send(envelope).await
    }

    pub async fn create_workflow_instance(
        &self,
        topic: &str,
        instance: &WorkflowInstance,
    ) -> ClientResult<Response> {
        let envelope = self.envelopes.workflow_instance(topic, instance)?;
        self.send(envelope).await
    }

    pub async fn deploy(&self, topic: &str, deployment: Deployment) -> ClientResult<Response> {
        let envelope = self.envelopes.deployment(topic, deployment)?;
        self.send(envelope).await
    }

    /// Open a task subscription that runs until the connection ends.
    pub async fn open_subscription(&self, spec: SubscriptionSpec) -> ClientResult<TaskSubscription> {
        self.open_subscription_with_cancellation(spec, CancellationToken::new())
            .await
    }

    /// Open a task subscription that also ends once `cancel` fires.
    pub async fn open_subscription_with_cancellation(
        &self,
        spec: SubscriptionSpec,
        cancel: CancellationToken,
    ) -> ClientResult<TaskSubscription> {
        TaskSubscription::open(self.shared.clone(), spec, cancel).await
    }

    /// Close the session.
    pub async fn close(self) {
        self.shared.writer.shutdown().await;
        info!("Disconnected from broker at {}", self.shared.address);
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
