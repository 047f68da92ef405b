//! Scripted broker for exercising the client end to end.
//!
//! The broker accepts TCP connections, answers commands by echoing the command
//! document with its created state, and pushes a configurable backlog of tasks
//! to every subscription. Every frame it receives is recorded for assertions.

use anyhow::{anyhow, Result};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_stream::{wrappers::TcpListenerStream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use zb_proto::{
    error_codes, read_frame, write_frame, BrokerFrame, ClientFrame, CommandKind, CommandResponse,
    ExecuteCommandRequest, OpenSubscriptionRequest, SubscribedTask, NULL_KEY,
};

/// Behaviour of the scripted broker.
#[derive(Clone, Debug)]
pub struct MockBrokerConfig {
    /// Topics that exist. Empty accepts every topic.
    pub topics: Vec<String>,
    /// Task payloads pushed to every new subscription.
    pub tasks_on_subscribe: Vec<Vec<u8>>,
    /// Stop pushing when a subscription runs out of credits.
    pub honor_credits: bool,
    /// Drop the connection once a subscription's backlog has been pushed.
    pub close_after_push: bool,
    /// Delay applied to the first `slow_responses` command or subscription responses.
    pub response_delay: Duration,
    pub slow_responses: usize,
}

impl Default for MockBrokerConfig {
    fn default() -> Self {
        Self {
            topics: Vec::new(),
            tasks_on_subscribe: Vec::new(),
            honor_credits: true,
            close_after_push: false,
            response_delay: Duration::ZERO,
            slow_responses: 0,
        }
    }
}

/// JSON payload of a locked task, as pushed to subscribers.
pub fn task_payload(task_type: &str, sequence: usize) -> Vec<u8> {
    json!({
        "state": "LOCKED",
        "type": task_type,
        "retries": 3,
        "payload": { "sequence": sequence },
    })
    .to_string()
    .into_bytes()
}

/// `count` task payloads numbered from zero.
pub fn task_backlog(task_type: &str, count: usize) -> Vec<Vec<u8>> {
    (0..count).map(|n| task_payload(task_type, n)).collect()
}

/// A running scripted broker bound to a local port.
pub struct MockBroker {
    addr: SocketAddr,
    received: Arc<Mutex<Vec<ClientFrame>>>,
    disconnect: CancellationToken,
    accept_loop: JoinHandle<()>,
}

impl MockBroker {
    /// Start on an ephemeral loopback port.
    pub async fn start(config: MockBrokerConfig) -> Result<Self> {
        Self::bind("127.0.0.1:0", config).await
    }

    pub async fn bind(addr: &str, config: MockBrokerConfig) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        info!("Mock broker listening on {}", addr);

        let received = Arc::new(Mutex::new(Vec::new()));
        let disconnect = CancellationToken::new();
        let accept_loop = tokio::spawn(accept_loop(
            listener,
            Arc::new(config),
            received.clone(),
            disconnect.clone(),
        ));

        Ok(Self {
            addr,
            received,
            disconnect,
            accept_loop,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// `host:port` for client configuration.
    pub fn address(&self) -> String {
        self.addr.to_string()
    }

    /// Frames received so far, across all connections.
    pub fn received(&self) -> Vec<ClientFrame> {
        self.received
            .lock()
            .map(|frames| frames.clone())
            .unwrap_or_default()
    }

    /// Poll until a received frame satisfies `predicate` or `timeout` elapses.
    pub async fn wait_for<F>(&self, timeout: Duration, predicate: F) -> bool
    where
        F: Fn(&[ClientFrame]) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if predicate(&self.received()) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Close every open client connection.
    pub fn disconnect_all(&self) {
        self.disconnect.cancel();
    }

    /// Run until the accept loop ends.
    pub async fn serve(&mut self) -> Result<()> {
        (&mut self.accept_loop)
            .await
            .map_err(|e| anyhow!("Accept loop failed: {}", e))
    }
}

impl Drop for MockBroker {
    fn drop(&mut self) {
        self.disconnect.cancel();
        self.accept_loop.abort();
    }
}

async fn accept_loop(
    listener: TcpListener,
    config: Arc<MockBrokerConfig>,
    received: Arc<Mutex<Vec<ClientFrame>>>,
    disconnect: CancellationToken,
) {
    let mut incoming = TcpListenerStream::new(listener);
    while let Some(stream) = incoming.next().await {
        match stream {
            Ok(socket) => {
                let session = Session::new(config.clone(), received.clone());
                let disconnect = disconnect.clone();
                tokio::spawn(async move {
                    if let Err(e) = session.run(socket, disconnect).await {
                        error!("Error handling client: {}", e);
                    }
                });
            }
            Err(e) => {
                warn!("Error accepting connection: {}", e);
            }
        }
    }
}

struct MockSubscription {
    topic_name: Vec<u8>,
    partition_id: u32,
    credits: u32,
    backlog: VecDeque<Vec<u8>>,
}

struct Session {
    config: Arc<MockBrokerConfig>,
    received: Arc<Mutex<Vec<ClientFrame>>>,
    subscriptions: HashMap<u64, MockSubscription>,
    next_key: u64,
    next_position: u64,
    next_subscriber_key: u64,
    responses_sent: usize,
}

impl Session {
    fn new(config: Arc<MockBrokerConfig>, received: Arc<Mutex<Vec<ClientFrame>>>) -> Self {
        Self {
            config,
            received,
            subscriptions: HashMap::new(),
            next_key: 1,
            next_position: 1,
            next_subscriber_key: 1,
            responses_sent: 0,
        }
    }

    async fn run(mut self, socket: TcpStream, disconnect: CancellationToken) -> Result<()> {
        debug!("Handling new client connection");
        let (mut reader, mut writer) = socket.into_split();

        loop {
            let frame = tokio::select! {
                _ = disconnect.cancelled() => {
                    debug!("Disconnecting client");
                    return Ok(());
                }
                frame = read_frame::<_, ClientFrame>(&mut reader) => frame?,
            };
            let Some(frame) = frame else {
                debug!("Client disconnected");
                return Ok(());
            };

            if let Ok(mut frames) = self.received.lock() {
                frames.push(frame.clone());
            }

            match frame {
                ClientFrame::ExecuteCommand(req) => {
                    self.pace_response().await;
                    let response = self.execute(req);
                    write_frame(&mut writer, &response).await?;
                }
                ClientFrame::OpenSubscription(req) => {
                    self.pace_response().await;
                    let Some(subscriber_key) = self.subscribe(&mut writer, req).await? else {
                        continue;
                    };
                    self.pump(&mut writer, subscriber_key).await?;
                    if self.config.close_after_push && self.backlog_empty(subscriber_key) {
                        info!("Backlog pushed, closing connection");
                        return Ok(());
                    }
                }
                ClientFrame::IncreaseCredits(req) => {
                    if let Some(sub) = self.subscriptions.get_mut(&req.subscriber_key) {
                        sub.credits = sub.credits.saturating_add(req.credits);
                        self.pump(&mut writer, req.subscriber_key).await?;
                    }
                }
                ClientFrame::CompleteTask(req) => {
                    debug!("Task {} completed", req.key);
                }
                ClientFrame::CloseSubscription(req) => {
                    self.subscriptions.remove(&req.subscriber_key);
                }
            }
        }
    }

    async fn pace_response(&mut self) {
        if self.responses_sent < self.config.slow_responses {
            tokio::time::sleep(self.config.response_delay).await;
        }
        self.responses_sent += 1;
    }

    fn known_topic(&self, topic: &[u8]) -> bool {
        self.config.topics.is_empty()
            || self
                .config
                .topics
                .iter()
                .any(|t| t.as_bytes() == topic)
    }

    fn take_key(&mut self) -> u64 {
        let key = self.next_key;
        self.next_key += 1;
        key
    }

    fn take_position(&mut self) -> u64 {
        let position = self.next_position;
        self.next_position += 1;
        position
    }

    fn execute(&mut self, req: ExecuteCommandRequest) -> BrokerFrame {
        if !self.known_topic(&req.topic_name) {
            return BrokerFrame::error(
                error_codes::TOPIC_NOT_FOUND,
                format!("topic '{}' not found", String::from_utf8_lossy(&req.topic_name)),
            );
        }

        let Some(kind) = CommandKind::from_u8(req.kind) else {
            return BrokerFrame::error(
                error_codes::INVALID_COMMAND,
                format!("unknown command kind {}", req.kind),
            );
        };

        let created = match String::from_utf8_lossy(&req.state).as_ref() {
            "CREATE" => "CREATED",
            "CREATE_WORKFLOW_INSTANCE" => "WORKFLOW_INSTANCE_CREATED",
            "CREATE_DEPLOYMENT" => "DEPLOYMENT_CREATED",
            other => {
                return BrokerFrame::error(
                    error_codes::INVALID_COMMAND,
                    format!("unsupported state '{}'", other),
                )
            }
        };

        let key = if req.key == NULL_KEY || req.key == 0 {
            self.take_key()
        } else {
            req.key
        };

        let document = match kind {
            CommandKind::Deployment => json!({
                "state": created,
                "resourceSize": req.command.len(),
            }),
            CommandKind::Task | CommandKind::WorkflowInstance => {
                match serde_json::from_slice::<Value>(&req.command) {
                    Ok(Value::Object(mut map)) => {
                        map.insert("state".to_string(), Value::from(created));
                        if kind == CommandKind::WorkflowInstance {
                            map.insert("workflowInstanceKey".to_string(), Value::from(key));
                        }
                        Value::Object(map)
                    }
                    _ => {
                        return BrokerFrame::error(
                            error_codes::INVALID_COMMAND,
                            "command document is not a JSON object".to_string(),
                        )
                    }
                }
            }
        };

        BrokerFrame::CommandResponse(CommandResponse {
            partition_id: req.partition_id,
            position: self.take_position(),
            key,
            topic_name: req.topic_name,
            state: created.as_bytes().to_vec(),
            command: document.to_string().into_bytes(),
        })
    }

    async fn subscribe(
        &mut self,
        writer: &mut OwnedWriteHalf,
        req: OpenSubscriptionRequest,
    ) -> Result<Option<u64>> {
        if !self.known_topic(&req.topic_name) {
            let error = BrokerFrame::error(
                error_codes::TOPIC_NOT_FOUND,
                format!("topic '{}' not found", String::from_utf8_lossy(&req.topic_name)),
            );
            write_frame(writer, &error).await?;
            return Ok(None);
        }

        let subscriber_key = self.next_subscriber_key;
        self.next_subscriber_key += 1;
        self.subscriptions.insert(
            subscriber_key,
            MockSubscription {
                topic_name: req.topic_name,
                partition_id: req.partition_id,
                credits: req.credits,
                backlog: self.config.tasks_on_subscribe.iter().cloned().collect(),
            },
        );

        write_frame(writer, &BrokerFrame::subscription_opened(subscriber_key)).await?;
        Ok(Some(subscriber_key))
    }

    /// Push backlog tasks while credits allow.
    async fn pump(&mut self, writer: &mut OwnedWriteHalf, subscriber_key: u64) -> Result<()> {
        loop {
            let honor_credits = self.config.honor_credits;
            let Some(sub) = self.subscriptions.get_mut(&subscriber_key) else {
                return Ok(());
            };
            if honor_credits && sub.credits == 0 {
                return Ok(());
            }
            let Some(payload) = sub.backlog.pop_front() else {
                return Ok(());
            };
            sub.credits = sub.credits.saturating_sub(1);
            let topic_name = sub.topic_name.clone();
            let partition_id = sub.partition_id;

            let task = BrokerFrame::Task(SubscribedTask {
                subscriber_key,
                key: self.take_key(),
                position: self.take_position(),
                partition_id,
                topic_name,
                payload,
            });
            write_frame(writer, &task).await?;
        }
    }

    fn backlog_empty(&self, subscriber_key: u64) -> bool {
        self.subscriptions
            .get(&subscriber_key)
            .map(|sub| sub.backlog.is_empty())
            .unwrap_or(true)
    }
}
