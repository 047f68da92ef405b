//! Credit-based task subscriptions.
//!
//! A subscription grants the broker an initial number of credits; every pushed
//! task consumes one. Credits come back only when a task is acknowledged (or
//! skipped as malformed), so the number of delivered-but-unhandled tasks never
//! exceeds the grant.

use crate::connection::Shared;
use crate::documents::Task;
use crate::envelope::DEFAULT_TOPIC;
use crate::error::{ClientError, ClientResult};
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::{debug, info};
use zb_proto::{BrokerFrame, ClientFrame, SubscribedTask};

pub const DEFAULT_CREDITS: u32 = 32;
pub const DEFAULT_LOCK_DURATION_MS: u64 = 300_000;
pub const DEFAULT_LOCK_OWNER: &str = "zbc";
pub const DEFAULT_TASK_TYPE: &str = "foo";

/// Parameters of a task subscription.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SubscriptionSpec {
    #[serde(rename = "topic")]
    pub topic_name: String,
    pub partition_id: i32,
    pub credits: u32,
    pub lock_duration_ms: u64,
    pub lock_owner: String,
    pub subscriber_key: u64,
    pub task_type: String,
}

impl Default for SubscriptionSpec {
    fn default() -> Self {
        Self {
            topic_name: DEFAULT_TOPIC.to_string(),
            partition_id: 0,
            credits: DEFAULT_CREDITS,
            lock_duration_ms: DEFAULT_LOCK_DURATION_MS,
            lock_owner: DEFAULT_LOCK_OWNER.to_string(),
            subscriber_key: 0,
            task_type: DEFAULT_TASK_TYPE.to_string(),
        }
    }
}

impl SubscriptionSpec {
    pub fn validate(&self) -> ClientResult<()> {
        if self.topic_name.trim().is_empty() {
            return Err(ClientError::invalid_argument("subscription requires a topic name"));
        }
        if self.partition_id < 0 {
            return Err(ClientError::invalid_argument(format!(
                "partition id must not be negative, got {}",
                self.partition_id
            )));
        }
        if self.credits == 0 {
            return Err(ClientError::invalid_argument("credits must be greater than zero"));
        }
        if self.lock_duration_ms == 0 {
            return Err(ClientError::invalid_argument(
                "lock duration must be greater than zero",
            ));
        }
        if self.lock_owner.trim().is_empty() {
            return Err(ClientError::invalid_argument("subscription requires a lock owner"));
        }
        if self.task_type.trim().is_empty() {
            return Err(ClientError::invalid_argument("subscription requires a task type"));
        }
        Ok(())
    }

    fn to_frame(&self) -> ClientFrame {
        ClientFrame::open_subscription(
            self.topic_name.clone(),
            self.partition_id as u32,
            self.credits,
            self.lock_duration_ms,
            self.lock_owner.clone(),
            self.subscriber_key,
            self.task_type.clone(),
        )
    }
}

/// Lifecycle of a subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscriptionState {
    Unopened,
    Opening,
    Active,
    Closed,
}

/// A task delivered under a subscription. The subscription that produced it
/// holds the task's lock until it is acknowledged or the lock expires.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveredItem {
    pub subscriber_key: u64,
    /// Lock key, used to acknowledge the task.
    pub key: u64,
    pub position: u64,
    pub partition_id: u32,
    pub topic_name: String,
    /// The task document exactly as the broker pushed it.
    pub task: Map<String, Value>,
}

impl DeliveredItem {
    /// Only payloads that are not a JSON object are rejected; fields are not checked.
    pub(crate) fn from_frame(frame: SubscribedTask) -> ClientResult<Self> {
        let task: Map<String, Value> = serde_json::from_slice(&frame.payload).map_err(|e| {
            ClientError::InvalidFormat(format!("task {} payload: {}", frame.key, e))
        })?;
        Ok(Self {
            subscriber_key: frame.subscriber_key,
            key: frame.key,
            position: frame.position,
            partition_id: frame.partition_id,
            topic_name: String::from_utf8_lossy(&frame.topic_name).to_string(),
            task,
        })
    }

    /// Typed view of the task document, `None` if it does not fit [`Task`].
    pub fn as_task(&self) -> Option<Task> {
        serde_json::from_value(Value::Object(self.task.clone())).ok()
    }
}

/// Credits the broker may still spend on a subscription.
#[derive(Debug)]
pub(crate) struct CreditCounter(AtomicU32);

impl CreditCounter {
    fn new(credits: u32) -> Self {
        Self(AtomicU32::new(credits))
    }

    /// Consume one credit; false when none are left.
    pub(crate) fn try_take(&self) -> bool {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(1))
            .is_ok()
    }

    pub(crate) fn restore(&self, credits: u32) {
        let _ = self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| {
                Some(c.saturating_add(credits))
            });
    }

    fn remaining(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }
}

/// Routing entry the connection reader uses for pushed tasks.
pub(crate) struct SubscriptionSlot {
    pub(crate) sender: mpsc::Sender<DeliveredItem>,
    pub(crate) credits: Arc<CreditCounter>,
}

/// An open task subscription: an unbounded, non-restartable stream of
/// delivered tasks.
///
/// The stream ends when the connection is lost or the cancellation token
/// fires.
pub struct TaskSubscription {
    shared: Arc<Shared>,
    spec: SubscriptionSpec,
    subscriber_key: u64,
    receiver: mpsc::Receiver<DeliveredItem>,
    credits: Arc<CreditCounter>,
    cancel: CancellationToken,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
    state: SubscriptionState,
}

impl TaskSubscription {
    pub(crate) async fn open(
        shared: Arc<Shared>,
        spec: SubscriptionSpec,
        cancel: CancellationToken,
    ) -> ClientResult<Self> {
        spec.validate()?;

        let mut state = SubscriptionState::Unopened;
        debug!(?state, topic = %spec.topic_name, "Preparing subscription");

        let (sender, receiver) = mpsc::channel(spec.credits as usize);
        let credits = Arc::new(CreditCounter::new(spec.credits));
        let slot = SubscriptionSlot {
            sender,
            credits: credits.clone(),
        };

        state = SubscriptionState::Opening;
        debug!(?state, topic = %spec.topic_name, "Sending subscription request");

        let subscriber_key = match shared.request(spec.to_frame(), Some(slot)).await? {
            BrokerFrame::SubscriptionOpened(opened) => opened.subscriber_key,
            BrokerFrame::Error(err) => {
                return Err(ClientError::Broker {
                    code: err.code,
                    message: String::from_utf8_lossy(&err.message).to_string(),
                })
            }
            other => {
                return Err(ClientError::transport(format!(
                    "Unexpected response to subscription request: {:?}",
                    other
                )))
            }
        };

        state = SubscriptionState::Active;
        info!(
            "Opened subscription {} on {} partition {} for task type '{}' ({} credits, lock {} ms)",
            subscriber_key,
            spec.topic_name,
            spec.partition_id,
            spec.task_type,
            spec.credits,
            spec.lock_duration_ms
        );

        let cancel = cancel.child_token();
        let cancelled = Box::pin(cancel.clone().cancelled_owned());
        Ok(Self {
            shared,
            spec,
            subscriber_key,
            receiver,
            credits,
            cancel,
            cancelled,
            state,
        })
    }

    pub fn subscriber_key(&self) -> u64 {
        self.subscriber_key
    }

    pub fn spec(&self) -> &SubscriptionSpec {
        &self.spec
    }

    pub fn state(&self) -> SubscriptionState {
        self.state
    }

    /// Credits the broker may still spend before it must wait for a replenish.
    pub fn remaining_credits(&self) -> u32 {
        self.credits.remaining()
    }

    /// Token that ends this stream when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Complete `item`, releasing its lock and granting the broker one more credit.
    pub async fn acknowledge(&self, item: &DeliveredItem, payload: Option<&Value>) -> ClientResult<()> {
        if item.subscriber_key != self.subscriber_key {
            return Err(ClientError::invalid_argument(format!(
                "task {} belongs to subscription {}, not {}",
                item.key, item.subscriber_key, self.subscriber_key
            )));
        }

        let payload = match payload {
            Some(value) => serde_json::to_vec(value)
                .map_err(|e| ClientError::InvalidFormat(format!("completion payload: {}", e)))?,
            None => Vec::new(),
        };

        // Restore locally first so a push following the replenish is not refused.
        self.credits.restore(1);
        self.shared
            .writer
            .send_all(&[
                ClientFrame::complete_task(self.subscriber_key, item.key, payload),
                ClientFrame::increase_credits(self.subscriber_key, 1),
            ])
            .await?;

        debug!("Acknowledged task {} on subscription {}", item.key, self.subscriber_key);
        Ok(())
    }

    /// End the stream and tell the broker to stop pushing.
    pub async fn close(mut self) -> ClientResult<()> {
        self.state = SubscriptionState::Closed;
        self.cancel.cancel();
        self.shared.deregister(self.subscriber_key);
        self.shared
            .writer
            .send(&ClientFrame::close_subscription(self.subscriber_key))
            .await?;
        info!("Closed subscription {}", self.subscriber_key);
        Ok(())
    }
}

impl Stream for TaskSubscription {
    type Item = DeliveredItem;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        if this.state == SubscriptionState::Closed {
            return Poll::Ready(None);
        }

        if this.cancelled.as_mut().poll(cx).is_ready() {
            debug!("Subscription {} cancelled", this.subscriber_key);
            this.state = SubscriptionState::Closed;
            return Poll::Ready(None);
        }

        match this.receiver.poll_recv(cx) {
            Poll::Ready(None) => {
                debug!("Subscription {} ended with its connection", this.subscriber_key);
                this.state = SubscriptionState::Closed;
                Poll::Ready(None)
            }
            other => other,
        }
    }
}

impl Drop for TaskSubscription {
    fn drop(&mut self) {
        self.shared.deregister(self.subscriber_key);
    }
}
