//! Command and subscription client for the workflow broker
//!
//! This crate builds command envelopes for tasks, workflow instances and
//! deployments, correlates each with its broker response over a single
//! connection, and consumes credit-limited task subscriptions as a stream.

pub mod config;
pub mod connection;
pub mod correlator;
pub mod documents;
pub mod envelope;
pub mod error;
pub mod subscription;

pub use config::{BrokerContact, ClientConfig, ClientSettings, DEFAULT_CONFIG_PATH};
pub use connection::Connection;
pub use correlator::{BrokerError, Response, ResponsePayload};
pub use documents::{
    load_document, load_resource, parse_document, Deployment, Task, WorkflowInstance,
};
pub use envelope::{CommandEnvelope, EnvelopeBuilder, TaskTopicPolicy, DEFAULT_TOPIC};
pub use error::{ClientError, ClientResult, ErrorKind};
pub use subscription::{DeliveredItem, SubscriptionSpec, SubscriptionState, TaskSubscription};

pub use tokio_util::sync::CancellationToken;
pub use zb_proto::{CommandKind, NULL_KEY};
