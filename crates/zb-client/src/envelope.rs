//! Command envelope construction.

use crate::documents::{Deployment, Task, WorkflowInstance};
use crate::error::{ClientError, ClientResult};
use serde::Deserialize;
use zb_proto::{ClientFrame, CommandKind, NULL_KEY};

/// Topic that task commands are pinned to.
pub const DEFAULT_TOPIC: &str = "default-topic";

/// How the topic of a task envelope is chosen.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskTopicPolicy {
    /// Always `default-topic`, whatever the caller asked for.
    #[default]
    Pinned,
    /// The caller-supplied topic.
    Caller,
}

/// Routing metadata plus an opaque command payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandEnvelope {
    partition_id: u32,
    position: u64,
    key: u64,
    topic_name: String,
    command_kind: CommandKind,
    state: String,
    payload: Vec<u8>,
}

impl CommandEnvelope {
    pub fn partition_id(&self) -> u32 {
        self.partition_id
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn key(&self) -> u64 {
        self.key
    }

    /// Whether the broker is expected to assign the key.
    pub fn has_null_key(&self) -> bool {
        self.key == NULL_KEY
    }

    pub fn topic_name(&self) -> &str {
        &self.topic_name
    }

    pub fn command_kind(&self) -> CommandKind {
        self.command_kind
    }

    pub fn state(&self) -> &str {
        &self.state
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Consume the envelope into its wire frame.
    pub fn into_frame(self) -> ClientFrame {
        ClientFrame::execute_command(
            self.partition_id,
            self.position,
            self.key,
            self.topic_name,
            self.command_kind,
            self.state,
            self.payload,
        )
    }
}

/// Builds envelopes for the three command kinds.
#[derive(Clone, Copy, Debug, Default)]
pub struct EnvelopeBuilder {
    task_topic_policy: TaskTopicPolicy,
}

impl EnvelopeBuilder {
    pub fn new(task_topic_policy: TaskTopicPolicy) -> Self {
        Self { task_topic_policy }
    }

    /// Task commands use partition 0, position 0 and key 0.
    pub fn task(&self, topic: &str, task: &Task) -> ClientResult<CommandEnvelope> {
        let topic_name = match self.task_topic_policy {
            TaskTopicPolicy::Pinned => DEFAULT_TOPIC,
            TaskTopicPolicy::Caller => topic,
        };
        let payload = serde_json::to_vec(task)
            .map_err(|e| ClientError::InvalidFormat(format!("task document: {}", e)))?;
        build(topic_name, CommandKind::Task, 0, task.state.clone(), payload)
    }

    /// Workflow instance commands leave the key to the broker.
    pub fn workflow_instance(
        &self,
        topic: &str,
        instance: &WorkflowInstance,
    ) -> ClientResult<CommandEnvelope> {
        let payload = serde_json::to_vec(instance).map_err(|e| {
            ClientError::InvalidFormat(format!("workflow instance document: {}", e))
        })?;
        build(
            topic,
            CommandKind::WorkflowInstance,
            NULL_KEY,
            instance.state.clone(),
            payload,
        )
    }

    /// Deployment commands carry the resource bytes unchanged.
    pub fn deployment(&self, topic: &str, deployment: Deployment) -> ClientResult<CommandEnvelope> {
        build(
            topic,
            CommandKind::Deployment,
            0,
            deployment.state.to_string(),
            deployment.resource,
        )
    }
}

fn build(
    topic_name: &str,
    command_kind: CommandKind,
    key: u64,
    state: String,
    payload: Vec<u8>,
) -> ClientResult<CommandEnvelope> {
    if topic_name.trim().is_empty() {
        return Err(ClientError::invalid_argument(format!(
            "{} command requires a topic name",
            command_kind
        )));
    }

    Ok(CommandEnvelope {
        partition_id: 0,
        position: 0,
        key,
        topic_name: topic_name.to_string(),
        command_kind,
        state,
        payload,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::documents::{parse_document, DEPLOYMENT_CREATE_STATE};
    use crate::error::ErrorKind;

    #[test]
    fn test_task_routing_is_fixed() {
        let builder = EnvelopeBuilder::default();
        for topic in ["default-topic", "other", "orders-eu"] {
            let envelope = builder.task(topic, &Task::new("foo")).unwrap();
            assert_eq!(envelope.partition_id(), 0);
            assert_eq!(envelope.position(), 0);
            assert_eq!(envelope.key(), 0);
            assert_eq!(envelope.command_kind(), CommandKind::Task);
        }
    }

    #[test]
    fn test_task_topic_pinned_over_document_topic() {
        let task: Task = parse_document(b"type: foo\ntopic: other\n").unwrap();
        let envelope = EnvelopeBuilder::default().task("default-topic", &task).unwrap();
        assert_eq!(envelope.topic_name(), "default-topic");

        let envelope = EnvelopeBuilder::default().task("other", &task).unwrap();
        assert_eq!(envelope.topic_name(), DEFAULT_TOPIC);
    }

    #[test]
    fn test_task_topic_from_caller() {
        let builder = EnvelopeBuilder::new(TaskTopicPolicy::Caller);
        let envelope = builder.task("orders", &Task::new("foo")).unwrap();
        assert_eq!(envelope.topic_name(), "orders");

        let err = builder.task("", &Task::new("foo")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_task_payload_is_json_document() {
        let envelope = EnvelopeBuilder::default()
            .task("default-topic", &Task::new("foo"))
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(envelope.payload()).unwrap();
        assert_eq!(json["type"], "foo");
        assert_eq!(envelope.state(), "CREATE");
    }

    #[test]
    fn test_workflow_instance_uses_null_key() {
        let envelope = EnvelopeBuilder::default()
            .workflow_instance("orders", &WorkflowInstance::new("order-process"))
            .unwrap();
        assert_eq!(envelope.key(), u64::MAX);
        assert_ne!(envelope.key(), 0);
        assert!(envelope.has_null_key());
        assert_eq!(envelope.topic_name(), "orders");
    }

    #[test]
    fn test_workflow_instance_requires_topic() {
        let err = EnvelopeBuilder::default()
            .workflow_instance("  ", &WorkflowInstance::new("order-process"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_deployment_payload_identity() {
        let raw = b"<definitions id=\"order\"/>\n".to_vec();
        let envelope = EnvelopeBuilder::default()
            .deployment("orders", Deployment::new(raw.clone()))
            .unwrap();
        assert_eq!(envelope.payload(), raw.as_slice());
        assert_eq!(envelope.key(), 0);
        assert_eq!(envelope.state(), DEPLOYMENT_CREATE_STATE);
    }

    #[test]
    fn test_into_frame() {
        let envelope = EnvelopeBuilder::default()
            .deployment("orders", Deployment::new(vec![1, 2, 3]))
            .unwrap();
        match envelope.into_frame() {
            ClientFrame::ExecuteCommand(req) => {
                assert_eq!(req.topic_name, b"orders".to_vec());
                assert_eq!(req.kind, CommandKind::Deployment.as_u8());
                assert_eq!(req.command, vec![1, 2, 3]);
            }
            other => panic!("Expected ExecuteCommand, got {:?}", other),
        }
    }
}
