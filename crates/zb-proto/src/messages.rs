//! Frame types exchanged between the client and the broker.
//!
//! Strings travel as raw UTF-8 byte vectors so every frame maps directly onto
//! SSZ variable-length lists.

use ssz_derive::{Decode, Encode};

/// Key value meaning "the broker assigns the key".
pub const NULL_KEY: u64 = u64::MAX;

/// Command kinds understood by the broker's command endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Task,
    WorkflowInstance,
    Deployment,
}

impl CommandKind {
    pub fn as_u8(self) -> u8 {
        match self {
            CommandKind::Task => 0,
            CommandKind::WorkflowInstance => 1,
            CommandKind::Deployment => 2,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(CommandKind::Task),
            1 => Some(CommandKind::WorkflowInstance),
            2 => Some(CommandKind::Deployment),
            _ => None,
        }
    }
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CommandKind::Task => "task",
            CommandKind::WorkflowInstance => "workflow-instance",
            CommandKind::Deployment => "deployment",
        };
        f.write_str(name)
    }
}

/// Execute a single command against a topic partition.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct ExecuteCommandRequest {
    pub partition_id: u32,
    pub position: u64,
    pub key: u64,
    pub topic_name: Vec<u8>,
    pub kind: u8,
    pub state: Vec<u8>,
    pub command: Vec<u8>,
}

/// Open a task subscription with an initial credit grant.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct OpenSubscriptionRequest {
    pub topic_name: Vec<u8>,
    pub partition_id: u32,
    pub credits: u32,
    pub lock_duration_ms: u64,
    pub lock_owner: Vec<u8>,
    pub subscriber_key: u64,
    pub task_type: Vec<u8>,
}

/// Grant the broker additional credits for a subscription.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct IncreaseCreditsRequest {
    pub subscriber_key: u64,
    pub credits: u32,
}

/// Complete a locked task, releasing its lock.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct CompleteTaskRequest {
    pub subscriber_key: u64,
    pub key: u64,
    pub payload: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct CloseSubscriptionRequest {
    pub subscriber_key: u64,
}

/// Frames sent by the client.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
#[ssz(enum_behaviour = "union")]
pub enum ClientFrame {
    ExecuteCommand(ExecuteCommandRequest),
    OpenSubscription(OpenSubscriptionRequest),
    IncreaseCredits(IncreaseCreditsRequest),
    CompleteTask(CompleteTaskRequest),
    CloseSubscription(CloseSubscriptionRequest),
}

impl ClientFrame {
    pub fn execute_command(
        partition_id: u32,
        position: u64,
        key: u64,
        topic_name: String,
        kind: CommandKind,
        state: String,
        command: Vec<u8>,
    ) -> Self {
        ClientFrame::ExecuteCommand(ExecuteCommandRequest {
            partition_id,
            position,
            key,
            topic_name: topic_name.into_bytes(),
            kind: kind.as_u8(),
            state: state.into_bytes(),
            command,
        })
    }

    pub fn open_subscription(
        topic_name: String,
        partition_id: u32,
        credits: u32,
        lock_duration_ms: u64,
        lock_owner: String,
        subscriber_key: u64,
        task_type: String,
    ) -> Self {
        ClientFrame::OpenSubscription(OpenSubscriptionRequest {
            topic_name: topic_name.into_bytes(),
            partition_id,
            credits,
            lock_duration_ms,
            lock_owner: lock_owner.into_bytes(),
            subscriber_key,
            task_type: task_type.into_bytes(),
        })
    }

    pub fn increase_credits(subscriber_key: u64, credits: u32) -> Self {
        ClientFrame::IncreaseCredits(IncreaseCreditsRequest {
            subscriber_key,
            credits,
        })
    }

    pub fn complete_task(subscriber_key: u64, key: u64, payload: Vec<u8>) -> Self {
        ClientFrame::CompleteTask(CompleteTaskRequest {
            subscriber_key,
            key,
            payload,
        })
    }

    pub fn close_subscription(subscriber_key: u64) -> Self {
        ClientFrame::CloseSubscription(CloseSubscriptionRequest { subscriber_key })
    }

    /// Whether the broker answers this frame with a response-class frame.
    pub fn expects_response(&self) -> bool {
        matches!(
            self,
            ClientFrame::ExecuteCommand(_) | ClientFrame::OpenSubscription(_)
        )
    }
}

/// Result of an executed command.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct CommandResponse {
    pub partition_id: u32,
    pub position: u64,
    pub key: u64,
    pub topic_name: Vec<u8>,
    pub state: Vec<u8>,
    pub command: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct ErrorResponse {
    pub code: u32,
    pub message: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct SubscriptionOpened {
    pub subscriber_key: u64,
}

/// A task pushed under a subscription. `key` is the lock key.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct SubscribedTask {
    pub subscriber_key: u64,
    pub key: u64,
    pub position: u64,
    pub partition_id: u32,
    pub topic_name: Vec<u8>,
    pub payload: Vec<u8>,
}

/// Frames sent by the broker.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
#[ssz(enum_behaviour = "union")]
pub enum BrokerFrame {
    CommandResponse(CommandResponse),
    Error(ErrorResponse),
    SubscriptionOpened(SubscriptionOpened),
    Task(SubscribedTask),
}

impl BrokerFrame {
    pub fn error(code: u32, message: String) -> Self {
        BrokerFrame::Error(ErrorResponse {
            code,
            message: message.into_bytes(),
        })
    }

    pub fn subscription_opened(subscriber_key: u64) -> Self {
        BrokerFrame::SubscriptionOpened(SubscriptionOpened { subscriber_key })
    }

    /// Response-class frames complete the outstanding request; the rest are pushes.
    pub fn is_response(&self) -> bool {
        !matches!(self, BrokerFrame::Task(_))
    }
}

/// Well-known broker error codes.
pub mod error_codes {
    pub const TOPIC_NOT_FOUND: u32 = 1;
    pub const INVALID_COMMAND: u32 = 2;
}

#[cfg(test)]
mod tests {
    use super::*;
    use ssz::{Decode, Encode};

    #[test]
    fn test_command_kind_codes() {
        for kind in [
            CommandKind::Task,
            CommandKind::WorkflowInstance,
            CommandKind::Deployment,
        ] {
            assert_eq!(CommandKind::from_u8(kind.as_u8()), Some(kind));
        }
        assert_eq!(CommandKind::from_u8(7), None);
    }

    #[test]
    fn test_union_selector_distinguishes_frames() {
        let credits = ClientFrame::increase_credits(5, 1).as_ssz_bytes();
        let close = ClientFrame::close_subscription(5).as_ssz_bytes();
        assert_ne!(credits[0], close[0]);

        let decoded = ClientFrame::from_ssz_bytes(&close).unwrap();
        assert_eq!(decoded, ClientFrame::close_subscription(5));
    }

    #[test]
    fn test_task_frame_is_push() {
        let task = BrokerFrame::Task(SubscribedTask {
            subscriber_key: 1,
            key: 2,
            position: 3,
            partition_id: 0,
            topic_name: b"default-topic".to_vec(),
            payload: vec![],
        });
        assert!(!task.is_response());
        assert!(BrokerFrame::subscription_opened(1).is_response());
        assert!(BrokerFrame::error(1, "nope".to_string()).is_response());
    }

    #[test]
    fn test_expects_response() {
        assert!(ClientFrame::open_subscription(
            "t".into(),
            0,
            32,
            300_000,
            "zbc".into(),
            0,
            "foo".into()
        )
        .expects_response());
        assert!(!ClientFrame::increase_credits(0, 1).expects_response());
        assert!(!ClientFrame::complete_task(0, 1, vec![]).expects_response());
    }
}
