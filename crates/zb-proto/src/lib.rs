//! Workflow broker wire protocol
//!
//! This crate defines the SSZ frames exchanged with the broker and the
//! length-prefixed codec used to move them over a byte stream. It is shared by
//! the client, the CLI and the scripted test broker.

pub mod codec;
pub mod messages;

// Re-export key types
pub use codec::{decode_frame, encode_frame, read_frame, write_frame, CodecError, MAX_FRAME_LEN};
pub use messages::{
    error_codes, BrokerFrame, ClientFrame, CloseSubscriptionRequest, CommandKind,
    CommandResponse, CompleteTaskRequest, ErrorResponse, ExecuteCommandRequest,
    IncreaseCreditsRequest, OpenSubscriptionRequest, SubscribedTask, SubscriptionOpened,
    NULL_KEY,
};
