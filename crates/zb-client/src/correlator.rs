//! Request/response correlation over a single connection.
//!
//! At most one request is in flight per connection. A request installs a reply
//! slot, writes its frame and waits; the connection's reader completes the slot
//! with the next response-class frame.

use crate::connection::FrameWriter;
use crate::error::{ClientError, ClientResult};
use crate::subscription::SubscriptionSlot;
use serde_json::{Map, Value};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use zb_proto::{BrokerFrame, ClientFrame};

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Error reported by the broker for a command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BrokerError {
    pub code: u32,
    pub message: String,
}

/// Decoded command result.
#[derive(Clone, Debug, PartialEq)]
pub enum ResponsePayload {
    Document(Map<String, Value>),
    Raw(Vec<u8>),
}

impl ResponsePayload {
    fn decode(bytes: Vec<u8>) -> Self {
        match serde_json::from_slice::<Value>(&bytes) {
            Ok(Value::Object(map)) => ResponsePayload::Document(map),
            _ => ResponsePayload::Raw(bytes),
        }
    }
}

/// The broker's answer to one command envelope.
#[derive(Clone, Debug, PartialEq)]
pub struct Response {
    pub partition_id: u32,
    pub position: u64,
    pub key: u64,
    pub topic_name: String,
    pub state: String,
    pub payload: ResponsePayload,
    pub error: Option<BrokerError>,
}

impl Response {
    pub(crate) fn from_frame(frame: BrokerFrame) -> ClientResult<Self> {
        match frame {
            BrokerFrame::CommandResponse(resp) => Ok(Response {
                partition_id: resp.partition_id,
                position: resp.position,
                key: resp.key,
                topic_name: String::from_utf8_lossy(&resp.topic_name).to_string(),
                state: String::from_utf8_lossy(&resp.state).to_string(),
                payload: ResponsePayload::decode(resp.command),
                error: None,
            }),
            BrokerFrame::Error(err) => Ok(Response {
                partition_id: 0,
                position: 0,
                key: 0,
                topic_name: String::new(),
                state: String::new(),
                payload: ResponsePayload::Raw(Vec::new()),
                error: Some(BrokerError {
                    code: err.code,
                    message: String::from_utf8_lossy(&err.message).to_string(),
                }),
            }),
            other => Err(ClientError::transport(format!(
                "Unexpected response to command: {:?}",
                other
            ))),
        }
    }

    /// Look up a field of a document payload.
    pub fn field(&self, name: &str) -> Option<&Value> {
        match &self.payload {
            ResponsePayload::Document(map) => map.get(name),
            ResponsePayload::Raw(_) => None,
        }
    }

    /// Turn a broker-reported error into `ClientError::Broker`.
    pub fn into_result(self) -> ClientResult<Self> {
        match self.error {
            Some(BrokerError { code, message }) => Err(ClientError::Broker { code, message }),
            None => Ok(self),
        }
    }
}

pub(crate) struct PendingRequest {
    reply: oneshot::Sender<BrokerFrame>,
    subscription: Option<SubscriptionSlot>,
}

#[derive(Default)]
struct SlotState {
    pending: Option<PendingRequest>,
    /// Responses still owed for requests that timed out or were abandoned.
    stale: usize,
    closed: bool,
}

/// Clears the pending slot when a request stops waiting.
///
/// A request that was written but never answered leaves one response owed
/// on the wire, which is counted as stale.
struct Waiter<'a> {
    slot: &'a Mutex<SlotState>,
    sent: bool,
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        let mut slot = lock(self.slot);
        if slot.pending.take().is_some() && self.sent {
            slot.stale += 1;
        }
    }
}

pub(crate) struct Correlator {
    in_flight: tokio::sync::Mutex<()>,
    slot: Mutex<SlotState>,
    timeout: Duration,
}

impl Correlator {
    pub(crate) fn new(timeout: Duration) -> Self {
        Self {
            in_flight: tokio::sync::Mutex::new(()),
            slot: Mutex::new(SlotState::default()),
            timeout,
        }
    }

    /// Write `frame` and wait for its response.
    ///
    /// `subscription` is registered by the reader before the reply is handed
    /// back, so no task pushed right after the confirmation can be missed.
    pub(crate) async fn request(
        &self,
        writer: &FrameWriter,
        frame: ClientFrame,
        subscription: Option<SubscriptionSlot>,
    ) -> ClientResult<BrokerFrame> {
        let _in_flight = self.in_flight.lock().await;

        let (reply, response) = oneshot::channel();
        {
            let mut slot = lock(&self.slot);
            if slot.closed {
                return Err(ClientError::transport("Connection is closed"));
            }
            slot.pending = Some(PendingRequest {
                reply,
                subscription,
            });
        }
        // Dropped before `_in_flight`, so the slot is settled before the next request starts.
        let mut waiter = Waiter {
            slot: &self.slot,
            sent: false,
        };

        writer.send(&frame).await?;
        waiter.sent = true;

        match tokio::time::timeout(self.timeout, response).await {
            Ok(Ok(frame)) => Ok(frame),
            Ok(Err(_)) => Err(ClientError::transport(
                "Connection closed before a response arrived",
            )),
            Err(_) => Err(ClientError::Timeout(self.timeout)),
        }
    }

    /// Hand a response-class frame to the waiting request.
    ///
    /// Responses owed to timed-out or abandoned requests are consumed first.
    /// Returns the subscriber key of a subscription the broker opened for a
    /// request nobody waits on anymore; the caller has to close it.
    pub(crate) fn complete(
        &self,
        frame: BrokerFrame,
        register: impl FnOnce(u64, SubscriptionSlot),
    ) -> Option<u64> {
        let opened = match &frame {
            BrokerFrame::SubscriptionOpened(opened) => Some(opened.subscriber_key),
            _ => None,
        };

        let pending = {
            let mut slot = lock(&self.slot);
            if slot.stale > 0 {
                slot.stale -= 1;
                debug!("Discarding late response {:?}", frame);
                return opened;
            }
            match slot.pending.take() {
                Some(pending) => pending,
                None => {
                    warn!("Received a response with no outstanding request: {:?}", frame);
                    return opened;
                }
            }
        };

        let PendingRequest {
            reply,
            subscription,
        } = pending;
        if let (Some(subscriber_key), Some(slot)) = (opened, subscription) {
            register(subscriber_key, slot);
        }

        if reply.send(frame).is_err() {
            debug!("Requester went away before its response arrived");
            return opened;
        }
        None
    }

    /// Fail the outstanding request and refuse new ones.
    pub(crate) fn close(&self) {
        let mut slot = lock(&self.slot);
        slot.closed = true;
        slot.pending = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zb_proto::{CommandResponse, ErrorResponse};

    fn command_response(command: &[u8]) -> BrokerFrame {
        BrokerFrame::CommandResponse(CommandResponse {
            partition_id: 0,
            position: 12,
            key: 4294967400,
            topic_name: b"default-topic".to_vec(),
            state: b"CREATED".to_vec(),
            command: command.to_vec(),
        })
    }

    #[test]
    fn test_document_payload() {
        let response =
            Response::from_frame(command_response(br#"{"state":"CREATED","retries":3}"#)).unwrap();
        assert_eq!(response.field("retries"), Some(&Value::from(3)));
        assert_eq!(response.key, 4294967400);
        assert!(response.error.is_none());
    }

    #[test]
    fn test_non_object_payload_is_raw() {
        let response = Response::from_frame(command_response(b"\x93\x01\x02")).unwrap();
        assert_eq!(response.payload, ResponsePayload::Raw(vec![0x93, 0x01, 0x02]));
        assert_eq!(response.field("state"), None);
    }

    #[test]
    fn test_error_frame_sets_error() {
        let response = Response::from_frame(BrokerFrame::Error(ErrorResponse {
            code: 1,
            message: b"topic not found".to_vec(),
        }))
        .unwrap();
        assert_eq!(
            response.error,
            Some(BrokerError {
                code: 1,
                message: "topic not found".to_string()
            })
        );

        match response.into_result() {
            Err(ClientError::Broker { code, message }) => {
                assert_eq!(code, 1);
                assert_eq!(message, "topic not found");
            }
            other => panic!("Expected broker error, got {:?}", other),
        }
    }

    #[test]
    fn test_subscription_frame_is_not_a_command_response() {
        let err = Response::from_frame(BrokerFrame::subscription_opened(3)).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Transport);
    }

    #[test]
    fn test_unsolicited_response_is_ignored() {
        let correlator = Correlator::new(Duration::from_secs(1));
        let mut registered = false;
        let orphan = correlator.complete(command_response(b"{}"), |_, _| registered = true);
        assert!(!registered);
        assert_eq!(orphan, None);
    }

    #[test]
    fn test_owed_response_is_discarded_before_the_pending_one() {
        let correlator = Correlator::new(Duration::from_secs(1));
        let (reply, mut response) = oneshot::channel();
        {
            let mut slot = lock(&correlator.slot);
            slot.stale = 1;
            slot.pending = Some(PendingRequest {
                reply,
                subscription: None,
            });
        }

        correlator.complete(command_response(br#"{"type":"slow"}"#), |_, _| {});
        assert!(response.try_recv().is_err());

        correlator.complete(command_response(br#"{"type":"fast"}"#), |_, _| {});
        let frame = response.try_recv().unwrap();
        let response = Response::from_frame(frame).unwrap();
        assert_eq!(response.field("type"), Some(&Value::from("fast")));
        assert_eq!(lock(&correlator.slot).stale, 0);
    }

    #[test]
    fn test_late_subscription_confirmation_is_reported() {
        let correlator = Correlator::new(Duration::from_secs(1));
        lock(&correlator.slot).stale = 1;

        let orphan = correlator.complete(BrokerFrame::subscription_opened(7), |_, _| {
            panic!("A late confirmation must not be registered")
        });
        assert_eq!(orphan, Some(7));
    }

    #[test]
    fn test_dropped_waiter_leaves_a_stale_response() {
        let correlator = Correlator::new(Duration::from_secs(1));
        let (reply, _response) = oneshot::channel();
        lock(&correlator.slot).pending = Some(PendingRequest {
            reply,
            subscription: None,
        });

        drop(Waiter {
            slot: &correlator.slot,
            sent: true,
        });
        let slot = lock(&correlator.slot);
        assert!(slot.pending.is_none());
        assert_eq!(slot.stale, 1);
    }

    #[test]
    fn test_unsent_request_owes_no_response() {
        let correlator = Correlator::new(Duration::from_secs(1));
        let (reply, _response) = oneshot::channel();
        lock(&correlator.slot).pending = Some(PendingRequest {
            reply,
            subscription: None,
        });

        drop(Waiter {
            slot: &correlator.slot,
            sent: false,
        });
        let slot = lock(&correlator.slot);
        assert!(slot.pending.is_none());
        assert_eq!(slot.stale, 0);
    }
}
