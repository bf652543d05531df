//! Classification of inbound frames on the shared channel.
//!
//! A frame is a push notification when its `result` is an object carrying
//! an `action` key. It is an RPC response when it is not a notification,
//! has a string `id`, and either reports a non-null `error` or carries a
//! `result` that nests another `result` (the outer RPC envelope). The two
//! predicates are exclusive by construction; frames matching neither are
//! malformed.

use serde::Serialize;
use serde_json::Value;

use crate::wire::InboundMessage;

/// Kind of an inbound frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Unsolicited live-subscription notification.
    Notification,
    /// Response to an outbound request.
    Response,
    /// Neither shape; a protocol violation wherever it is classified.
    Malformed,
}

/// Whether the frame is a push notification.
pub fn is_notification(msg: &InboundMessage) -> bool {
    msg.result()
        .and_then(Value::as_object)
        .is_some_and(|r| r.contains_key("action"))
}

/// Whether the frame is an RPC response.
pub fn is_response(msg: &InboundMessage) -> bool {
    if is_notification(msg) || msg.id().is_none() {
        return false;
    }
    msg.error().is_some() || msg.result().is_some_and(nests_result)
}

/// Classify a frame.
pub fn classify(msg: &InboundMessage) -> MessageKind {
    if is_notification(msg) {
        MessageKind::Notification
    } else if is_response(msg) {
        MessageKind::Response
    } else {
        MessageKind::Malformed
    }
}

fn nests_result(result: &Value) -> bool {
    match result {
        Value::Object(map) => map.contains_key("result"),
        Value::Array(items) => items
            .first()
            .and_then(Value::as_object)
            .is_some_and(|first| first.contains_key("result")),
        _ => false,
    }
}
