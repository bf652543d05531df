//! RPC wire-format types for the backend's WebSocket protocol.
//!
//! Outbound requests are `{id, method, params}`. Inbound traffic is kept as
//! raw JSON and inspected through [`InboundMessage`], because RPC responses
//! and push notifications share one channel and differ only in shape.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::ids::{CorrelationId, SubscriptionHandle};

/// Outgoing RPC request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    /// Correlation id echoed back by the response.
    pub id: CorrelationId,
    /// Method name (e.g. `signin`).
    pub method: String,
    /// Positional parameters; opaque to the client.
    pub params: Vec<Value>,
}

impl RpcRequest {
    /// Build a request from its parts.
    pub fn new(id: CorrelationId, method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            id,
            method: method.into(),
            params,
        }
    }

    /// `signin` with root-style credentials.
    pub fn signin(id: CorrelationId, user: &str, pass: &str) -> Self {
        Self::new(id, "signin", vec![json!({ "user": user, "pass": pass })])
    }

    /// `use` selecting a namespace and database.
    pub fn use_scope(id: CorrelationId, namespace: &str, database: &str) -> Self {
        Self::new(id, "use", vec![json!(namespace), json!(database)])
    }

    /// `query` carrying an opaque statement.
    pub fn query(id: CorrelationId, text: &str) -> Self {
        Self::new(id, "query", vec![json!(text)])
    }

    /// Serialize to the JSON text frame sent on the wire.
    pub fn to_frame(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// A single inbound frame, parsed but not yet interpreted.
#[derive(Clone, Debug, PartialEq)]
pub struct InboundMessage(Value);

impl InboundMessage {
    /// Wrap an already-parsed value.
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    /// Parse a text frame.
    pub fn parse(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text).map(Self)
    }

    /// The raw JSON value.
    pub fn value(&self) -> &Value {
        &self.0
    }

    /// Top-level `id`, when it is a string.
    pub fn id(&self) -> Option<&str> {
        self.0.get("id").and_then(Value::as_str)
    }

    /// The `result` value, if present (may be `Value::Null`).
    pub fn result(&self) -> Option<&Value> {
        self.0.get("result")
    }

    /// The `error` value, only when present and non-null.
    pub fn error(&self) -> Option<&Value> {
        self.0.get("error").filter(|e| !e.is_null())
    }

    /// Subscription a push notification refers to (`result.id`).
    pub fn notification_target(&self) -> Option<SubscriptionHandle> {
        self.result()?
            .get("id")
            .and_then(Value::as_str)
            .map(SubscriptionHandle::from)
    }

    /// Nested subscription handle from a live-query creation response:
    /// `result[0].result`, when non-null.
    pub fn nested_handle(&self) -> Option<SubscriptionHandle> {
        let nested = self.result()?.as_array()?.first()?.get("result")?;
        match nested {
            Value::String(s) => Some(SubscriptionHandle::from(s.as_str())),
            Value::Null => None,
            other => Some(SubscriptionHandle::from(other.to_string())),
        }
    }
}

impl From<Value> for InboundMessage {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signin_frame_shape() {
        let req = RpcRequest::signin(CorrelationId::from("signin_request_id_r1"), "root", "pw");
        let v: Value = serde_json::from_str(&req.to_frame().unwrap()).unwrap();
        assert_eq!(v["id"], "signin_request_id_r1");
        assert_eq!(v["method"], "signin");
        assert_eq!(v["params"][0]["user"], "root");
        assert_eq!(v["params"][0]["pass"], "pw");
    }

    #[test]
    fn use_scope_params_are_positional() {
        let req = RpcRequest::use_scope(CorrelationId::from("u"), "k6", "bench");
        assert_eq!(req.method, "use");
        assert_eq!(req.params, vec![json!("k6"), json!("bench")]);
    }

    #[test]
    fn query_carries_opaque_text() {
        let req = RpcRequest::query(CorrelationId::from("q"), "LIVE SELECT * FROM t");
        assert_eq!(req.params, vec![json!("LIVE SELECT * FROM t")]);
    }

    #[test]
    fn error_ignores_null() {
        let msg = InboundMessage::new(json!({"id": "a", "error": null, "result": 1}));
        assert!(msg.error().is_none());
        let msg = InboundMessage::new(json!({"id": "a", "error": {"code": -1}}));
        assert!(msg.error().is_some());
    }

    #[test]
    fn null_result_is_present() {
        let msg = InboundMessage::new(json!({"id": "a", "result": null}));
        assert_eq!(msg.result(), Some(&Value::Null));
        let msg = InboundMessage::new(json!({"id": "a"}));
        assert_eq!(msg.result(), None);
    }

    #[test]
    fn nested_handle_extraction() {
        let msg = InboundMessage::new(json!({"id": "x", "result": [{"result": "abc-123"}]}));
        assert_eq!(msg.nested_handle(), Some(SubscriptionHandle::from("abc-123")));

        let msg = InboundMessage::new(json!({"id": "x", "result": [{"result": null}]}));
        assert_eq!(msg.nested_handle(), None);

        let msg = InboundMessage::new(json!({"id": "x", "result": []}));
        assert_eq!(msg.nested_handle(), None);
    }

    #[test]
    fn notification_target_reads_result_id() {
        let msg = InboundMessage::new(json!({"result": {"id": "lq", "action": "CREATE"}}));
        assert_eq!(msg.notification_target(), Some(SubscriptionHandle::from("lq")));
    }

    #[test]
    fn parse_rejects_invalid_json() {
        assert!(InboundMessage::parse("{not json").is_err());
        assert!(InboundMessage::parse(r#"{"id":"a"}"#).is_ok());
    }
}
