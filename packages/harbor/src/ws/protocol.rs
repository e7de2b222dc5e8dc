//! WebSocket Protocol Types
//!
//! Wire shapes for the event socket. Every text frame carries exactly one
//! JSON object:
//!
//! - client → server request: `{"id"?: number, "event": string, "args": any}`
//! - server → client ack:     `{"id": number, "data": any}` (once per request with an id)
//! - server → client push:    `{"event": string, "data": any}`

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Reserved event run once per connection before any inbound frame.
pub const CONNECT_EVENT: &str = "connect";

/// Inbound request from a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Present when the client wants an acknowledgement
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub event: String,
    #[serde(default)]
    pub args: Value,
}

impl Request {
    pub fn new(event: impl Into<String>, args: Value) -> Self {
        Self {
            id: None,
            event: event.into(),
            args,
        }
    }

    pub fn with_id(mut self, id: u64) -> Self {
        self.id = Some(id);
        self
    }
}

/// Outbound frame from the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerFrame {
    Ack { id: u64, data: Value },
    Push { event: String, data: Value },
}

impl ServerFrame {
    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

pub fn decode_request(text: &str) -> serde_json::Result<Request> {
    serde_json::from_str(text)
}

pub fn decode_request_bytes(bytes: &[u8]) -> serde_json::Result<Request> {
    serde_json::from_slice(bytes)
}

/// Standard result payload carried in most acks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultPayload {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
    /// `msg` is a translation key rather than display text
    #[serde(rename = "msgI18n", default, skip_serializing_if = "Option::is_none")]
    pub msg_i18n: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl ResultPayload {
    pub fn ok() -> Self {
        Self {
            ok: true,
            ..Default::default()
        }
    }

    pub fn ok_i18n(key: impl Into<String>) -> Self {
        Self {
            ok: true,
            msg: Some(key.into()),
            msg_i18n: Some(true),
            token: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            ok: false,
            msg: Some(msg.into()),
            ..Default::default()
        }
    }

    pub fn error_i18n(key: impl Into<String>) -> Self {
        Self {
            ok: false,
            msg: Some(key.into()),
            msg_i18n: Some(true),
            token: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn into_value(self) -> Value {
        // A struct of strings and bools always serializes
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_without_id_or_args() {
        let req = decode_request(r#"{"event":"subscribeTerminal"}"#).unwrap();
        assert_eq!(req.id, None);
        assert_eq!(req.event, "subscribeTerminal");
        assert_eq!(req.args, Value::Null);
    }

    #[test]
    fn request_with_id_and_args() {
        let req = decode_request(r#"{"id":7,"event":"login","args":["admin","pw"]}"#).unwrap();
        assert_eq!(req.id, Some(7));
        assert_eq!(req.args, json!(["admin", "pw"]));
    }

    #[test]
    fn request_missing_event_is_rejected() {
        assert!(decode_request(r#"{"id":1}"#).is_err());
        assert!(decode_request("not json").is_err());
        assert!(decode_request_bytes(b"[1,2]").is_err());
    }

    #[test]
    fn ack_and_push_encode_to_distinct_shapes() {
        let ack = ServerFrame::Ack {
            id: 1,
            data: json!({"ok": true}),
        };
        assert_eq!(
            serde_json::from_str::<Value>(&ack.encode().unwrap()).unwrap(),
            json!({"id": 1, "data": {"ok": true}})
        );

        let push = ServerFrame::Push {
            event: "terminalOutput".into(),
            data: json!({"terminalName": "build-x", "data": "hi"}),
        };
        assert_eq!(
            serde_json::from_str::<Value>(&push.encode().unwrap()).unwrap(),
            json!({"event": "terminalOutput", "data": {"terminalName": "build-x", "data": "hi"}})
        );
    }

    #[test]
    fn server_frame_decodes_by_shape() {
        let ack: ServerFrame = serde_json::from_str(r#"{"id":3,"data":null}"#).unwrap();
        assert!(matches!(ack, ServerFrame::Ack { id: 3, .. }));

        let push: ServerFrame = serde_json::from_str(r#"{"event":"info","data":{}}"#).unwrap();
        assert!(matches!(push, ServerFrame::Push { ref event, .. } if event == "info"));
    }

    #[test]
    fn result_payload_omits_absent_fields() {
        assert_eq!(ResultPayload::ok().into_value(), json!({"ok": true}));
        assert_eq!(
            ResultPayload::ok().with_token("abc").into_value(),
            json!({"ok": true, "token": "abc"})
        );
        assert_eq!(
            ResultPayload::error("boom").into_value(),
            json!({"ok": false, "msg": "boom"})
        );
    }

    #[test]
    fn result_payload_i18n_uses_camel_case_key() {
        assert_eq!(
            ResultPayload::error_i18n("notLoggedIn").into_value(),
            json!({"ok": false, "msg": "notLoggedIn", "msgI18n": true})
        );
        assert_eq!(
            ResultPayload::ok_i18n("Saved").into_value(),
            json!({"ok": true, "msg": "Saved", "msgI18n": true})
        );
    }
}
