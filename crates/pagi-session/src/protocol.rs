//! Wire frames of the gateway protocol.
//!
//! Every message is a JSON object discriminated by `type`: `req`, `res` or `event`. Frames are
//! decoded into closed sum types; unknown frame kinds, chat states and agent streams fail to
//! decode and are dropped by the session.
//!
//! Unknown fields inside a known frame are ignored. Newer gateways add fields within the same
//! protocol version, and only the discriminants above decide how a frame is handled.

use crate::error::{GatewayError, GatewayResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol version negotiated in `connect`.
pub const PROTOCOL_VERSION: u32 = 3;

/// Event carrying the handshake nonce; consumed by the session, never republished.
pub const CHALLENGE_EVENT: &str = "connect.challenge";

/// Error codes the gateway uses for a device that is not approved yet.
pub const PAIRING_ERROR_CODES: &[&str] = &["NOT_PAIRED", "PAIRING_REQUIRED"];

/// One protocol frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Frame {
    Req(RequestFrame),
    Res(ResponseFrame),
    Event(EventFrame),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub id: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorShape>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorShape {
    pub code: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventFrame {
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
}

impl Frame {
    pub fn decode(text: &str) -> GatewayResult<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn encode(&self) -> GatewayResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn request(id: impl Into<String>, method: impl Into<String>, params: Value) -> Self {
        Frame::Req(RequestFrame {
            id: id.into(),
            method: method.into(),
            params,
        })
    }
}

impl ResponseFrame {
    /// Convert into the request outcome: payload on success, classified error otherwise.
    pub fn into_result(self) -> GatewayResult<Value> {
        if self.ok {
            return Ok(self.payload.unwrap_or(Value::Null));
        }
        let error = self.error.unwrap_or(ErrorShape {
            code: "UNKNOWN".to_string(),
            message: "request failed".to_string(),
        });
        if is_pairing_error(&error) {
            return Err(GatewayError::PairingRequired(error.message));
        }
        Err(GatewayError::Protocol {
            code: error.code,
            message: error.message,
        })
    }
}

fn is_pairing_error(error: &ErrorShape) -> bool {
    PAIRING_ERROR_CODES
        .iter()
        .any(|c| error.code.eq_ignore_ascii_case(c))
        || error.message.to_ascii_lowercase().contains("pairing required")
}

/// Payload of `connect.challenge`.
#[derive(Debug, Clone, Deserialize)]
pub struct ChallengePayload {
    pub nonce: String,
    #[serde(default)]
    pub ts: Option<i64>,
}

/// Lifecycle state carried by `chat` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatState {
    Delta,
    Final,
    Aborted,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatEvent {
    pub run_id: String,
    #[serde(default)]
    pub session_key: Option<String>,
    pub state: ChatState,
    #[serde(default)]
    pub message: Option<Value>,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl ChatEvent {
    /// Plain text of the attached message, joining text content parts.
    pub fn message_text(&self) -> Option<String> {
        self.message.as_ref().and_then(message_text)
    }
}

/// Stream kind carried by `agent` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStream {
    Assistant,
    Tool,
    Error,
    Lifecycle,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentEvent {
    pub run_id: String,
    pub stream: AgentStream,
    #[serde(default)]
    pub data: Value,
}

impl AgentEvent {
    /// Incremental text of an assistant chunk, when the gateway sends deltas.
    pub fn delta(&self) -> Option<&str> {
        self.data.get("delta").and_then(Value::as_str)
    }

    /// Full text so far of an assistant stream, when the gateway sends snapshots.
    pub fn text(&self) -> Option<&str> {
        self.data.get("text").and_then(Value::as_str)
    }

    pub fn error_message(&self) -> Option<&str> {
        self.data
            .get("message")
            .or_else(|| self.data.get("error"))
            .and_then(Value::as_str)
    }
}

/// Typed event published on the session's event stream.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEvent {
    Chat(ChatEvent),
    Agent(AgentEvent),
    /// Any other named event, passed through for collaborators that know it.
    Other { event: String, payload: Value },
}

impl GatewayEvent {
    /// Decode an event frame. `chat` and `agent` payloads are strict.
    pub fn from_frame(frame: EventFrame) -> GatewayResult<Self> {
        match frame.event.as_str() {
            "chat" => Ok(GatewayEvent::Chat(serde_json::from_value(frame.payload)?)),
            "agent" => Ok(GatewayEvent::Agent(serde_json::from_value(frame.payload)?)),
            _ => Ok(GatewayEvent::Other {
                event: frame.event,
                payload: frame.payload,
            }),
        }
    }
}

/// Text of a chat message value: either a string `content` or an array of `{type:"text", text}`.
pub fn message_text(message: &Value) -> Option<String> {
    if let Some(s) = message.as_str() {
        return Some(s.to_string());
    }
    match message.get("content")? {
        Value::String(s) => Some(s.clone()),
        Value::Array(parts) => {
            let text = parts
                .iter()
                .filter(|p| p.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("");
            Some(text)
        }
        _ => None,
    }
}

/// Canonical string the device signs during the handshake.
///
/// `v2|<deviceId>|<clientId>|<clientMode>|<role>||<signedAtMs>|<token>|<nonce>`; the empty
/// field is part of the format.
pub fn signing_payload(
    device_id: &str,
    client_id: &str,
    client_mode: &str,
    role: &str,
    signed_at_ms: i64,
    token: Option<&str>,
    nonce: &str,
) -> String {
    format!(
        "v2|{}|{}|{}|{}||{}|{}|{}",
        device_id,
        client_id,
        client_mode,
        role,
        signed_at_ms,
        token.unwrap_or(""),
        nonce
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_all_frame_kinds() {
        let res = Frame::decode(r#"{"type":"res","id":"1","ok":true,"payload":{"runId":"r"}}"#).unwrap();
        assert!(matches!(res, Frame::Res(ResponseFrame { ok: true, .. })));

        let event = Frame::decode(r#"{"type":"event","event":"tick","payload":{},"seq":4}"#).unwrap();
        assert!(matches!(event, Frame::Event(EventFrame { seq: Some(4), .. })));

        let req = Frame::request("7", "chat.send", json!({"message": "hi"}));
        let text = req.encode().unwrap();
        assert!(text.contains(r#""type":"req""#));
        assert_eq!(Frame::decode(&text).unwrap(), req);
    }

    #[test]
    fn unknown_frame_kind_fails_closed() {
        assert!(Frame::decode(r#"{"type":"push","id":"1"}"#).is_err());
        assert!(Frame::decode(r#"{"id":"1","ok":true}"#).is_err());
    }

    #[test]
    fn extra_fields_are_ignored_but_kinds_are_not() {
        let res = Frame::decode(
            r#"{"type":"res","id":"1","ok":true,"payload":{},"stateVersion":7,"ts":1700000000000}"#,
        )
        .unwrap();
        assert!(matches!(res, Frame::Res(ResponseFrame { ok: true, .. })));

        let chat = GatewayEvent::from_frame(EventFrame {
            event: "chat".into(),
            payload: json!({"runId": "r1", "state": "delta", "seq": 3, "usage": {"tokens": 4}}),
            seq: None,
        });
        assert!(matches!(chat, Ok(GatewayEvent::Chat(ChatEvent { state: ChatState::Delta, .. }))));

        assert!(Frame::decode(r#"{"type":"stream","id":"1","ok":true}"#).is_err());
    }

    #[test]
    fn error_response_classification() {
        let pairing = ResponseFrame {
            id: "1".into(),
            ok: false,
            payload: None,
            error: Some(ErrorShape {
                code: "NOT_PAIRED".into(),
                message: "device awaiting approval".into(),
            }),
        };
        assert!(matches!(pairing.into_result(), Err(GatewayError::PairingRequired(_))));

        let other = ResponseFrame {
            id: "2".into(),
            ok: false,
            payload: None,
            error: Some(ErrorShape {
                code: "INVALID_REQUEST".into(),
                message: "bad params".into(),
            }),
        };
        assert_eq!(
            other.into_result(),
            Err(GatewayError::Protocol {
                code: "INVALID_REQUEST".into(),
                message: "bad params".into()
            })
        );
    }

    #[test]
    fn chat_and_agent_events_are_strict() {
        let chat = GatewayEvent::from_frame(EventFrame {
            event: "chat".into(),
            payload: json!({"runId": "r1", "state": "final", "message": {"content": [{"type": "text", "text": "Hi."}]}}),
            seq: None,
        })
        .unwrap();
        match chat {
            GatewayEvent::Chat(c) => {
                assert_eq!(c.state, ChatState::Final);
                assert_eq!(c.message_text().as_deref(), Some("Hi."));
            }
            other => panic!("unexpected {:?}", other),
        }

        let unknown_state = GatewayEvent::from_frame(EventFrame {
            event: "chat".into(),
            payload: json!({"runId": "r1", "state": "paused"}),
            seq: None,
        });
        assert!(unknown_state.is_err());

        let agent = GatewayEvent::from_frame(EventFrame {
            event: "agent".into(),
            payload: json!({"runId": "r1", "stream": "assistant", "data": {"delta": "It's"}}),
            seq: None,
        })
        .unwrap();
        match agent {
            GatewayEvent::Agent(a) => assert_eq!(a.delta(), Some("It's")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn signing_payload_keeps_empty_field() {
        let payload = signing_payload("dev", "cli", "ui", "operator", 42, None, "n0nce");
        assert_eq!(payload, "v2|dev|cli|ui|operator||42||n0nce");
        let with_token = signing_payload("dev", "cli", "ui", "operator", 42, Some("tok"), "n");
        assert_eq!(with_token, "v2|dev|cli|ui|operator||42|tok|n");
    }
}
