use crate::core::errors::ExchangeError;
use crate::core::kernel::codec::WsCodec;
use crate::exchanges::okx::types::{
    ControlResponse, DataEvent, EventKind, Operation, Subscription,
};
use serde_json::Value;
use tokio_tungstenite::tungstenite::Message;

/// OKX WebSocket message types
#[derive(Debug, Clone, PartialEq)]
pub enum OkxMessage {
    /// Subscribe/unsubscribe acknowledgement or error
    Control(ControlResponse),
    /// Market data update
    Data(DataEvent),
}

/// Build `{"op": .., "args": [..]}`
pub fn encode_subscribe_request(op: Operation, subscriptions: &[Subscription]) -> Value {
    serde_json::json!({
        "op": op,
        "args": subscriptions,
    })
}

/// Control messages carry an `event` field, data messages do not
pub fn is_control_message(value: &Value) -> bool {
    value.get("event").is_some()
}

fn read_subscription(value: &Value) -> Result<Subscription, ExchangeError> {
    let arg = value
        .get("arg")
        .ok_or_else(|| ExchangeError::ParseError("Missing arg field".to_string()))?;

    serde_json::from_value(arg.clone())
        .map_err(|e| ExchangeError::ParseError(format!("Failed to parse arg: {}", e)))
}

fn read_string(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(|v| match v {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    })
}

pub fn decode_control_response(value: &Value) -> Result<ControlResponse, ExchangeError> {
    let event = value
        .get("event")
        .ok_or_else(|| ExchangeError::ParseError("Missing event field".to_string()))?;
    let event: EventKind = serde_json::from_value(event.clone()).map_err(|e| {
        ExchangeError::ParseError(format!("Unknown event {}: {}", event, e))
    })?;

    match event {
        EventKind::Subscribe | EventKind::Unsubscribe => Ok(ControlResponse {
            event,
            subscription: Some(read_subscription(value)?),
            code: None,
            message: None,
        }),
        EventKind::Error => Ok(ControlResponse {
            event,
            subscription: None,
            code: read_string(value, "code"),
            message: read_string(value, "msg"),
        }),
    }
}

pub fn decode_data_event(value: &Value) -> Result<DataEvent, ExchangeError> {
    let subscription = read_subscription(value)?;

    Ok(DataEvent {
        channel: subscription.channel,
        inst_id: subscription.inst_id,
        data: value.get("data").cloned().unwrap_or(Value::Null),
    })
}

/// OKX WebSocket codec implementation
#[derive(Debug, Clone, Copy, Default)]
pub struct OkxCodec;

impl WsCodec for OkxCodec {
    type Subscription = Subscription;
    type Message = OkxMessage;

    fn encode_subscription(
        &self,
        subscriptions: &[Subscription],
    ) -> Result<Message, ExchangeError> {
        let request = encode_subscribe_request(Operation::Subscribe, subscriptions);
        Ok(Message::Text(request.to_string()))
    }

    /// Unreadable frames (bad UTF-8, malformed JSON) fail with `DeserializationError`;
    /// well-formed JSON of the wrong shape fails with `ParseError`.
    fn decode_message(&self, message: Message) -> Result<Option<Self::Message>, ExchangeError> {
        let text = match message {
            Message::Text(text) => text,
            Message::Binary(data) => String::from_utf8(data).map_err(|e| {
                ExchangeError::DeserializationError(format!(
                    "Invalid UTF-8 in binary message: {}",
                    e
                ))
            })?,
            _ => return Ok(None),
        };

        let value: Value = serde_json::from_str(&text).map_err(|e| {
            ExchangeError::DeserializationError(format!("Malformed JSON ({}): {}", e, text))
        })?;

        if !value.is_object() {
            return Ok(None);
        }

        if is_control_message(&value) {
            decode_control_response(&value).map(|r| Some(OkxMessage::Control(r)))
        } else {
            decode_data_event(&value).map(|e| Some(OkxMessage::Data(e)))
        }
    }
}
