/*
[INPUT]:  Raw WebSocket text frames
[OUTPUT]: Channel messages, method responses and session events
[POS]:    WebSocket layer - message parsing and validation
[UPDATE]: When adding new channels or changing frame format
*/

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::http::ExchangeError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Snapshot,
    #[default]
    Update,
    #[serde(other)]
    Other,
}

/// Push messages, tagged by `channel`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "channel", rename_all = "lowercase")]
pub enum WebSocketMessage {
    Balances {
        #[serde(rename = "type", default)]
        kind: MessageKind,
        #[serde(default)]
        data: Value,
    },
    Executions {
        #[serde(rename = "type", default)]
        kind: MessageKind,
        #[serde(default)]
        data: Value,
    },
    Heartbeat,
    Status {
        #[serde(default)]
        data: Value,
    },
    #[serde(other)]
    Other,
}

impl WebSocketMessage {
    pub fn channel(&self) -> &'static str {
        match self {
            WebSocketMessage::Balances { .. } => "balances",
            WebSocketMessage::Executions { .. } => "executions",
            WebSocketMessage::Heartbeat => "heartbeat",
            WebSocketMessage::Status { .. } => "status",
            WebSocketMessage::Other => "other",
        }
    }
}

/// Reply to a `{method, params, req_id}` request.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct MethodResponse {
    pub method: String,
    #[serde(default)]
    pub req_id: Option<u64>,
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub result: Value,
    #[serde(default)]
    pub error: Option<String>,
}

impl MethodResponse {
    /// Failed responses go through the same classifier as REST errors.
    pub fn into_result(self) -> Result<Value, ExchangeError> {
        if self.success {
            Ok(self.result)
        } else {
            let message = self
                .error
                .unwrap_or_else(|| format!("{} failed without error text", self.method));
            Err(ExchangeError::classify(&message))
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Response(MethodResponse),
    Channel(WebSocketMessage),
}

pub fn parse_frame(text: &str) -> Result<Frame, serde_json::Error> {
    let value: Value = serde_json::from_str(text)?;
    if value.get("method").is_some() && value.get("channel").is_none() {
        Ok(Frame::Response(serde_json::from_value(value)?))
    } else {
        Ok(Frame::Channel(serde_json::from_value(value)?))
    }
}

/// What a session consumer receives.
#[derive(Debug, Clone, PartialEq)]
pub enum WsEvent {
    Message(WebSocketMessage),
    Disconnected { reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_balance_snapshot() {
        let frame = parse_frame(
            r#"{"channel":"balances","type":"snapshot","data":[{"asset":"USD","balance":10}]}"#,
        )
        .unwrap();

        match frame {
            Frame::Channel(WebSocketMessage::Balances { kind, data }) => {
                assert_eq!(kind, MessageKind::Snapshot);
                assert!(data.is_array());
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn parses_heartbeat_and_unknown_channels() {
        assert_eq!(
            parse_frame(r#"{"channel":"heartbeat"}"#).unwrap(),
            Frame::Channel(WebSocketMessage::Heartbeat)
        );
        assert_eq!(
            parse_frame(r#"{"channel":"book","data":[]}"#).unwrap(),
            Frame::Channel(WebSocketMessage::Other)
        );
    }

    #[test]
    fn method_response_errors_are_classified() {
        let frame = parse_frame(
            r#"{"method":"subscribe","req_id":4,"success":false,"error":"EGeneral:Permission denied"}"#,
        )
        .unwrap();

        let Frame::Response(response) = frame else {
            panic!("expected response");
        };
        assert_eq!(response.req_id, Some(4));
        assert!(matches!(
            response.into_result(),
            Err(ExchangeError::PermissionDenied { .. })
        ));
    }
}
