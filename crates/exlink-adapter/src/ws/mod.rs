/*
[INPUT]:  WebSocket configuration, session token, channel subscriptions
[OUTPUT]: Push balances/executions and method responses
[POS]:    WebSocket layer - private session streams
[UPDATE]: When adding new channels or changing connection logic
*/

pub mod client;
pub mod message;

pub use client::{PrivateWebSocket, WsConfig};
pub use message::{Frame, MessageKind, MethodResponse, WebSocketMessage, WsEvent, parse_frame};
