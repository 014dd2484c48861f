/*
[INPUT]:  Crate modules and public type definitions
[OUTPUT]: Public exchange adapter crate surface
[POS]:    Crate root - module wiring
[UPDATE]: When public modules or exports change
*/

pub mod auth;
pub mod gateway;
pub mod http;
pub mod retry;
pub mod types;
pub mod ws;

// Re-export commonly used types from auth
pub use auth::{
    AuthRecovery,
    AuthToken,
    NonceAuthority,
    NonceConfig,
    TokenConfig,
    TokenGrant,
    TokenLifecycleManager,
    TokenSource,
    TokenState,
    TokenStatus,
};

pub use gateway::{BalanceSource, OrderGateway};

// Re-export commonly used types from http
pub use http::{
    AuthErrorKind,
    ClientConfig,
    CommandSigner,
    Credentials,
    ExchangeClient,
    ExchangeError,
    MockRequestSigner,
    RequestSigner,
    Result,
    SignerCommandConfig,
};

pub use retry::{BreakerStatus, CircuitBreaker, CircuitState, RetryPolicy};

// Re-export all types
pub use types::*;

// Re-export commonly used types from ws
pub use ws::{MessageKind, MethodResponse, PrivateWebSocket, WebSocketMessage, WsConfig, WsEvent};
