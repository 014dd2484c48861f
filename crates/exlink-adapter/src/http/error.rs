/*
[INPUT]:  Error sources (HTTP, exchange error strings, serialization, auth, WebSocket, IO)
[OUTPUT]: Structured error types with retry hints and auth classification
[POS]:    Error handling layer - unified error types for the adapter crate
[UPDATE]: When adding new error sources or exchange error codes
*/

use std::fmt;

use reqwest::StatusCode;
use thiserror::Error;

/// Main error type for the exchange adapter
#[derive(Error, Debug)]
pub enum ExchangeError {
    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// API returned an error response that has no more specific variant
    #[error("API error (code {code}): {message}")]
    Api { code: i32, message: String },

    /// Authentication failed
    #[error("Authentication failed: {message}")]
    Authentication { message: String },

    /// WebSocket token expired or was rejected as invalid
    #[error("auth token expired or invalid, refresh required")]
    TokenExpired,

    /// Exchange rejected the nonce as stale or out of order
    #[error("Invalid nonce")]
    InvalidNonce,

    /// Request signature is invalid
    #[error("Invalid request signature")]
    InvalidSignature,

    /// Key lacks the entitlement for the requested operation
    #[error("Permission denied: {message}")]
    PermissionDenied { message: String },

    /// Exchange rejected an order (insufficient funds, invalid params, ...)
    #[error("Order rejected: {reason}")]
    OrderRejected { reason: String },

    /// Serialization/deserialization failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// URL parsing failed
    #[error("Invalid URL: {0}")]
    UrlParse(#[from] url::ParseError),

    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// WebSocket session is not connected
    #[error("WebSocket not connected")]
    NotConnected,

    /// Invalid response from server
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Rate limit exceeded
    #[error("Rate limit exceeded, retry after {retry_after}s")]
    RateLimit { retry_after: u64 },

    /// Exchange-side service unavailable or busy
    #[error("Service unavailable: {0}")]
    Unavailable(String),

    /// Network operation timed out
    #[error("Timeout after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// Circuit breaker is open, call rejected without network I/O
    #[error("Circuit open for {component}, retry in {remaining_secs}s")]
    CircuitOpen {
        component: &'static str,
        remaining_secs: u64,
    },

    /// Operation not supported by this transport
    #[error("Unsupported operation: {0}")]
    Unsupported(&'static str),

    /// Local file IO failed (nonce or token persistence)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Auth failure classes that have distinct recovery paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthErrorKind {
    InvalidNonce,
    TokenExpired,
    InvalidSignature,
    PermissionDenied,
}

impl fmt::Display for AuthErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AuthErrorKind::InvalidNonce => "invalid_nonce",
            AuthErrorKind::TokenExpired => "token_expired",
            AuthErrorKind::InvalidSignature => "invalid_signature",
            AuthErrorKind::PermissionDenied => "permission_denied",
        };
        f.write_str(label)
    }
}

impl ExchangeError {
    /// Check if the error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExchangeError::Http(_)
                | ExchangeError::RateLimit { .. }
                | ExchangeError::Timeout { .. }
                | ExchangeError::WebSocket(_)
                | ExchangeError::NotConnected
                | ExchangeError::InvalidResponse(_)
                | ExchangeError::Unavailable(_)
        )
    }

    /// True when the request may never have reached the exchange, or its
    /// outcome is unknown. Callers fall back to another transport.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ExchangeError::Http(_)
                | ExchangeError::Timeout { .. }
                | ExchangeError::WebSocket(_)
                | ExchangeError::NotConnected
                | ExchangeError::Unavailable(_)
                | ExchangeError::RateLimit { .. }
        )
    }

    /// Get retry delay in seconds (if retryable)
    pub fn retry_delay(&self) -> Option<u64> {
        match self {
            ExchangeError::RateLimit { retry_after } => Some(*retry_after),
            ExchangeError::Timeout { .. } => Some(1),
            _ => None,
        }
    }

    /// Check if error indicates authentication failure
    pub fn is_auth_error(&self) -> bool {
        self.auth_error_kind().is_some()
    }

    pub fn auth_error_kind(&self) -> Option<AuthErrorKind> {
        match self {
            ExchangeError::InvalidNonce => Some(AuthErrorKind::InvalidNonce),
            ExchangeError::TokenExpired | ExchangeError::Authentication { .. } => {
                Some(AuthErrorKind::TokenExpired)
            }
            ExchangeError::InvalidSignature => Some(AuthErrorKind::InvalidSignature),
            ExchangeError::PermissionDenied { .. } => Some(AuthErrorKind::PermissionDenied),
            _ => None,
        }
    }

    /// Create an API error from status code and message
    pub fn api_error(status: StatusCode, message: impl Into<String>) -> Self {
        ExchangeError::Api {
            code: status.as_u16() as i32,
            message: message.into(),
        }
    }

    /// Map an exchange error string (`"EAPI:Invalid nonce"`, ...) to a variant.
    ///
    /// Used for both REST envelopes and WebSocket method responses, so the two
    /// transports classify failures identically.
    pub fn classify(message: &str) -> Self {
        let lower = message.to_ascii_lowercase();

        if lower.contains("invalid nonce") {
            return ExchangeError::InvalidNonce;
        }
        if lower.contains("permission denied") || lower.contains("egeneral:permission") {
            return ExchangeError::PermissionDenied {
                message: message.to_string(),
            };
        }
        if lower.contains("invalid signature") || lower.contains("invalid key") {
            return ExchangeError::InvalidSignature;
        }
        if (lower.contains("token") && (lower.contains("expired") || lower.contains("invalid")))
            || lower.contains("invalid session")
        {
            return ExchangeError::TokenExpired;
        }
        if lower.contains("rate limit") || lower.contains("too many requests") {
            return ExchangeError::RateLimit { retry_after: 1 };
        }
        if lower.starts_with("eservice") || lower.contains("unavailable") || lower.contains("busy")
        {
            return ExchangeError::Unavailable(message.to_string());
        }
        if lower.starts_with("eorder")
            || lower.contains("insufficient funds")
            || lower.contains("invalid arguments")
            || lower.contains("unknown order")
        {
            return ExchangeError::OrderRejected {
                reason: message.to_string(),
            };
        }

        ExchangeError::Api {
            code: 0,
            message: message.to_string(),
        }
    }
}

/// Result type alias for exchange operations
pub type Result<T> = std::result::Result<T, ExchangeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_retryable() {
        let timeout_err = ExchangeError::Timeout { duration_ms: 5000 };
        assert!(timeout_err.is_retryable());
        assert_eq!(timeout_err.retry_delay(), Some(1));

        let auth_err = ExchangeError::TokenExpired;
        assert!(!auth_err.is_retryable());
    }

    #[test]
    fn test_error_is_auth_error() {
        assert!(ExchangeError::TokenExpired.is_auth_error());
        assert!(ExchangeError::InvalidSignature.is_auth_error());
        assert!(ExchangeError::InvalidNonce.is_auth_error());
        assert!(!ExchangeError::Timeout { duration_ms: 30 }.is_auth_error());
    }

    #[test]
    fn test_api_error_creation() {
        let err = ExchangeError::api_error(StatusCode::BAD_REQUEST, "Invalid symbol");
        match err {
            ExchangeError::Api { code, message } => {
                assert_eq!(code, 400);
                assert_eq!(message, "Invalid symbol");
            }
            _ => panic!("Expected Api error variant"),
        }
    }

    #[test]
    fn test_classify_exchange_strings() {
        assert!(matches!(
            ExchangeError::classify("EAPI:Invalid nonce"),
            ExchangeError::InvalidNonce
        ));
        assert!(matches!(
            ExchangeError::classify("EGeneral:Permission denied"),
            ExchangeError::PermissionDenied { .. }
        ));
        assert!(matches!(
            ExchangeError::classify("EAPI:Invalid key"),
            ExchangeError::InvalidSignature
        ));
        assert!(matches!(
            ExchangeError::classify("ESession:Invalid session"),
            ExchangeError::TokenExpired
        ));
        assert!(matches!(
            ExchangeError::classify("EService:Unavailable"),
            ExchangeError::Unavailable(_)
        ));

        match ExchangeError::classify("EOrder:Insufficient funds") {
            ExchangeError::OrderRejected { reason } => {
                assert_eq!(reason, "EOrder:Insufficient funds");
            }
            other => panic!("unexpected classification: {other:?}"),
        }
    }

    #[test]
    fn test_permission_denied_is_not_retryable() {
        let err = ExchangeError::classify("EGeneral:Permission denied");
        assert!(!err.is_retryable());
        assert!(!err.is_transport());
        assert_eq!(err.auth_error_kind(), Some(AuthErrorKind::PermissionDenied));
    }
}
