// =================================================================
// exchange/errors.rs - Error Types
// =================================================================

use thiserror::Error;

/// Error types for exchange operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExchangeError {
    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    #[error("Rate limit exceeded: {0}")]
    RateLimit(String),

    #[error("Invalid symbol: {0}")]
    InvalidSymbol(String),

    #[error("Data parsing error: {0}")]
    ParseError(String),

    #[error("Connection timeout")]
    Timeout,

    #[error("Exchange API error: {0}")]
    ApiError(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Provider already registered: {0}")]
    AlreadyRegistered(String),

    #[error("Provider not registered: {0}")]
    NotRegistered(String),
}

impl ExchangeError {
    /// Whether retrying the same request can succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExchangeError::NetworkError(_)
                | ExchangeError::WebSocketError(_)
                | ExchangeError::RateLimit(_)
                | ExchangeError::Timeout
        )
    }
}

// Convert from common error types
impl From<serde_json::Error> for ExchangeError {
    fn from(err: serde_json::Error) -> Self {
        ExchangeError::ParseError(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ExchangeError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        ExchangeError::WebSocketError(err.to_string())
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ExchangeError::Timeout
        } else if err.is_connect() {
            ExchangeError::NetworkError(err.to_string())
        } else if err.status().map(|s| s.as_u16() == 429).unwrap_or(false) {
            ExchangeError::RateLimit(err.to_string())
        } else {
            ExchangeError::ApiError(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(ExchangeError::Timeout.is_retryable());
        assert!(ExchangeError::NetworkError("reset".into()).is_retryable());
        assert!(!ExchangeError::ParseError("bad".into()).is_retryable());
        assert!(!ExchangeError::AlreadyRegistered("binance".into()).is_retryable());
    }

    #[test]
    fn test_from_serde_error() {
        let err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        assert!(matches!(ExchangeError::from(err), ExchangeError::ParseError(_)));
    }
}
