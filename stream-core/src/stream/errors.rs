use thiserror::Error;

use crate::exchange::ExchangeError;

/// Stream layer error types
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StreamError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Subscription already active")]
    AlreadySubscribed,

    #[error("Subscription not active")]
    NotSubscribed,

    #[error("Stream closed")]
    Closed,

    #[error("Subscription cancelled")]
    Cancelled,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Connection lost: {0}")]
    Disconnected(String),

    #[error("Order book gap on {symbol}: expected update {expected}, received {first_update_id}")]
    Gap {
        symbol: String,
        expected: u64,
        first_update_id: u64,
    },

    #[error("Reconnect attempts exhausted after {attempts} attempts: {last_error}")]
    ReconnectExhausted { attempts: u32, last_error: String },

    #[error("Rejected by exchange: {0}")]
    Rejected(String),

    #[error("Multiplexer unavailable")]
    MultiplexerClosed,
}

impl StreamError {
    /// Check if the subscription keeps running after this error
    pub fn is_recoverable(&self) -> bool {
        match self {
            StreamError::Protocol(_) => true,
            StreamError::Disconnected(_) => true,
            StreamError::Gap { .. } => true,
            StreamError::Config(_) => false,
            StreamError::AlreadySubscribed => false,
            StreamError::NotSubscribed => false,
            StreamError::Closed => false,
            StreamError::Cancelled => false,
            StreamError::ReconnectExhausted { .. } => false,
            StreamError::Rejected(_) => false,
            StreamError::MultiplexerClosed => false,
        }
    }

    /// Errors that end a subscription for good
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StreamError::Cancelled
                | StreamError::ReconnectExhausted { .. }
                | StreamError::Rejected(_)
                | StreamError::MultiplexerClosed
        )
    }
}

impl From<ExchangeError> for StreamError {
    fn from(err: ExchangeError) -> Self {
        match err {
            ExchangeError::ParseError(msg) => StreamError::Protocol(msg),
            other => StreamError::Disconnected(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(StreamError::Protocol("bad frame".into()).is_recoverable());
        assert!(StreamError::Disconnected("reset".into()).is_recoverable());
        assert!(!StreamError::Cancelled.is_recoverable());

        let exhausted = StreamError::ReconnectExhausted {
            attempts: 3,
            last_error: "refused".into(),
        };
        assert!(exhausted.is_terminal());
        assert!(!StreamError::Gap {
            symbol: "BTCUSDT".into(),
            expected: 101,
            first_update_id: 105,
        }
        .is_terminal());
    }

    #[test]
    fn test_exchange_error_conversion() {
        let parse: StreamError = ExchangeError::ParseError("bad json".into()).into();
        assert_eq!(parse, StreamError::Protocol("bad json".into()));

        let timeout: StreamError = ExchangeError::Timeout.into();
        assert!(matches!(timeout, StreamError::Disconnected(_)));

        assert!(StreamError::Rejected("HTTP 400".into()).is_terminal());
    }
}
