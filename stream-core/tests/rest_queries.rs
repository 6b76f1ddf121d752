mod common;

use common::*;
use stream_common::data::types::{KlineInterval, Symbol};
use stream_core::exchange::{Exchange, ExchangeError};

#[tokio::test]
async fn test_rest_queries_default_to_unsupported() {
    let (mock, _links) = MockExchange::new();
    let symbol = Symbol::new("BTCUSDT");

    let err = mock.fetch_ticker(&symbol).await.unwrap_err();
    assert!(matches!(err, ExchangeError::Unsupported(_)));
    assert!(!err.is_retryable());

    assert!(matches!(
        mock.fetch_trades(&symbol, 10).await,
        Err(ExchangeError::Unsupported(_))
    ));
    assert!(matches!(
        mock.fetch_klines(&symbol, KlineInterval::OneMinute, 10).await,
        Err(ExchangeError::Unsupported(_))
    ));
    assert!(matches!(
        mock.fetch_symbols().await,
        Err(ExchangeError::Unsupported(_))
    ));
}
