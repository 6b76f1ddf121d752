mod common;

use std::time::Duration;

use common::*;
use stream_core::exchange::ExchangeError;
use stream_core::stream::{StreamClient, StreamError, StreamState};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const STREAM: &str = "btcusdt@orderbook";

#[tokio::test]
async fn test_snapshot_then_diff_publishes_new_book() {
    let (mock, mut links) = MockExchange::new();
    mock.set_snapshot(100, &[(100, 1)], &[(101, 1)]);
    let client = StreamClient::new(mock.clone(), fast_config()).unwrap();
    let sub = client.order_book_stream("BTCUSDT", 10).unwrap();

    let cancel = CancellationToken::new();
    let mut rx = sub.subscribe(&cancel).unwrap();
    let mut link = next_link(&mut links).await;
    assert!(link.next_text().await.contains(STREAM));

    wait_for_state(&sub, StreamState::Active).await;
    let initial = recv_item(&mut rx).await;
    assert_eq!(initial.last_update_id, 100);
    assert_eq!(initial.bids, levels(&[(100, 1)]));

    link.push(diff_frame(STREAM, 101, 102, &[(100, 0)], &[(101, 2)]))
        .await;
    let book = recv_item(&mut rx).await;
    assert!(book.bids.is_empty());
    assert_eq!(book.asks, levels(&[(101, 2)]));
    assert_eq!(book.last_update_id, 102);

    let latest = sub.latest_book().unwrap();
    assert_eq!(latest.last_update_id(), 102);
    // The first published version is untouched by the diff
    assert_eq!(initial.asks, levels(&[(101, 1)]));
}

#[tokio::test]
async fn test_stale_diff_publishes_nothing() {
    let (mock, mut links) = MockExchange::new();
    mock.set_snapshot(100, &[(100, 1)], &[(101, 1)]);
    let client = StreamClient::new(mock.clone(), fast_config()).unwrap();
    let sub = client.order_book_stream("BTCUSDT", 10).unwrap();

    let cancel = CancellationToken::new();
    let mut rx = sub.subscribe(&cancel).unwrap();
    let link = next_link(&mut links).await;
    wait_for_state(&sub, StreamState::Active).await;
    recv_item(&mut rx).await;

    link.push(diff_frame(STREAM, 90, 100, &[(99, 5)], &[])).await;
    link.push(diff_frame(STREAM, 101, 101, &[(99, 5)], &[])).await;

    let book = recv_item(&mut rx).await;
    assert_eq!(book.last_update_id, 101);
    assert_eq!(book.bids, levels(&[(100, 1), (99, 5)]));
}

#[tokio::test]
async fn test_diffs_before_snapshot_are_replayed() {
    let (mock, mut links) = MockExchange::new();
    let client = StreamClient::new(mock.clone(), fast_config()).unwrap();
    let sub = client.order_book_stream("BTCUSDT", 0).unwrap();

    let cancel = CancellationToken::new();
    let mut rx = sub.subscribe(&cancel).unwrap();
    let link = next_link(&mut links).await;

    // No snapshot yet: the diff waits in the buffer while fetches fail
    link.push(diff_frame(STREAM, 101, 102, &[(100, 0)], &[(101, 2)]))
        .await;
    mock.set_snapshot(100, &[(100, 1)], &[(101, 1)]);

    wait_for_state(&sub, StreamState::Active).await;
    let mut book = recv_item(&mut rx).await;
    while book.last_update_id < 102 {
        book = recv_item(&mut rx).await;
    }
    assert!(book.bids.is_empty());
    assert_eq!(book.asks, levels(&[(101, 2)]));
    assert_eq!(mock.opens(), 1);
}

#[tokio::test]
async fn test_gap_resyncs_from_fresh_snapshot() {
    let (mock, mut links) = MockExchange::new();
    mock.set_snapshot(100, &[(100, 1)], &[(101, 1)]);
    let config =
        fast_config().with_backoff(Duration::from_millis(300), Duration::from_secs(1));
    let client = StreamClient::new(mock.clone(), config).unwrap();
    let sub = client.order_book_stream("BTCUSDT", 10).unwrap();

    let cancel = CancellationToken::new();
    let mut rx = sub.subscribe(&cancel).unwrap();
    let link = next_link(&mut links).await;
    wait_for_state(&sub, StreamState::Active).await;
    recv_item(&mut rx).await;

    link.push(diff_frame(STREAM, 105, 106, &[(100, 3)], &[])).await;

    wait_for_state(&sub, StreamState::Reconnecting).await;
    assert!(sub.latest_book().is_none());

    mock.set_snapshot(110, &[(100, 7)], &[(101, 1)]);
    wait_for_state(&sub, StreamState::Active).await;

    let book = recv_item(&mut rx).await;
    assert_eq!(book.last_update_id, 110);
    assert_eq!(book.bids, levels(&[(100, 7)]));
    assert_eq!(sub.stats().reconnects, 1);
    assert_eq!(mock.snapshot_fetches(), 2);
    // Recovery reuses the connection
    assert_eq!(mock.opens(), 1);
}

#[tokio::test]
async fn test_depth_limits_the_view_not_the_replica() {
    let (mock, mut links) = MockExchange::new();
    mock.set_snapshot(
        100,
        &[(100, 1), (99, 1), (98, 1)],
        &[(101, 1), (102, 1), (103, 1)],
    );
    let client = StreamClient::new(mock.clone(), fast_config()).unwrap();
    let sub = client.order_book_stream("BTCUSDT", 2).unwrap();

    let cancel = CancellationToken::new();
    let mut rx = sub.subscribe(&cancel).unwrap();
    let _link = next_link(&mut links).await;
    wait_for_state(&sub, StreamState::Active).await;

    let book = recv_item(&mut rx).await;
    assert_eq!(book.depth(), (2, 2));
    assert_eq!(sub.latest_book().unwrap().depth(), (3, 3));
}

#[tokio::test]
async fn test_rejected_snapshot_closes_without_retry() {
    let (mock, mut links) = MockExchange::new();
    mock.reject_snapshots(ExchangeError::InvalidSymbol("BTCUSDT".to_string()));
    let client = StreamClient::new(mock.clone(), fast_config()).unwrap();
    let sub = client.order_book_stream("BTCUSDT", 10).unwrap();

    let cancel = CancellationToken::new();
    let mut rx = sub.subscribe(&cancel).unwrap();
    let mut errors = sub.errors().unwrap();
    let _link = next_link(&mut links).await;

    timeout(WAIT, sub.done().wait())
        .await
        .expect("subscription never closed");
    assert!(matches!(errors.recv().await, Some(StreamError::Rejected(_))));
    assert!(rx.recv().await.is_none());
    assert_eq!(mock.snapshot_fetches(), 1);
    assert!(sub.latest_book().is_none());
}
