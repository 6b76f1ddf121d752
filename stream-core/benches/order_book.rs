use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rust_decimal::Decimal;
use std::time::Duration;
use stream_common::data::types::{PriceLevel, Symbol};
use stream_core::book::{BookSync, DepthDiff, DepthSnapshot, OrderBookReplica};

fn level(price: i64, quantity: i64) -> PriceLevel {
    PriceLevel::new(Decimal::from(price), Decimal::from(quantity))
}

fn create_snapshot(levels: i64) -> DepthSnapshot {
    DepthSnapshot {
        symbol: Symbol::new("BTCUSDT"),
        last_update_id: 1_000,
        bids: (0..levels).map(|i| level(50_000 - i, 1 + i % 5)).collect(),
        asks: (0..levels).map(|i| level(50_001 + i, 1 + i % 5)).collect(),
    }
}

/// Consecutive diffs that touch both sides and remove a level now and then
fn create_diffs(count: u64, levels: i64) -> Vec<DepthDiff> {
    (0..count)
        .map(|n| {
            let offset = (n as i64) % levels;
            let quantity = if n % 7 == 0 { 0 } else { 2 + (n as i64) % 3 };
            DepthDiff {
                symbol: Symbol::new("BTCUSDT"),
                first_update_id: 1_001 + n,
                final_update_id: 1_001 + n,
                bids: vec![level(50_000 - offset, quantity)],
                asks: vec![level(50_001 + offset, quantity)],
                event_time: Utc::now(),
            }
        })
        .collect()
}

fn bench_apply_diff(c: &mut Criterion) {
    let mut group = c.benchmark_group("apply_diff");
    group.measurement_time(Duration::from_secs(5));

    for levels in [20, 1000].iter() {
        let snapshot = create_snapshot(*levels);
        let diffs = create_diffs(1_000, *levels);

        group.bench_with_input(BenchmarkId::from_parameter(levels), &diffs, |b, diffs| {
            b.iter(|| {
                let mut replica = OrderBookReplica::from_snapshot(&snapshot);
                for diff in diffs {
                    replica.apply_diff(black_box(diff));
                }
                black_box(replica.last_update_id())
            });
        });
    }
    group.finish();
}

fn bench_publish(c: &mut Criterion) {
    let mut group = c.benchmark_group("publish");
    group.sample_size(50);

    for levels in [20, 1000].iter() {
        let snapshot = create_snapshot(*levels);
        let diffs = create_diffs(200, *levels);

        // A held reader forces a copy on every applied diff
        group.bench_with_input(BenchmarkId::new("with_reader", levels), &diffs, |b, diffs| {
            b.iter(|| {
                let mut sync = BookSync::new(Symbol::new("BTCUSDT"), 1_000);
                sync.on_snapshot(snapshot.clone());
                let mut held = sync.current();
                for diff in diffs {
                    sync.on_diff(diff.clone());
                    held = sync.current();
                }
                black_box(held)
            });
        });

        group.bench_with_input(BenchmarkId::new("no_reader", levels), &diffs, |b, diffs| {
            b.iter(|| {
                let mut sync = BookSync::new(Symbol::new("BTCUSDT"), 1_000);
                sync.on_snapshot(snapshot.clone());
                for diff in diffs {
                    black_box(sync.on_diff(diff.clone()));
                }
            });
        });
    }
    group.finish();
}

fn bench_order_book_view(c: &mut Criterion) {
    let replica = OrderBookReplica::from_snapshot(&create_snapshot(1000));

    c.bench_function("to_order_book_top_20", |b| {
        b.iter(|| black_box(replica.to_order_book(Some(20))));
    });
}

criterion_group!(benches, bench_apply_diff, bench_publish, bench_order_book_view);
criterion_main!(benches);
