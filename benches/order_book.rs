//! Order book and cache hot paths: delta application, snapshot resets and
//! keyed upserts at venue-realistic sizes.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use mdsync_rs::cache::BoundedKeyedSequence;
use mdsync_rs::engine::book::OrderBook;
use mdsync_rs::engine::types::{BookDelta, BookSide};

fn snapshot_levels(levels: usize) -> (Vec<(f64, f64)>, Vec<(f64, f64)>) {
    let bids = (0..levels).map(|i| (50_000.0 - i as f64, 1.0 + i as f64 * 0.1)).collect();
    let asks = (0..levels).map(|i| (50_001.0 + i as f64, 1.0 + i as f64 * 0.1)).collect();
    (bids, asks)
}

fn deltas(n: usize, levels: usize) -> Vec<BookDelta> {
    (0..n)
        .map(|i| {
            let side = if i % 2 == 0 { BookSide::Bid } else { BookSide::Ask };
            let offset = (i % levels) as f64;
            let price = match side {
                BookSide::Bid => 50_000.0 - offset,
                BookSide::Ask => 50_001.0 + offset,
            };
            // every fifth update removes its level
            let size = if i % 5 == 0 { 0.0 } else { 0.5 + (i % 7) as f64 };
            BookDelta {
                symbol: "BTC/KRW".into(),
                side,
                price,
                size,
                sequence: Some(i as u64 + 1),
                timestamp: None,
            }
        })
        .collect()
}

fn bench_apply_delta(c: &mut Criterion) {
    let mut group = c.benchmark_group("order_book_apply_delta");
    for levels in [15usize, 100, 1000] {
        let (bids, asks) = snapshot_levels(levels);
        let updates = deltas(1_000, levels);
        group.throughput(Throughput::Elements(updates.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(levels), &levels, |b, _| {
            b.iter(|| {
                let mut book = OrderBook::new("BTC/KRW", None);
                book.reset(&bids, &asks, None, Some(0)).unwrap();
                for d in &updates {
                    black_box(book.apply_delta(d).unwrap());
                }
                black_box(book.best_bid())
            })
        });
    }
    group.finish();
}

fn bench_snapshot_reset(c: &mut Criterion) {
    let (bids, asks) = snapshot_levels(15);
    let mut book = OrderBook::new("BTC/KRW", Some(15));
    c.bench_function("order_book_reset_15", |b| {
        b.iter(|| {
            book.reset(black_box(&bids), black_box(&asks), Some(1), None).unwrap();
            black_box(book.limit(Some(5)))
        })
    });
}

fn bench_keyed_upsert(c: &mut Criterion) {
    c.bench_function("keyed_upsert_1000", |b| {
        b.iter(|| {
            let mut orders = BoundedKeyedSequence::new(1_000);
            for i in 0..5_000u64 {
                orders.append(i, i % 1_500);
            }
            black_box(orders.len())
        })
    });
}

criterion_group!(benches, bench_apply_delta, bench_snapshot_reset, bench_keyed_upsert);
criterion_main!(benches);
