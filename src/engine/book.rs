use std::collections::BTreeMap;

use itertools::Either;
use ordered_float::OrderedFloat;
use thiserror::Error;
use tracing::{instrument, trace, warn};

use crate::engine::types::{BookDelta, BookSide, BookSnapshot};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum BookError {
    #[error("book for {symbol} is awaiting a snapshot")]
    AwaitingSnapshot { symbol: String },
    #[error("negative size {size} at price {price}")]
    NegativeSize { price: f64, size: f64 },
    #[error("invalid level price={price} size={size}")]
    InvalidLevel { price: f64, size: f64 },
    #[error("sequence gap: expected {expected}, received {received}")]
    SequenceGap { expected: u64, received: u64 },
}

fn validate_level(price: f64, size: f64) -> Result<(), BookError> {
    if !price.is_finite() || price <= 0.0 || !size.is_finite() {
        return Err(BookError::InvalidLevel { price, size });
    }
    if size < 0.0 {
        return Err(BookError::NegativeSize { price, size });
    }
    Ok(())
}

/// One side of the book: price -> size. Iteration is best price first.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderBookSide {
    side: BookSide,
    levels: BTreeMap<OrderedFloat<f64>, f64>,
}

impl OrderBookSide {
    pub fn new(side: BookSide) -> Self {
        Self { side, levels: BTreeMap::new() }
    }

    /// Upsert a level, or remove it when `size == 0`.
    pub fn store(&mut self, price: f64, size: f64) -> Result<(), BookError> {
        validate_level(price, size)?;
        if size == 0.0 {
            self.levels.remove(&OrderedFloat(price));
        } else {
            self.levels.insert(OrderedFloat(price), size);
        }
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        let levels = self.levels.iter().map(|(p, s)| (p.into_inner(), *s));
        match self.side {
            BookSide::Bid => Either::Left(levels.rev()),
            BookSide::Ask => Either::Right(levels),
        }
    }

    pub fn best(&self) -> Option<(f64, f64)> {
        self.iter().next()
    }

    pub fn get(&self, price: f64) -> Option<f64> {
        self.levels.get(&OrderedFloat(price)).copied()
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    fn top(&self, n: Option<usize>) -> Vec<(f64, f64)> {
        self.iter().take(n.unwrap_or(usize::MAX)).collect()
    }
}

/// Read-only copy of a book, truncated per side.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderBookView {
    pub symbol: String,
    pub bids: Vec<(f64, f64)>,
    pub asks: Vec<(f64, f64)>,
    pub timestamp: Option<i64>,
    pub nonce: Option<u64>,
}

impl OrderBookView {
    pub fn limit(mut self, n: Option<usize>) -> Self {
        if let Some(n) = n {
            self.bids.truncate(n);
            self.asks.truncate(n);
        }
        self
    }

    pub fn best_bid(&self) -> Option<(f64, f64)> {
        self.bids.first().copied()
    }

    pub fn best_ask(&self) -> Option<(f64, f64)> {
        self.asks.first().copied()
    }
}

/// Local mirror of a venue order book, rebuilt from snapshots plus deltas.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderBook {
    pub symbol: String,
    bids: OrderBookSide,
    asks: OrderBookSide,
    timestamp: Option<i64>,
    nonce: Option<u64>,
    depth: Option<usize>,
    needs_snapshot: bool,
}

impl OrderBook {
    /// Empty book. Deltas are refused until the first `reset`.
    pub fn new(symbol: &str, depth: Option<usize>) -> Self {
        Self {
            symbol: symbol.to_string(),
            bids: OrderBookSide::new(BookSide::Bid),
            asks: OrderBookSide::new(BookSide::Ask),
            timestamp: None,
            nonce: None,
            depth,
            needs_snapshot: true,
        }
    }

    #[instrument(level = "trace", skip(self, bids, asks), fields(symbol = %self.symbol))]
    pub fn reset(
        &mut self,
        bids: &[(f64, f64)],
        asks: &[(f64, f64)],
        timestamp: Option<i64>,
        nonce: Option<u64>,
    ) -> Result<(), BookError> {
        let mut new_bids = OrderBookSide::new(BookSide::Bid);
        let mut new_asks = OrderBookSide::new(BookSide::Ask);
        let installed = bids
            .iter()
            .try_for_each(|&(p, s)| new_bids.store(p, s))
            .and_then(|_| asks.iter().try_for_each(|&(p, s)| new_asks.store(p, s)));

        if let Err(e) = installed {
            warn!(symbol = %self.symbol, error = %e, "Rejecting snapshot");
            self.bids = OrderBookSide::new(BookSide::Bid);
            self.asks = OrderBookSide::new(BookSide::Ask);
            self.needs_snapshot = true;
            return Err(e);
        }

        self.bids = new_bids;
        self.asks = new_asks;
        self.timestamp = timestamp;
        self.nonce = nonce;
        self.needs_snapshot = false;
        trace!(bids = self.bids.len(), asks = self.asks.len(), "Installed snapshot");
        Ok(())
    }

    pub fn apply_snapshot(&mut self, snapshot: &BookSnapshot) -> Result<(), BookError> {
        self.reset(&snapshot.bids, &snapshot.asks, snapshot.timestamp, snapshot.nonce)
    }

    /// Apply one level change. `Ok(false)` means the delta was stale (sequence
    /// already covered) and nothing changed.
    #[instrument(level = "trace", skip(self), fields(symbol = %self.symbol))]
    pub fn apply_delta(&mut self, delta: &BookDelta) -> Result<bool, BookError> {
        if self.needs_snapshot {
            return Err(BookError::AwaitingSnapshot { symbol: self.symbol.clone() });
        }

        if let (Some(seq), Some(nonce)) = (delta.sequence, self.nonce) {
            if seq <= nonce {
                trace!(seq, nonce, "Skipping stale delta");
                return Ok(false);
            }
            if seq > nonce + 1 {
                self.needs_snapshot = true;
                return Err(BookError::SequenceGap { expected: nonce + 1, received: seq });
            }
        }

        let side = match delta.side {
            BookSide::Bid => &mut self.bids,
            BookSide::Ask => &mut self.asks,
        };
        if let Err(e) = side.store(delta.price, delta.size) {
            self.needs_snapshot = true;
            return Err(e);
        }

        if delta.sequence.is_some() {
            self.nonce = delta.sequence;
        }
        if delta.timestamp.is_some() {
            self.timestamp = delta.timestamp;
        }
        Ok(true)
    }

    /// Apply every delta of one inbound message. Levels and sequence numbers
    /// are checked up front so a bad entry rejects the whole message instead
    /// of half of it.
    pub fn apply_deltas(&mut self, deltas: &[BookDelta]) -> Result<usize, BookError> {
        if self.needs_snapshot {
            return Err(BookError::AwaitingSnapshot { symbol: self.symbol.clone() });
        }
        if let Err(e) = self.check_batch(deltas) {
            self.needs_snapshot = true;
            return Err(e);
        }
        let mut applied = 0;
        for delta in deltas {
            if self.apply_delta(delta)? {
                applied += 1;
            }
        }
        Ok(applied)
    }

    fn check_batch(&self, deltas: &[BookDelta]) -> Result<(), BookError> {
        let mut nonce = self.nonce;
        for delta in deltas {
            validate_level(delta.price, delta.size)?;
            match (delta.sequence, nonce) {
                (Some(seq), Some(n)) if seq <= n => continue,
                (Some(seq), Some(n)) if seq > n + 1 => {
                    return Err(BookError::SequenceGap { expected: n + 1, received: seq });
                }
                _ => {}
            }
            if delta.sequence.is_some() {
                nonce = delta.sequence;
            }
        }
        Ok(())
    }

    pub fn limit(&self, n: Option<usize>) -> OrderBookView {
        let n = n.or(self.depth);
        OrderBookView {
            symbol: self.symbol.clone(),
            bids: self.bids.top(n),
            asks: self.asks.top(n),
            timestamp: self.timestamp,
            nonce: self.nonce,
        }
    }

    /// Force the next delta to wait for a fresh snapshot.
    pub fn invalidate(&mut self) {
        self.needs_snapshot = true;
    }

    pub fn needs_snapshot(&self) -> bool {
        self.needs_snapshot
    }

    pub fn bids(&self) -> &OrderBookSide {
        &self.bids
    }

    pub fn asks(&self) -> &OrderBookSide {
        &self.asks
    }

    pub fn timestamp(&self) -> Option<i64> {
        self.timestamp
    }

    pub fn nonce(&self) -> Option<u64> {
        self.nonce
    }

    pub fn best_bid(&self) -> Option<(f64, f64)> {
        self.bids.best()
    }

    pub fn best_ask(&self) -> Option<(f64, f64)> {
        self.asks.best()
    }

    pub fn spread(&self) -> Option<f64> {
        let (bid, _) = self.best_bid()?;
        let (ask, _) = self.best_ask()?;
        Some(ask - bid)
    }
}
