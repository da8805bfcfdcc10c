// Canonical records produced by venue adapters and stored by the stream caches
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

/// Which side of an order book a level belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookSide {
    Bid,
    Ask,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticker {
    pub symbol: String,
    pub timestamp: Option<i64>,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub last: Option<f64>,
    pub previous_close: Option<f64>,
    pub change: Option<f64>,
    pub percentage: Option<f64>,
    pub base_volume: Option<f64>,
    pub quote_volume: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fee {
    pub currency: String,
    pub cost: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub id: Option<String>,
    pub symbol: String,
    pub timestamp: Option<i64>,
    pub side: Side,
    pub price: f64,
    pub amount: f64,
    pub cost: Option<f64>,
    /// Owning order id, only set on private (my) trades.
    pub order: Option<String>,
    pub fee: Option<Fee>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Open,
    Closed,
    Canceled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub symbol: String,
    pub timestamp: Option<i64>,
    pub side: Side,
    pub order_type: Option<String>,
    pub status: OrderStatus,
    pub price: Option<f64>,
    pub average: Option<f64>,
    pub amount: Option<f64>,
    pub filled: Option<f64>,
    pub remaining: Option<f64>,
    pub cost: Option<f64>,
    pub fee: Option<Fee>,
}

impl Order {
    /// Carry forward what an update frame does not repeat: the fee already
    /// known for the order and the first-seen timestamp.
    pub fn merge_previous(&mut self, previous: &Order) {
        if let Some(fee) = &previous.fee {
            self.fee = Some(fee.clone());
        }
        if previous.timestamp.is_some() {
            self.timestamp = previous.timestamp;
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BalanceEntry {
    pub free: f64,
    pub used: f64,
    pub total: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Balances {
    pub timestamp: Option<i64>,
    pub assets: BTreeMap<String, BalanceEntry>,
}

impl Balances {
    /// Per-currency overwrite; currencies absent from `update` are kept.
    pub fn merge(&mut self, update: Balances) {
        if update.timestamp.is_some() {
            self.timestamp = update.timestamp;
        }
        self.assets.extend(update.assets);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: String,
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Full authoritative book state at a point in time.
#[derive(Debug, Clone, PartialEq)]
pub struct BookSnapshot {
    pub symbol: String,
    pub bids: Vec<(f64, f64)>, // (price, size)
    pub asks: Vec<(f64, f64)>,
    pub timestamp: Option<i64>,
    pub nonce: Option<u64>,
}

/// One price level change. `size == 0` removes the level.
#[derive(Debug, Clone, PartialEq)]
pub struct BookDelta {
    pub symbol: String,
    pub side: BookSide,
    pub price: f64,
    pub size: f64,
    pub sequence: Option<u64>,
    pub timestamp: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order(ts: Option<i64>, fee: Option<Fee>) -> Order {
        Order {
            id: "o-1".into(),
            symbol: "BTC/KRW".into(),
            timestamp: ts,
            side: Side::Buy,
            order_type: Some("limit".into()),
            status: OrderStatus::Open,
            price: Some(100.0),
            average: None,
            amount: Some(1.0),
            filled: Some(0.0),
            remaining: Some(1.0),
            cost: None,
            fee,
        }
    }

    #[test]
    fn test_merge_previous_keeps_first_timestamp_and_fee() {
        let first = order(Some(1_000), Some(Fee { currency: "KRW".into(), cost: 5.0 }));
        let mut update = order(Some(2_000), None);
        update.status = OrderStatus::Closed;
        update.merge_previous(&first);

        assert_eq!(update.timestamp, Some(1_000));
        assert_eq!(update.fee, first.fee);
        assert_eq!(update.status, OrderStatus::Closed);
    }

    #[test]
    fn test_balance_merge() {
        let mut b = Balances::default();
        b.assets.insert("KRW".into(), BalanceEntry { free: 10.0, used: 0.0, total: 10.0 });
        b.assets.insert("BTC".into(), BalanceEntry { free: 1.0, used: 0.0, total: 1.0 });

        let mut upd = Balances { timestamp: Some(5), ..Default::default() };
        upd.assets.insert("KRW".into(), BalanceEntry { free: 4.0, used: 6.0, total: 10.0 });
        b.merge(upd);

        assert_eq!(b.timestamp, Some(5));
        assert_eq!(b.assets["KRW"].used, 6.0);
        assert_eq!(b.assets["BTC"].free, 1.0);
    }
}
