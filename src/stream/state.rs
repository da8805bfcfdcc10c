// Per-client caches and books, mutated only by the dispatcher
use std::collections::BTreeMap;

use ahash::AHashMap;
use itertools::Itertools;
use tracing::trace;

use crate::cache::{BoundedKeyedSequence, BoundedSequence};
use crate::engine::book::{BookError, OrderBook, OrderBookView};
use crate::engine::types::{Balances, Candle, Order, Ticker, Trade};
use crate::market_data::adapters::{CanonicalRecord, ChannelTag};
use crate::market_data::markets::MarketIndex;
use crate::stream::hash::MessageHash;

/// Aggregate hash for my-trades. They ride on the `myOrder` channel.
pub const MY_TRADES: &str = "myTrades";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheLimits {
    pub trades: usize,
    pub orders: usize,
    pub ohlcv: usize,
    pub order_book_depth: Option<usize>,
}

impl Default for CacheLimits {
    fn default() -> Self {
        Self { trades: 1000, orders: 1000, ohlcv: 1000, order_book_depth: Some(15) }
    }
}

/// What a resolved watch receives. Collections are copies of the cache at
/// resolution time; `new` counts items appended since the previous resolution.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamValue {
    Ticker(Ticker),
    Trades { trades: Vec<Trade>, new: usize },
    OrderBook(OrderBookView),
    Candles { candles: Vec<Candle>, new: usize },
    Orders { orders: Vec<Order>, new: usize },
    MyTrades { trades: Vec<Trade>, new: usize },
    Balance(Balances),
}

/// A book that could not take an update.
#[derive(Debug, Clone, PartialEq)]
pub struct Desync {
    pub symbol: String,
    pub error: BookError,
}

impl Desync {
    /// A fresh desync asks the venue for a snapshot; deltas arriving while the
    /// book already waits for one do not.
    pub fn wants_snapshot(&self) -> bool {
        !matches!(self.error, BookError::AwaitingSnapshot { .. })
    }
}

#[derive(Debug, Default)]
pub struct Applied {
    pub resolutions: Vec<(MessageHash, StreamValue)>,
    pub desyncs: Vec<Desync>,
}

type OrderKey = (String, String); // (symbol, id)

/// Something a frame changed. Values are built from these once the whole
/// frame is in, so counts cover every record of the frame.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Touched {
    Ticker(String),
    Trades(String),
    Book(String),
    Candles(String),
    Orders(Option<String>),
    MyTrades(Option<String>),
    Balance,
}

impl Touched {
    fn hash(&self) -> MessageHash {
        let scoped = |channel: &str, symbol: &Option<String>| match symbol {
            Some(s) => MessageHash::for_symbol(channel, s),
            None => MessageHash::channel_wide(channel),
        };
        match self {
            Touched::Ticker(s) => MessageHash::for_symbol(ChannelTag::Ticker.as_str(), s),
            Touched::Trades(s) => MessageHash::for_symbol(ChannelTag::Trade.as_str(), s),
            Touched::Book(s) => MessageHash::for_symbol(ChannelTag::OrderBook.as_str(), s),
            Touched::Candles(s) => MessageHash::for_symbol(ChannelTag::Candle.as_str(), s),
            Touched::Orders(s) => scoped(ChannelTag::MyOrder.as_str(), s),
            Touched::MyTrades(s) => scoped(MY_TRADES, s),
            Touched::Balance => MessageHash::channel_wide(ChannelTag::MyAsset.as_str()),
        }
    }
}

/// New-update counts per symbol for caches shared by all symbols.
#[derive(Debug, Default)]
struct SymbolUpdates(AHashMap<String, usize>);

impl SymbolUpdates {
    fn bump(&mut self, symbol: &str, cap: usize) {
        let n = self.0.entry(symbol.to_string()).or_default();
        *n = (*n + 1).min(cap);
    }

    fn take(&mut self, symbol: &str) -> usize {
        self.0.remove(symbol).unwrap_or(0)
    }
}

pub struct ClientState {
    pub markets: MarketIndex,
    limits: CacheLimits,
    tickers: BTreeMap<String, Ticker>,
    trades: AHashMap<String, BoundedSequence<Trade>>,
    candles: AHashMap<String, BoundedKeyedSequence<i64, Candle>>,
    orders: BoundedKeyedSequence<OrderKey, Order>,
    order_updates: SymbolUpdates,
    my_trades: BoundedKeyedSequence<OrderKey, Trade>,
    my_trade_updates: SymbolUpdates,
    balance: Balances,
    books: AHashMap<String, OrderBook>,
}

impl ClientState {
    pub fn new(limits: CacheLimits) -> Self {
        Self {
            markets: MarketIndex::default(),
            limits,
            tickers: BTreeMap::new(),
            trades: AHashMap::new(),
            candles: AHashMap::new(),
            orders: BoundedKeyedSequence::new(limits.orders),
            order_updates: SymbolUpdates::default(),
            my_trades: BoundedKeyedSequence::new(limits.orders),
            my_trade_updates: SymbolUpdates::default(),
            balance: Balances::default(),
            books: AHashMap::new(),
        }
    }

    /// Fold one frame's records into the caches, then build one value per
    /// touched hash that `wants` accepts. Unwatched hashes keep accumulating
    /// `new`. Resolutions come in the order their hashes were last touched.
    pub fn apply<F>(&mut self, records: Vec<CanonicalRecord>, wants: F) -> Applied
    where
        F: Fn(&MessageHash) -> bool,
    {
        let mut applied = Applied::default();
        let mut touched = Vec::new();
        let mut records = records.into_iter().peekable();
        while let Some(record) = records.next() {
            match record {
                CanonicalRecord::Ticker(t) => {
                    touched.push(Touched::Ticker(t.symbol.clone()));
                    self.tickers.insert(t.symbol.clone(), t);
                }
                CanonicalRecord::Trade(t) => {
                    let cap = self.limits.trades;
                    touched.push(Touched::Trades(t.symbol.clone()));
                    self.trades.entry(t.symbol.clone()).or_insert_with(|| BoundedSequence::new(cap)).append(t);
                }
                CanonicalRecord::BookSnapshot(snap) => {
                    let book = self.book_entry(&snap.symbol);
                    match book.apply_snapshot(&snap) {
                        Ok(()) => touched.push(Touched::Book(snap.symbol)),
                        Err(error) => applied.desyncs.push(Desync { symbol: snap.symbol, error }),
                    }
                }
                CanonicalRecord::BookDelta(first) => {
                    // consecutive deltas for one book go in as a single batch
                    let symbol = first.symbol.clone();
                    let mut batch = vec![first];
                    while let Some(CanonicalRecord::BookDelta(d)) =
                        records.next_if(|r| matches!(r, CanonicalRecord::BookDelta(d) if d.symbol == symbol))
                    {
                        batch.push(d);
                    }
                    let book = self.book_entry(&symbol);
                    match book.apply_deltas(&batch) {
                        Ok(0) => trace!(symbol = %symbol, "stale deltas"),
                        Ok(_) => touched.push(Touched::Book(symbol)),
                        Err(error) => applied.desyncs.push(Desync { symbol, error }),
                    }
                }
                CanonicalRecord::Candle(c) => {
                    let cap = self.limits.ohlcv;
                    touched.push(Touched::Candles(c.symbol.clone()));
                    let cache = self.candles.entry(c.symbol.clone()).or_insert_with(|| BoundedKeyedSequence::new(cap));
                    // same-second updates replace the open candle
                    let ts = c.timestamp;
                    cache.append(c, ts);
                }
                CanonicalRecord::Order(mut o) => {
                    let key = (o.symbol.clone(), o.id.clone());
                    if let Some(previous) = self.orders.get_by_key(&key) {
                        o.merge_previous(previous);
                    }
                    self.order_updates.bump(&o.symbol, self.limits.orders);
                    touched.push(Touched::Orders(None));
                    touched.push(Touched::Orders(Some(o.symbol.clone())));
                    self.orders.append(o, key);
                }
                CanonicalRecord::MyTrade(t) => {
                    let Some(id) = t.id.clone() else {
                        trace!(symbol = %t.symbol, "my trade without id");
                        continue;
                    };
                    self.my_trade_updates.bump(&t.symbol, self.limits.orders);
                    touched.push(Touched::MyTrades(None));
                    touched.push(Touched::MyTrades(Some(t.symbol.clone())));
                    let key = (t.symbol.clone(), id);
                    self.my_trades.append(t, key);
                }
                CanonicalRecord::Balance(b) => {
                    self.balance.merge(b);
                    touched.push(Touched::Balance);
                }
            }
        }

        let mut latest: Vec<Touched> = touched.into_iter().rev().unique().collect();
        latest.reverse();
        for t in latest {
            let hash = t.hash();
            if !wants(&hash) {
                continue;
            }
            if let Some(value) = self.value_for(&t) {
                applied.resolutions.push((hash, value));
            }
        }
        applied
    }

    /// Current value for a touched hash. Takes the new-update count it reports.
    fn value_for(&mut self, touched: &Touched) -> Option<StreamValue> {
        let value = match touched {
            Touched::Ticker(s) => StreamValue::Ticker(self.tickers.get(s)?.clone()),
            Touched::Trades(s) => {
                let cache = self.trades.get_mut(s)?;
                StreamValue::Trades { new: cache.take_new_updates(), trades: cache.to_vec() }
            }
            Touched::Book(s) => {
                let book = self.books.get(s).filter(|b| !b.needs_snapshot())?;
                StreamValue::OrderBook(book.limit(None))
            }
            Touched::Candles(s) => {
                let cache = self.candles.get_mut(s)?;
                StreamValue::Candles { new: cache.take_new_updates(), candles: cache.to_vec() }
            }
            Touched::Orders(None) => {
                StreamValue::Orders { new: self.orders.take_new_updates(), orders: self.orders.to_vec() }
            }
            Touched::Orders(Some(symbol)) => {
                let orders = self.orders.iter_where(|(s, _), _| s == symbol).cloned().collect();
                StreamValue::Orders { orders, new: self.order_updates.take(symbol) }
            }
            Touched::MyTrades(None) => {
                StreamValue::MyTrades { new: self.my_trades.take_new_updates(), trades: self.my_trades.to_vec() }
            }
            Touched::MyTrades(Some(symbol)) => {
                let trades = self.my_trades.iter_where(|(s, _), _| s == symbol).cloned().collect();
                StreamValue::MyTrades { trades, new: self.my_trade_updates.take(symbol) }
            }
            Touched::Balance => StreamValue::Balance(self.balance.clone()),
        };
        Some(value)
    }

    fn book_entry(&mut self, symbol: &str) -> &mut OrderBook {
        let depth = self.limits.order_book_depth;
        self.books.entry(symbol.to_string()).or_insert_with(|| OrderBook::new(symbol, depth))
    }

    /// Every book waits for a fresh snapshot, e.g. after a reconnect.
    pub fn invalidate_books(&mut self) {
        for book in self.books.values_mut() {
            book.invalidate();
        }
    }

    pub fn ticker(&self, symbol: &str) -> Option<&Ticker> {
        self.tickers.get(symbol)
    }

    pub fn tickers(&self) -> &BTreeMap<String, Ticker> {
        &self.tickers
    }

    pub fn trades(&self, symbol: &str) -> Vec<Trade> {
        self.trades.get(symbol).map(BoundedSequence::to_vec).unwrap_or_default()
    }

    pub fn orders(&self) -> Vec<Order> {
        self.orders.to_vec()
    }

    pub fn my_trades(&self) -> Vec<Trade> {
        self.my_trades.to_vec()
    }

    pub fn balance(&self) -> &Balances {
        &self.balance
    }

    pub fn order_book(&self, symbol: &str) -> Option<&OrderBook> {
        self.books.get(symbol)
    }
}
