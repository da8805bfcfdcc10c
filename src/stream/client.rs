// Watch API over shared per-endpoint connections
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use ahash::AHashMap;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument, trace, warn};

use crate::engine::book::OrderBookView;
use crate::engine::types::{Balances, Candle, Order, Ticker, Trade};
use crate::error::{StreamError, StreamResult};
use crate::market_data::adapters::{Access, ChannelTag, Classified, VenueAdapter};
use crate::market_data::markets::{MarketDirectory, MarketIndex};
use crate::stream::connection::{ConnectionHandle, ConnectionSettings, ConnectionState, FrameHandler, StreamConnection};
use crate::stream::hash::MessageHash;
use crate::stream::registry::{Pending, PendingRequestRegistry};
use crate::stream::state::{CacheLimits, ClientState, StreamValue, MY_TRADES};
use crate::stream::subscription::SubscriptionManager;

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub limits: CacheLimits,
    /// Collection watches return only what arrived since the previous resolution.
    pub new_updates: bool,
    /// Per-call deadline for every `watch*`.
    pub watch_timeout: Option<Duration>,
    pub connection: ConnectionSettings,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            limits: CacheLimits::default(),
            new_updates: true,
            watch_timeout: None,
            connection: ConnectionSettings::default(),
        }
    }
}

struct Endpoint {
    conn_id: u64,
    handle: ConnectionHandle,
    registry: PendingRequestRegistry<StreamValue>,
    subscriptions: SubscriptionManager,
}

impl Endpoint {
    fn new(conn_id: u64, handle: ConnectionHandle) -> Self {
        Self { conn_id, handle, registry: PendingRequestRegistry::new(), subscriptions: SubscriptionManager::new() }
    }
}

struct Shared {
    state: ClientState,
    endpoints: AHashMap<String, Endpoint>,
    next_conn_id: u64,
    closed: bool,
}

/// Streaming client for one venue. One connection per endpoint URL, shared by
/// every watch that needs it.
pub struct StreamClient {
    adapter: Arc<dyn VenueAdapter>,
    directory: Arc<dyn MarketDirectory>,
    options: ClientOptions,
    shared: Arc<Mutex<Shared>>,
    markets: OnceCell<()>,
}

impl StreamClient {
    pub fn new(adapter: Arc<dyn VenueAdapter>, directory: Arc<dyn MarketDirectory>, options: ClientOptions) -> Self {
        let shared = Shared {
            state: ClientState::new(options.limits),
            endpoints: AHashMap::new(),
            next_conn_id: 0,
            closed: false,
        };
        Self { adapter, directory, options, shared: Arc::new(Mutex::new(shared)), markets: OnceCell::new() }
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// Load the market directory once. Every watch calls this first so frame
    /// dispatch never waits on metadata.
    pub async fn load_markets(&self) -> StreamResult<usize> {
        self.markets
            .get_or_try_init(|| async {
                let markets = self.directory.load_markets().await?;
                info!(venue = self.adapter.id(), markets = markets.len(), "Markets loaded");
                self.shared.lock().state.markets = MarketIndex::new(markets);
                Ok::<(), StreamError>(())
            })
            .await?;
        Ok(self.shared.lock().state.markets.len())
    }

    fn market_id(&self, symbol: &str) -> StreamResult<String> {
        let shared = self.shared.lock();
        shared
            .state
            .markets
            .by_symbol(symbol)
            .map(|m| m.id.clone())
            .or_else(|| self.adapter.market_id_fallback(symbol))
            .ok_or_else(|| StreamError::BadSymbol(symbol.to_string()))
    }

    fn endpoint<'a>(&self, shared: &'a mut Shared, access: Access) -> StreamResult<&'a mut Endpoint> {
        if shared.closed {
            return Err(StreamError::Closed);
        }
        let url = self.adapter.endpoint(access);
        if shared.endpoints.get(&url).is_some_and(|e| e.handle.is_closed()) {
            shared.endpoints.remove(&url);
        }
        if !shared.endpoints.contains_key(&url) {
            let headers = self.adapter.connect_headers(access)?;
            shared.next_conn_id += 1;
            let conn_id = shared.next_conn_id;
            let dispatcher = Dispatcher {
                url: url.clone(),
                conn_id,
                adapter: Arc::clone(&self.adapter),
                shared: Arc::downgrade(&self.shared),
            };
            info!(url = %url, conn_id, "Opening endpoint");
            let handle = StreamConnection::spawn(&url, headers, self.options.connection.clone(), Arc::new(dispatcher));
            shared.endpoints.insert(url.clone(), Endpoint::new(conn_id, handle));
        }
        shared.endpoints.get_mut(&url).ok_or(StreamError::Closed)
    }

    /// Arm a waiter on `hashes` and queue a subscribe frame if the channel's
    /// wire subscription does not cover `market_ids` yet.
    fn arm(
        &self,
        channel: ChannelTag,
        market_ids: Option<Vec<String>>,
        hashes: &[MessageHash],
    ) -> StreamResult<Pending<StreamValue>> {
        let mut shared = self.shared.lock();
        let endpoint = self.endpoint(&mut shared, channel.access())?;
        let pending = endpoint.registry.subscribe_many(hashes);
        if let Some(ids) = endpoint.subscriptions.ensure_subscribed_many(channel, market_ids.as_deref(), hashes) {
            let frame = self.adapter.build_subscribe_frame(channel, &ids)?;
            trace!(channel = %channel, frame = %frame, "Queue subscribe");
            endpoint.handle.send(frame)?;
        }
        Ok(pending)
    }

    /// Wait for the next event on `hash`, subscribing `channel` (for `symbol`,
    /// or every market) when needed.
    #[instrument(level = "debug", skip(self, hash), fields(hash = %hash))]
    pub async fn watch(&self, hash: MessageHash, channel: ChannelTag, symbol: Option<&str>) -> StreamResult<StreamValue> {
        self.load_markets().await?;
        let market_id = symbol.map(|s| self.market_id(s)).transpose()?;
        let pending = self.arm(channel, market_id.map(|id| vec![id]), std::slice::from_ref(&hash))?;
        pending.wait(self.options.watch_timeout).await
    }

    /// Wait for the first event on any of `symbols` for `channel`.
    #[instrument(level = "debug", skip(self))]
    pub async fn watch_multiple(&self, channel: ChannelTag, symbols: &[&str]) -> StreamResult<StreamValue> {
        if symbols.is_empty() {
            return Err(StreamError::BadSymbol("empty symbol list".into()));
        }
        self.load_markets().await?;
        let ids = symbols.iter().map(|s| self.market_id(s)).collect::<StreamResult<Vec<_>>>()?;
        let hashes: Vec<_> = symbols.iter().map(|s| MessageHash::for_symbol(channel.as_str(), s)).collect();
        let pending = self.arm(channel, Some(ids), &hashes)?;
        pending.wait(self.options.watch_timeout).await
    }

    pub async fn watch_ticker(&self, symbol: &str) -> StreamResult<Ticker> {
        let hash = MessageHash::for_symbol(ChannelTag::Ticker.as_str(), symbol);
        match self.watch(hash, ChannelTag::Ticker, Some(symbol)).await? {
            StreamValue::Ticker(t) => Ok(t),
            other => Err(unexpected(&other)),
        }
    }

    /// In new-updates mode only the ticker that fired; otherwise every cached
    /// ticker among `symbols`.
    pub async fn watch_tickers(&self, symbols: &[&str]) -> StreamResult<BTreeMap<String, Ticker>> {
        let fired = match self.watch_multiple(ChannelTag::Ticker, symbols).await? {
            StreamValue::Ticker(t) => t,
            other => return Err(unexpected(&other)),
        };
        if self.options.new_updates {
            return Ok(BTreeMap::from([(fired.symbol.clone(), fired)]));
        }
        let shared = self.shared.lock();
        Ok(symbols
            .iter()
            .filter_map(|s| shared.state.ticker(s).map(|t| (s.to_string(), t.clone())))
            .collect())
    }

    pub async fn watch_trades(&self, symbol: &str, since: Option<i64>, limit: Option<usize>) -> StreamResult<Vec<Trade>> {
        let hash = MessageHash::for_symbol(ChannelTag::Trade.as_str(), symbol);
        match self.watch(hash, ChannelTag::Trade, Some(symbol)).await? {
            StreamValue::Trades { trades, new } => Ok(self.window(trades, new, since, limit, |t| t.timestamp)),
            other => Err(unexpected(&other)),
        }
    }

    /// Trades of whichever symbol fires first.
    pub async fn watch_trades_for_symbols(
        &self,
        symbols: &[&str],
        since: Option<i64>,
        limit: Option<usize>,
    ) -> StreamResult<Vec<Trade>> {
        match self.watch_multiple(ChannelTag::Trade, symbols).await? {
            StreamValue::Trades { trades, new } => Ok(self.window(trades, new, since, limit, |t| t.timestamp)),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn watch_order_book(&self, symbol: &str, limit: Option<usize>) -> StreamResult<OrderBookView> {
        let hash = MessageHash::for_symbol(ChannelTag::OrderBook.as_str(), symbol);
        match self.watch(hash, ChannelTag::OrderBook, Some(symbol)).await? {
            StreamValue::OrderBook(view) => Ok(view.limit(limit)),
            other => Err(unexpected(&other)),
        }
    }

    /// Only one-second candles are streamed.
    pub async fn watch_ohlcv(
        &self,
        symbol: &str,
        timeframe: &str,
        since: Option<i64>,
        limit: Option<usize>,
    ) -> StreamResult<Vec<Candle>> {
        if timeframe != "1s" {
            return Err(StreamError::NotSupported(format!("timeframe {timeframe}, only 1s candles are streamed")));
        }
        let hash = MessageHash::for_symbol(ChannelTag::Candle.as_str(), symbol);
        match self.watch(hash, ChannelTag::Candle, Some(symbol)).await? {
            StreamValue::Candles { candles, new } => Ok(self.window(candles, new, since, limit, |c| Some(c.timestamp))),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn watch_orders(
        &self,
        symbol: Option<&str>,
        since: Option<i64>,
        limit: Option<usize>,
    ) -> StreamResult<Vec<Order>> {
        let hash = hash_for(ChannelTag::MyOrder.as_str(), symbol);
        match self.watch(hash, ChannelTag::MyOrder, symbol).await? {
            StreamValue::Orders { orders, new } => Ok(self.window(orders, new, since, limit, |o| o.timestamp)),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn watch_my_trades(
        &self,
        symbol: Option<&str>,
        since: Option<i64>,
        limit: Option<usize>,
    ) -> StreamResult<Vec<Trade>> {
        let hash = hash_for(MY_TRADES, symbol);
        match self.watch(hash, ChannelTag::MyOrder, symbol).await? {
            StreamValue::MyTrades { trades, new } => Ok(self.window(trades, new, since, limit, |t| t.timestamp)),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn watch_balance(&self) -> StreamResult<Balances> {
        let hash = MessageHash::channel_wide(ChannelTag::MyAsset.as_str());
        match self.watch(hash, ChannelTag::MyAsset, None).await? {
            StreamValue::Balance(b) => Ok(b),
            other => Err(unexpected(&other)),
        }
    }

    /// Stop watching `channel` for `symbol` (or entirely). Pending waiters on
    /// the hash get `Closed`; the narrowed subscription is re-sent.
    pub fn unwatch(&self, channel: ChannelTag, symbol: Option<&str>) -> StreamResult<()> {
        let market_id = symbol.map(|s| self.market_id(s)).transpose()?;
        let hash = hash_for(channel.as_str(), symbol);
        let url = self.adapter.endpoint(channel.access());

        let mut shared = self.shared.lock();
        let Some(endpoint) = shared.endpoints.get_mut(&url) else {
            return Ok(());
        };
        endpoint.registry.reject(&hash, StreamError::Closed);
        if let Some(ids) = endpoint.subscriptions.remove(channel, market_id.as_deref(), &hash) {
            endpoint.handle.send(self.adapter.build_subscribe_frame(channel, &ids)?)?;
        }
        debug!(channel = %channel, symbol, "Unwatched");
        Ok(())
    }

    /// Reject waiters older than `max_age` on every endpoint.
    pub fn expire_waiters(&self, max_age: Duration) -> usize {
        let mut shared = self.shared.lock();
        let mut expired = 0;
        for endpoint in shared.endpoints.values_mut() {
            let hashes: Vec<MessageHash> = endpoint.registry.pending_hashes().cloned().collect();
            for hash in &hashes {
                expired += endpoint.registry.timeout(hash, max_age);
            }
        }
        expired
    }

    /// Close every connection and reject everything still pending. The client
    /// refuses new watches afterwards.
    pub fn close(&self) {
        let mut shared = self.shared.lock();
        if shared.closed {
            return;
        }
        shared.closed = true;
        for (url, mut endpoint) in shared.endpoints.drain() {
            endpoint.handle.close();
            let rejected = endpoint.registry.reject_all(StreamError::Closed);
            info!(url = %url, rejected, "Endpoint closed");
        }
    }

    pub fn order_book(&self, symbol: &str, limit: Option<usize>) -> Option<OrderBookView> {
        self.shared.lock().state.order_book(symbol).map(|b| b.limit(limit))
    }

    pub fn cached_trades(&self, symbol: &str) -> Vec<Trade> {
        self.shared.lock().state.trades(symbol)
    }

    pub fn cached_orders(&self) -> Vec<Order> {
        self.shared.lock().state.orders()
    }

    pub fn balance(&self) -> Balances {
        self.shared.lock().state.balance().clone()
    }

    pub fn connection_state(&self, access: Access) -> Option<ConnectionState> {
        let url = self.adapter.endpoint(access);
        self.shared.lock().endpoints.get(&url).map(|e| e.handle.state())
    }

    fn window<T>(
        &self,
        items: Vec<T>,
        new: usize,
        since: Option<i64>,
        limit: Option<usize>,
        ts: impl Fn(&T) -> Option<i64>,
    ) -> Vec<T> {
        let limit = if self.options.new_updates { Some(limit.map_or(new, |l| l.min(new))) } else { limit };
        filter_since_limit(items, since, limit, ts)
    }
}

impl Drop for StreamClient {
    fn drop(&mut self) {
        self.close();
    }
}

fn hash_for(channel: &str, symbol: Option<&str>) -> MessageHash {
    match symbol {
        Some(s) => MessageHash::for_symbol(channel, s),
        None => MessageHash::channel_wide(channel),
    }
}

fn unexpected(value: &StreamValue) -> StreamError {
    StreamError::Adapter(format!("unexpected value for this watch: {value:?}"))
}

/// Items at or after `since`, then the newest `limit` of them, oldest first.
pub fn filter_since_limit<T>(items: Vec<T>, since: Option<i64>, limit: Option<usize>, ts: impl Fn(&T) -> Option<i64>) -> Vec<T> {
    let mut out: Vec<T> = match since {
        Some(since) => items.into_iter().filter(|i| ts(i).is_some_and(|t| t >= since)).collect(),
        None => items,
    };
    if let Some(limit) = limit {
        let skip = out.len().saturating_sub(limit);
        out.drain(..skip);
    }
    out
}

/// Connection-side half of an endpoint: runs on the connection task and does
/// parse, mutate and resolve for a frame under one lock.
struct Dispatcher {
    url: String,
    conn_id: u64,
    adapter: Arc<dyn VenueAdapter>,
    shared: Weak<Mutex<Shared>>,
}

impl Dispatcher {
    fn with_endpoint<R>(&self, f: impl FnOnce(&mut ClientState, &mut Endpoint) -> R) -> Option<R> {
        let shared = self.shared.upgrade()?;
        let mut guard = shared.lock();
        let Shared { state, endpoints, .. } = &mut *guard;
        let endpoint = endpoints.get_mut(&self.url).filter(|e| e.conn_id == self.conn_id)?;
        Some(f(state, endpoint))
    }

    fn dispatch(&self, classified: Classified, raw: &Value, state: &mut ClientState, endpoint: &mut Endpoint) {
        match classified {
            Classified::Heartbeat => trace!("status frame"),
            Classified::Unknown => {
                debug!(frame = %raw, "Dropping unrecognised frame");
                metrics::counter!("mdsync_frames_dropped_total").increment(1);
            }
            Classified::Rejection { channel, kind, message } => {
                let hashes = endpoint.subscriptions.mark_rejected(channel);
                warn!(url = %self.url, %kind, %message, hashes = hashes.len(), "Subscription rejected");
                let error = StreamError::Rejected { kind, message };
                for hash in &hashes {
                    endpoint.registry.reject(hash, error.clone());
                }
            }
            Classified::Event(tag) => {
                let records = match self.adapter.parse(tag, raw, &state.markets) {
                    Ok(records) => records,
                    Err(e) => {
                        debug!(channel = %tag, error = %e, "Dropping unparseable frame");
                        metrics::counter!("mdsync_frames_dropped_total").increment(1);
                        return;
                    }
                };
                let registry = &endpoint.registry;
                let applied = state.apply(records, |hash| registry.is_pending(hash));

                for desync in &applied.desyncs {
                    warn!(symbol = %desync.symbol, error = %desync.error, "Order book desynchronised");
                    metrics::counter!("mdsync_book_desync_total").increment(1);
                }
                if applied.desyncs.iter().any(|d| d.wants_snapshot()) {
                    self.request_snapshot(endpoint);
                }
                for (hash, value) in applied.resolutions {
                    let delivered = endpoint.registry.resolve(&hash, value);
                    metrics::counter!("mdsync_waiters_resolved_total").increment(delivered as u64);
                }
            }
        }
    }

    // Re-sending the channel's subscribe frame makes the venue start over with a snapshot.
    fn request_snapshot(&self, endpoint: &mut Endpoint) {
        let Some(ids) = endpoint.subscriptions.scope_of(ChannelTag::OrderBook) else {
            return;
        };
        match self.adapter.build_subscribe_frame(ChannelTag::OrderBook, &ids) {
            Ok(frame) => {
                if endpoint.handle.send(frame).is_err() {
                    debug!(url = %self.url, "Connection gone before resnapshot");
                }
            }
            Err(e) => warn!(error = %e, "Cannot build resnapshot frame"),
        }
    }
}

impl FrameHandler for Dispatcher {
    fn on_open(&self, reconnected: bool) -> Vec<String> {
        if !reconnected {
            return Vec::new();
        }
        self.with_endpoint(|_, endpoint| {
            endpoint
                .subscriptions
                .replay()
                .into_iter()
                .filter_map(|(channel, ids)| match self.adapter.build_subscribe_frame(channel, &ids) {
                    Ok(frame) => Some(frame),
                    Err(e) => {
                        warn!(channel = %channel, error = %e, "Cannot rebuild subscription");
                        None
                    }
                })
                .collect::<Vec<_>>()
        })
        .map(|frames| {
            info!(url = %self.url, frames = frames.len(), "Replaying subscriptions");
            frames
        })
        .unwrap_or_default()
    }

    fn on_frame(&self, text: &str) {
        let raw: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                debug!(error = %e, "Dropping non-json frame");
                metrics::counter!("mdsync_frames_dropped_total").increment(1);
                return;
            }
        };
        let classified = self.adapter.classify(&raw);
        self.with_endpoint(|state, endpoint| self.dispatch(classified, &raw, state, endpoint));
    }

    fn on_drop(&self, error: &StreamError, will_retry: bool) {
        if will_retry {
            // books resume from the snapshots the replay brings back
            self.with_endpoint(|state, _| state.invalidate_books());
            debug!(url = %self.url, error = %error, "Holding waiters while reconnecting");
        }
    }

    fn on_closed(&self, error: Option<&StreamError>) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let mut guard = shared.lock();
        if !guard.endpoints.get(&self.url).is_some_and(|e| e.conn_id == self.conn_id) {
            return;
        }
        if let Some(mut endpoint) = guard.endpoints.remove(&self.url) {
            let error = error.cloned().unwrap_or(StreamError::Closed);
            let rejected = endpoint.registry.reject_all(error);
            debug!(url = %self.url, rejected, "Endpoint retired");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RejectionKind;
    use crate::market_data::adapters::upbit::{market_from_id, UpbitAdapter};
    use crate::market_data::markets::StaticMarkets;
    use crate::stream::connection::Outbound;
    use tokio::sync::mpsc::UnboundedReceiver;

    const URL: &str = "ws://upbit.test/websocket/v1";

    fn client(options: ClientOptions) -> StreamClient {
        let adapter = UpbitAdapter::with_url(URL).with_token(Some("jwt".into()));
        let markets = StaticMarkets(["KRW-BTC", "KRW-ETH"].iter().filter_map(|id| market_from_id(id)).collect());
        StreamClient::new(Arc::new(adapter), Arc::new(markets), options)
    }

    fn attach(client: &StreamClient, access: Access) -> (Dispatcher, UnboundedReceiver<Outbound>) {
        let url = client.adapter.endpoint(access);
        let (handle, rx) = ConnectionHandle::detached(&url);
        let mut shared = client.shared.lock();
        shared.next_conn_id += 1;
        let conn_id = shared.next_conn_id;
        shared.endpoints.insert(url.clone(), Endpoint::new(conn_id, handle));
        let dispatcher = Dispatcher { url, conn_id, adapter: Arc::clone(&client.adapter), shared: Arc::downgrade(&client.shared) };
        (dispatcher, rx)
    }

    fn waiters(client: &StreamClient, access: Access, hash: &str) -> usize {
        let url = client.adapter.endpoint(access);
        client.shared.lock().endpoints.get(&url).map_or(0, |e| e.registry.waiter_count(&MessageHash::from(hash)))
    }

    async fn until_waiters(client: &StreamClient, access: Access, hash: &str, n: usize) {
        while waiters(client, access, hash) < n {
            tokio::task::yield_now().await;
        }
    }

    fn frames(rx: &mut UnboundedReceiver<Outbound>) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(Outbound::Frame(f)) = rx.try_recv() {
            out.push(serde_json::from_str(&f).unwrap());
        }
        out
    }

    const BTC_TICKER: &str = r#"{"type":"ticker","code":"KRW-BTC","trade_price":100.0,"timestamp":1}"#;

    #[tokio::test]
    async fn test_two_watchers_share_one_frame_and_one_subscription() {
        let client = client(ClientOptions::default());
        let (dispatcher, mut outbound) = attach(&client, Access::Public);

        let feed = async {
            until_waiters(&client, Access::Public, "ticker:BTC/KRW", 2).await;
            dispatcher.on_frame(BTC_TICKER);
        };
        let (a, b, ()) = tokio::join!(client.watch_ticker("BTC/KRW"), client.watch_ticker("BTC/KRW"), feed);

        assert_eq!(a.unwrap().last, Some(100.0));
        assert_eq!(b.unwrap().last, Some(100.0));
        let sent = frames(&mut outbound);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0][1]["codes"], serde_json::json!(["KRW-BTC"]));
        assert_eq!(waiters(&client, Access::Public, "ticker:BTC/KRW"), 0);
    }

    #[tokio::test]
    async fn test_rejection_fails_only_tracked_hashes() {
        let client = client(ClientOptions::default());
        let (dispatcher, _outbound) = attach(&client, Access::Private);

        let feed = async {
            until_waiters(&client, Access::Private, "myAsset", 1).await;
            dispatcher.on_frame(r#"{"error":{"name":"INVALID_AUTH","message":"bad jwt"}}"#);
        };
        let (res, ()) = tokio::join!(client.watch_balance(), feed);
        assert_eq!(
            res.unwrap_err(),
            StreamError::Rejected { kind: RejectionKind::Authentication, message: "bad jwt".into() }
        );
    }

    #[tokio::test]
    async fn test_bad_book_frame_requests_snapshot() {
        let client = client(ClientOptions::default());
        let (dispatcher, mut outbound) = attach(&client, Access::Public);

        let feed = async {
            until_waiters(&client, Access::Public, "orderbook:BTC/KRW", 1).await;
            dispatcher.on_frame(
                r#"{"type":"orderbook","code":"KRW-BTC","timestamp":1,
                    "orderbook_units":[{"ask_price":101.0,"bid_price":100.0,"ask_size":1.0,"bid_size":-1.0}]}"#,
            );
            dispatcher.on_frame(
                r#"{"type":"orderbook","code":"KRW-BTC","timestamp":2,
                    "orderbook_units":[{"ask_price":101.0,"bid_price":100.0,"ask_size":1.0,"bid_size":2.0}]}"#,
            );
        };
        let (book, ()) = tokio::join!(client.watch_order_book("BTC/KRW", Some(5)), feed);

        let book = book.unwrap();
        assert_eq!(book.best_bid(), Some((100.0, 2.0)));
        // original subscribe plus the resnapshot request
        let sent = frames(&mut outbound);
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1][1]["type"], "orderbook");
    }

    #[tokio::test]
    async fn test_trades_new_updates_window() {
        let client = client(ClientOptions::default());
        let (dispatcher, _outbound) = attach(&client, Access::Public);
        let trade = |id: u64, price: f64| {
            format!(
                r#"{{"type":"trade","code":"KRW-ETH","trade_timestamp":{id},"trade_price":{price},"trade_volume":1.0,"ask_bid":"BID","sequential_id":{id}}}"#
            )
        };
        // arrives before anyone watches: cached, counted as new
        dispatcher.on_frame(&trade(1, 10.0));

        let feed = async {
            until_waiters(&client, Access::Public, "trade:ETH/KRW", 1).await;
            dispatcher.on_frame(&trade(2, 11.0));
        };
        let (trades, ()) = tokio::join!(client.watch_trades("ETH/KRW", None, None), feed);
        assert_eq!(trades.unwrap().len(), 2);

        let feed = async {
            until_waiters(&client, Access::Public, "trade:ETH/KRW", 1).await;
            dispatcher.on_frame(&trade(3, 12.0));
        };
        let (trades, ()) = tokio::join!(client.watch_trades("ETH/KRW", None, None), feed);
        let trades = trades.unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].price, 12.0);
        assert_eq!(client.cached_trades("ETH/KRW").len(), 3);
    }

    #[tokio::test]
    async fn test_watch_tickers_full_mode_returns_cached() {
        let client = client(ClientOptions { new_updates: false, ..Default::default() });
        let (dispatcher, _outbound) = attach(&client, Access::Public);
        dispatcher.on_frame(r#"{"type":"ticker","code":"KRW-ETH","trade_price":5.0}"#);

        let feed = async {
            until_waiters(&client, Access::Public, "ticker:BTC/KRW", 1).await;
            dispatcher.on_frame(BTC_TICKER);
        };
        let (tickers, ()) = tokio::join!(client.watch_tickers(&["BTC/KRW", "ETH/KRW"]), feed);
        let tickers = tickers.unwrap();
        assert_eq!(tickers.len(), 2);
        assert_eq!(tickers["ETH/KRW"].last, Some(5.0));
    }

    #[tokio::test]
    async fn test_unsupported_timeframe() {
        let client = client(ClientOptions::default());
        let err = client.watch_ohlcv("BTC/KRW", "1m", None, None).await.unwrap_err();
        assert!(matches!(err, StreamError::NotSupported(_)));
    }

    #[tokio::test]
    async fn test_watch_deadline_and_close() {
        let options = ClientOptions { watch_timeout: Some(Duration::from_millis(20)), ..Default::default() };
        let client = client(options);
        let (_dispatcher, _outbound) = attach(&client, Access::Public);

        let err = client.watch_ticker("BTC/KRW").await.unwrap_err();
        assert!(matches!(err, StreamError::Timeout { .. }));

        client.close();
        assert_eq!(client.watch_ticker("BTC/KRW").await.unwrap_err(), StreamError::Closed);
    }

    #[tokio::test]
    async fn test_close_rejects_pending() {
        let client = client(ClientOptions::default());
        let (_dispatcher, _outbound) = attach(&client, Access::Public);
        let closer = async {
            until_waiters(&client, Access::Public, "trade:BTC/KRW", 1).await;
            client.close();
        };
        let (res, ()) = tokio::join!(client.watch_trades("BTC/KRW", None, None), closer);
        assert_eq!(res.unwrap_err(), StreamError::Closed);
    }

    #[tokio::test]
    async fn test_unknown_symbol_without_fallback() {
        let client = client(ClientOptions::default());
        let err = client.watch_ticker("BTCKRW").await.unwrap_err();
        assert_eq!(err, StreamError::BadSymbol("BTCKRW".into()));
    }

    #[test]
    fn test_filter_since_limit() {
        let items = vec![1i64, 2, 3, 4, 5];
        assert_eq!(filter_since_limit(items.clone(), Some(2), Some(2), |i| Some(*i)), vec![4, 5]);
        assert_eq!(filter_since_limit(items.clone(), None, None, |i| Some(*i)), items);
        assert_eq!(filter_since_limit(items, Some(9), None, |i| Some(*i)), Vec::<i64>::new());
    }
}
