// Upbit adapter: wire <-> canonical translation for the websocket v1 API

use serde::Deserialize;
use serde_json::{json, Value};

use super::upbit_types::{RestMarket, WsCandle, WsErrorBody, WsMyAsset, WsMyOrder, WsOrderBook, WsTicker, WsTrade};
use super::{Access, CanonicalRecord, ChannelTag, Classified, VenueAdapter};
use crate::engine::types::{
    BalanceEntry, Balances, BookSnapshot, Candle, Fee, Order, OrderStatus, Side, Ticker, Trade,
};
use crate::error::{AdapterError, RejectionKind, StreamError};
use crate::market_data::markets::{Market, MarketDirectory, MarketIndex};

pub struct UpbitAdapter {
    pub ws_url: String,        // "wss://api.upbit.com/websocket/v1"
    pub token: Option<String>, // pre-signed JWT for the private endpoint
}

impl UpbitAdapter {
    pub fn new(hostname: &str) -> Self {
        Self::with_url(&format!("wss://{hostname}/websocket/v1"))
    }

    pub fn with_url(ws_url: &str) -> Self {
        Self { ws_url: ws_url.trim_end_matches('/').to_string(), token: None }
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    fn symbol_for(&self, markets: &MarketIndex, market_id: &str) -> String {
        markets
            .by_id(market_id)
            .map(|m| m.symbol.clone())
            .or_else(|| self.symbol_fallback(market_id))
            .unwrap_or_else(|| market_id.to_string())
    }

    fn quote_for(&self, markets: &MarketIndex, market_id: &str) -> String {
        markets
            .by_id(market_id)
            .map(|m| m.quote.clone())
            .or_else(|| market_id.split_once('-').map(|(quote, _)| quote.to_string()))
            .unwrap_or_default()
    }

    fn parse_ticker(&self, raw: &Value, markets: &MarketIndex) -> Result<Ticker, AdapterError> {
        let t = WsTicker::deserialize(raw)?;
        Ok(Ticker {
            symbol: self.symbol_for(markets, &t.code),
            timestamp: t.timestamp,
            open: t.opening_price,
            high: t.high_price,
            low: t.low_price,
            last: t.trade_price,
            previous_close: t.prev_closing_price,
            change: t.signed_change_price,
            percentage: t.signed_change_rate.map(|r| r * 100.0),
            base_volume: t.acc_trade_volume_24h,
            quote_volume: t.acc_trade_price_24h,
        })
    }

    fn parse_trade(&self, raw: &Value, markets: &MarketIndex) -> Result<Trade, AdapterError> {
        let t = WsTrade::deserialize(raw)?;
        Ok(Trade {
            id: t.sequential_id.map(|id| id.to_string()),
            symbol: self.symbol_for(markets, &t.code),
            timestamp: t.trade_timestamp.or(t.timestamp),
            side: if t.ask_bid.eq_ignore_ascii_case("bid") { Side::Buy } else { Side::Sell },
            price: t.trade_price,
            amount: t.trade_volume,
            cost: Some(t.trade_price * t.trade_volume),
            order: None,
            fee: None,
        })
    }

    // Upbit only ever streams the 15 topmost levels as a full picture; there
    // are no incremental deltas on this venue.
    fn parse_order_book(&self, raw: &Value, markets: &MarketIndex) -> Result<BookSnapshot, AdapterError> {
        let ob = WsOrderBook::deserialize(raw)?;
        let mut bids = Vec::with_capacity(ob.orderbook_units.len());
        let mut asks = Vec::with_capacity(ob.orderbook_units.len());
        for unit in &ob.orderbook_units {
            if let (Some(p), Some(s)) = (unit.bid_price, unit.bid_size) {
                bids.push((p, s));
            }
            if let (Some(p), Some(s)) = (unit.ask_price, unit.ask_size) {
                asks.push((p, s));
            }
        }
        Ok(BookSnapshot {
            symbol: self.symbol_for(markets, &ob.code),
            bids,
            asks,
            timestamp: ob.timestamp,
            nonce: None,
        })
    }

    fn parse_candle(&self, raw: &Value, markets: &MarketIndex) -> Result<Candle, AdapterError> {
        let c = WsCandle::deserialize(raw)?;
        Ok(Candle {
            symbol: self.symbol_for(markets, &c.code),
            timestamp: c.timestamp,
            open: c.opening_price,
            high: c.high_price,
            low: c.low_price,
            close: c.trade_price,
            volume: c.candle_acc_trade_volume,
        })
    }

    fn parse_my_order(&self, raw: &Value, markets: &MarketIndex) -> Result<Vec<CanonicalRecord>, AdapterError> {
        let o = WsMyOrder::deserialize(raw)?;
        let symbol = self.symbol_for(markets, &o.code);
        let side = if o.ask_bid.eq_ignore_ascii_case("bid") { Side::Buy } else { Side::Sell };
        let fee = o.paid_fee.map(|cost| Fee { currency: self.quote_for(markets, &o.code), cost });

        let mut records = Vec::with_capacity(2);
        if let Some(trade_id) = &o.trade_uuid {
            records.push(CanonicalRecord::MyTrade(Trade {
                id: Some(trade_id.clone()),
                symbol: symbol.clone(),
                timestamp: o.trade_timestamp,
                side,
                price: o.price.unwrap_or_default(),
                amount: o.volume.unwrap_or_default(),
                cost: o.executed_funds,
                order: Some(o.uuid.clone()),
                fee: fee.clone(),
            }));
        }
        records.push(CanonicalRecord::Order(Order {
            id: o.uuid,
            symbol,
            timestamp: o.order_timestamp,
            side,
            order_type: o.order_type,
            status: order_status(o.state.as_deref()),
            price: o.price,
            average: o.avg_price,
            amount: o.volume,
            filled: o.executed_volume,
            remaining: o.remaining_volume,
            cost: o.executed_funds,
            fee,
        }));
        Ok(records)
    }

    fn parse_balance(&self, raw: &Value) -> Result<Balances, AdapterError> {
        let a = WsMyAsset::deserialize(raw)?;
        let assets = a
            .assets
            .into_iter()
            .map(|asset| {
                let entry = BalanceEntry { free: asset.balance, used: asset.locked, total: asset.balance + asset.locked };
                (asset.currency, entry)
            })
            .collect();
        Ok(Balances { timestamp: a.timestamp, assets })
    }
}

fn order_status(state: Option<&str>) -> OrderStatus {
    match state {
        Some("done") => OrderStatus::Closed,
        Some("cancel") => OrderStatus::Canceled,
        // wait / watch / trade are all still working
        _ => OrderStatus::Open,
    }
}

fn rejection_kind(name: &str) -> RejectionKind {
    match name {
        "INVALID_AUTH" | "NO_AUTH_INFO" | "EXPIRED_ACCESS_KEY" | "JWT_VERIFICATION" => RejectionKind::Authentication,
        "OUT_OF_SCOPE" | "NO_AUTHORIZATION_IP" => RejectionKind::Permission,
        "NO_CODES" | "INVALID_CODE" | "INVALID_PARAM" => RejectionKind::UnknownSymbol,
        _ => RejectionKind::Other,
    }
}

/// `KRW-BTC` -> market record for `BTC/KRW`.
pub fn market_from_id(id: &str) -> Option<Market> {
    let (quote, base) = id.split_once('-')?;
    Some(Market {
        id: id.to_string(),
        symbol: format!("{base}/{quote}"),
        base: base.to_string(),
        quote: quote.to_string(),
    })
}

impl VenueAdapter for UpbitAdapter {
    fn id(&self) -> &str {
        "upbit"
    }

    fn endpoint(&self, access: Access) -> String {
        match access {
            Access::Public => self.ws_url.clone(),
            Access::Private => format!("{}/private", self.ws_url),
        }
    }

    fn connect_headers(&self, access: Access) -> Result<Vec<(String, String)>, StreamError> {
        match (access, &self.token) {
            (Access::Public, _) => Ok(Vec::new()),
            (Access::Private, Some(token)) => Ok(vec![("authorization".to_string(), format!("Bearer {token}"))]),
            (Access::Private, None) => Err(StreamError::Rejected {
                kind: RejectionKind::Authentication,
                message: "upbit private streams require an access token".to_string(),
            }),
        }
    }

    fn classify(&self, raw: &Value) -> Classified {
        if let Some(err) = raw.get("error") {
            return match WsErrorBody::deserialize(err) {
                Ok(body) => Classified::Rejection {
                    channel: None,
                    kind: rejection_kind(&body.name),
                    message: body.message.unwrap_or(body.name),
                },
                Err(_) => Classified::Unknown,
            };
        }
        if raw.get("status").and_then(Value::as_str) == Some("UP") {
            return Classified::Heartbeat;
        }
        raw.get("type")
            .and_then(Value::as_str)
            .and_then(ChannelTag::from_wire)
            .map_or(Classified::Unknown, Classified::Event)
    }

    fn parse(&self, tag: ChannelTag, raw: &Value, markets: &MarketIndex) -> Result<Vec<CanonicalRecord>, AdapterError> {
        Ok(match tag {
            ChannelTag::Ticker => vec![CanonicalRecord::Ticker(self.parse_ticker(raw, markets)?)],
            ChannelTag::Trade => vec![CanonicalRecord::Trade(self.parse_trade(raw, markets)?)],
            ChannelTag::OrderBook => vec![CanonicalRecord::BookSnapshot(self.parse_order_book(raw, markets)?)],
            ChannelTag::Candle => vec![CanonicalRecord::Candle(self.parse_candle(raw, markets)?)],
            ChannelTag::MyOrder => self.parse_my_order(raw, markets)?,
            ChannelTag::MyAsset => vec![CanonicalRecord::Balance(self.parse_balance(raw)?)],
        })
    }

    fn build_subscribe_frame(&self, channel: ChannelTag, market_ids: &[String]) -> Result<String, AdapterError> {
        let mut request = json!({ "type": channel.as_str() });
        if !market_ids.is_empty() {
            request["codes"] = json!(market_ids);
        }
        let frame = json!([{ "ticket": uuid::Uuid::new_v4().to_string() }, request]);
        Ok(frame.to_string())
    }

    fn market_id_fallback(&self, symbol: &str) -> Option<String> {
        let (base, quote) = symbol.split_once('/')?;
        Some(format!("{quote}-{base}"))
    }

    fn symbol_fallback(&self, market_id: &str) -> Option<String> {
        market_from_id(market_id).map(|m| m.symbol)
    }
}

/// Market list from `GET /v1/market/all`.
pub struct UpbitMarkets {
    pub rest_url: String, // "https://api.upbit.com"
    client: reqwest::Client,
}

impl UpbitMarkets {
    pub fn new(rest_url: &str) -> Self {
        Self { rest_url: rest_url.trim_end_matches('/').to_string(), client: reqwest::Client::new() }
    }
}

#[async_trait::async_trait]
impl MarketDirectory for UpbitMarkets {
    async fn load_markets(&self) -> Result<Vec<Market>, StreamError> {
        let url = format!("{}/v1/market/all", self.rest_url);
        let res = self
            .client
            .get(&url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| StreamError::network(url.as_str(), e))?;
        let rows: Vec<RestMarket> = res.json().await.map_err(|e| StreamError::Adapter(e.to_string()))?;
        Ok(rows.iter().filter_map(|r| market_from_id(&r.market)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn markets() -> MarketIndex {
        MarketIndex::new(market_from_id("KRW-BTC"))
    }

    #[test]
    fn test_classify() {
        let a = UpbitAdapter::new("api.upbit.com");
        assert_eq!(a.classify(&json!({"type": "ticker", "code": "KRW-BTC"})), Classified::Event(ChannelTag::Ticker));
        assert_eq!(a.classify(&json!({"type": "candle.1s"})), Classified::Event(ChannelTag::Candle));
        assert_eq!(a.classify(&json!({"status": "UP"})), Classified::Heartbeat);
        assert_eq!(a.classify(&json!({"type": "bogus"})), Classified::Unknown);
        assert_eq!(
            a.classify(&json!({"error": {"name": "INVALID_AUTH", "message": "bad token"}})),
            Classified::Rejection { channel: None, kind: RejectionKind::Authentication, message: "bad token".into() }
        );
    }

    #[test]
    fn test_subscribe_frame_shape() {
        let a = UpbitAdapter::new("api.upbit.com");
        let frame = a.build_subscribe_frame(ChannelTag::Trade, &["KRW-BTC".into(), "KRW-ETH".into()]).unwrap();
        let v: Value = serde_json::from_str(&frame).unwrap();
        assert!(v[0]["ticket"].is_string());
        assert_eq!(v[1]["type"], "trade");
        assert_eq!(v[1]["codes"], json!(["KRW-BTC", "KRW-ETH"]));

        let private = a.build_subscribe_frame(ChannelTag::MyAsset, &[]).unwrap();
        let v: Value = serde_json::from_str(&private).unwrap();
        assert!(v[1].get("codes").is_none());
    }

    #[test]
    fn test_parse_order_book_units() {
        let a = UpbitAdapter::new("api.upbit.com");
        let raw = json!({
            "type": "orderbook", "code": "KRW-BTC", "timestamp": 1584486737444i64,
            "orderbook_units": [
                {"ask_price": 101.0, "bid_price": 100.0, "ask_size": 1.5, "bid_size": 2.0},
                {"ask_price": 102.0, "bid_price": 99.0, "ask_size": 0.5, "bid_size": 3.0}
            ],
            "stream_type": "SNAPSHOT"
        });
        let records = a.parse(ChannelTag::OrderBook, &raw, &markets()).unwrap();
        let CanonicalRecord::BookSnapshot(snap) = &records[0] else { panic!("expected snapshot") };
        assert_eq!(snap.symbol, "BTC/KRW");
        assert_eq!(snap.bids, vec![(100.0, 2.0), (99.0, 3.0)]);
        assert_eq!(snap.asks, vec![(101.0, 1.5), (102.0, 0.5)]);
        assert_eq!(snap.timestamp, Some(1584486737444));
    }

    #[test]
    fn test_parse_trade_and_unknown_market_fallback() {
        let a = UpbitAdapter::new("api.upbit.com");
        let raw = json!({
            "type": "trade", "code": "KRW-ETH", "trade_timestamp": 1584508285000i64,
            "trade_price": 6747000.0, "trade_volume": 0.06499468, "ask_bid": "ASK",
            "sequential_id": 1584508285000002u64
        });
        let records = a.parse(ChannelTag::Trade, &raw, &markets()).unwrap();
        let CanonicalRecord::Trade(t) = &records[0] else { panic!("expected trade") };
        assert_eq!(t.symbol, "ETH/KRW");
        assert_eq!(t.side, Side::Sell);
        assert_eq!(t.id.as_deref(), Some("1584508285000002"));
    }

    #[test]
    fn test_my_order_with_trade_emits_both() {
        let a = UpbitAdapter::new("api.upbit.com");
        let raw = json!({
            "type": "myOrder", "code": "KRW-BTC", "uuid": "ord-1", "ask_bid": "BID",
            "order_type": "limit", "state": "trade", "trade_uuid": "tr-1",
            "price": "0.001453", "volume": 30.5, "executed_volume": 30.5,
            "paid_fee": 22.4, "order_timestamp": 1710751590000i64, "trade_timestamp": 1710751597500i64
        });
        let records = a.parse(ChannelTag::MyOrder, &raw, &markets()).unwrap();
        assert_eq!(records.len(), 2);
        let CanonicalRecord::MyTrade(t) = &records[0] else { panic!("expected my trade") };
        assert_eq!(t.order.as_deref(), Some("ord-1"));
        assert_eq!(t.fee.as_ref().map(|f| f.currency.as_str()), Some("KRW"));
        let CanonicalRecord::Order(o) = &records[1] else { panic!("expected order") };
        assert_eq!(o.status, OrderStatus::Open);
        assert_eq!(o.side, Side::Buy);
        assert_eq!(o.price, Some(0.001453));
    }

    #[test]
    fn test_parse_balance() {
        let a = UpbitAdapter::new("api.upbit.com");
        let raw = json!({
            "type": "myAsset",
            "assets": [{"currency": "SGD", "balance": 1386929.37, "locked": "10329.67"}],
            "timestamp": 1710146517267i64
        });
        let records = a.parse(ChannelTag::MyAsset, &raw, &markets()).unwrap();
        let CanonicalRecord::Balance(b) = &records[0] else { panic!("expected balance") };
        assert_eq!(b.assets["SGD"].used, 10329.67);
        assert_eq!(b.timestamp, Some(1710146517267));
    }

    #[test]
    fn test_malformed_payload_is_an_error() {
        let a = UpbitAdapter::new("api.upbit.com");
        let raw = json!({"type": "trade", "code": "KRW-BTC"});
        assert!(a.parse(ChannelTag::Trade, &raw, &markets()).is_err());
    }

    #[test]
    fn test_private_endpoint_needs_token() {
        let a = UpbitAdapter::with_url("ws://127.0.0.1:1/websocket/v1");
        assert_eq!(a.endpoint(Access::Private), "ws://127.0.0.1:1/websocket/v1/private");
        assert!(a.connect_headers(Access::Private).is_err());
        let a = a.with_token(Some("jwt".into()));
        assert_eq!(a.connect_headers(Access::Private).unwrap()[0].1, "Bearer jwt");
    }

    #[test]
    fn test_symbol_id_fallbacks() {
        let a = UpbitAdapter::new("api.upbit.com");
        assert_eq!(a.market_id_fallback("BTC/KRW").as_deref(), Some("KRW-BTC"));
        assert_eq!(a.symbol_fallback("USDT-XRP").as_deref(), Some("XRP/USDT"));
        assert_eq!(a.symbol_fallback("nodash"), None);
    }
}
