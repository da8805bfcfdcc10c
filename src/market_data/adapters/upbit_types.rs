// Source: https://global-docs.upbit.com/reference/websocket-guide
use serde::{de, Deserialize, Deserializer};
use serde_json::Value;

// Private streams mix numbers and numeric strings depending on the field.
fn number_or_string<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
    match Value::deserialize(d)? {
        Value::Number(n) => n.as_f64().ok_or_else(|| de::Error::custom("number out of range")),
        Value::String(s) => s.parse().map_err(de::Error::custom),
        other => Err(de::Error::custom(format!("expected number, got {other}"))),
    }
}

fn opt_number_or_string<'de, D: Deserializer<'de>>(d: D) -> Result<Option<f64>, D::Error> {
    match Option::<Value>::deserialize(d)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => Ok(n.as_f64()),
        Some(Value::String(s)) => s.parse().map(Some).map_err(de::Error::custom),
        Some(other) => Err(de::Error::custom(format!("expected number, got {other}"))),
    }
}

#[derive(Debug, Deserialize)]
pub struct WsTicker {
    pub code: String,
    pub opening_price: Option<f64>,
    pub high_price: Option<f64>,
    pub low_price: Option<f64>,
    pub trade_price: Option<f64>,
    pub prev_closing_price: Option<f64>,
    pub signed_change_price: Option<f64>,
    pub signed_change_rate: Option<f64>,
    pub acc_trade_volume_24h: Option<f64>,
    pub acc_trade_price_24h: Option<f64>,
    pub timestamp: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct WsTrade {
    pub code: String,
    pub trade_timestamp: Option<i64>,
    pub timestamp: Option<i64>,
    pub trade_price: f64,
    pub trade_volume: f64,
    pub ask_bid: String, // "ASK" = seller was taker
    pub sequential_id: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct WsOrderBookUnit {
    pub ask_price: Option<f64>,
    pub bid_price: Option<f64>,
    pub ask_size: Option<f64>,
    pub bid_size: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct WsOrderBook {
    pub code: String,
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub orderbook_units: Vec<WsOrderBookUnit>,
}

#[derive(Debug, Deserialize)]
pub struct WsCandle {
    pub code: String,
    pub opening_price: f64,
    pub high_price: f64,
    pub low_price: f64,
    pub trade_price: f64,
    pub candle_acc_trade_volume: f64,
    pub timestamp: i64,
}

#[derive(Debug, Deserialize)]
pub struct WsMyOrder {
    pub code: String,
    pub uuid: String,
    pub ask_bid: String,
    pub order_type: Option<String>,
    pub state: Option<String>,
    pub trade_uuid: Option<String>,
    #[serde(default, deserialize_with = "opt_number_or_string")]
    pub price: Option<f64>,
    #[serde(default, deserialize_with = "opt_number_or_string")]
    pub avg_price: Option<f64>,
    #[serde(default, deserialize_with = "opt_number_or_string")]
    pub volume: Option<f64>,
    #[serde(default, deserialize_with = "opt_number_or_string")]
    pub remaining_volume: Option<f64>,
    #[serde(default, deserialize_with = "opt_number_or_string")]
    pub executed_volume: Option<f64>,
    #[serde(default, deserialize_with = "opt_number_or_string")]
    pub executed_funds: Option<f64>,
    #[serde(default, deserialize_with = "opt_number_or_string")]
    pub paid_fee: Option<f64>,
    pub order_timestamp: Option<i64>,
    pub trade_timestamp: Option<i64>,
    pub timestamp: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct WsAsset {
    pub currency: String,
    #[serde(deserialize_with = "number_or_string")]
    pub balance: f64,
    #[serde(deserialize_with = "number_or_string")]
    pub locked: f64,
}

#[derive(Debug, Deserialize)]
pub struct WsMyAsset {
    #[serde(default)]
    pub assets: Vec<WsAsset>,
    pub timestamp: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct WsErrorBody {
    pub name: String,
    pub message: Option<String>,
}

// REST GET /v1/market/all
#[derive(Debug, Deserialize)]
pub struct RestMarket {
    pub market: String, // "KRW-BTC"
}
