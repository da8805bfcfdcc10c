// Shared trait + records for venue adapters
use serde_json::Value;

use crate::engine::types::{Balances, BookDelta, BookSnapshot, Candle, Order, Ticker, Trade};
use crate::error::{AdapterError, RejectionKind};
use crate::market_data::markets::MarketIndex;

/// Closed set of channels the stream layer knows how to route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChannelTag {
    Ticker,
    Trade,
    OrderBook,
    Candle,
    MyOrder,
    MyAsset,
}

impl ChannelTag {
    pub const ALL: [ChannelTag; 6] = [
        ChannelTag::Ticker,
        ChannelTag::Trade,
        ChannelTag::OrderBook,
        ChannelTag::Candle,
        ChannelTag::MyOrder,
        ChannelTag::MyAsset,
    ];

    /// Channel name as it appears in message hashes and on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            ChannelTag::Ticker => "ticker",
            ChannelTag::Trade => "trade",
            ChannelTag::OrderBook => "orderbook",
            ChannelTag::Candle => "candle.1s",
            ChannelTag::MyOrder => "myOrder",
            ChannelTag::MyAsset => "myAsset",
        }
    }

    pub fn from_wire(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == name)
    }

    pub fn access(self) -> Access {
        match self {
            ChannelTag::MyOrder | ChannelTag::MyAsset => Access::Private,
            _ => Access::Public,
        }
    }
}

impl std::fmt::Display for ChannelTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Access {
    Public,
    Private,
}

/// What an inbound frame turned out to be.
#[derive(Debug, Clone, PartialEq)]
pub enum Classified {
    Event(ChannelTag),
    /// Venue refused a subscription. `channel` is `None` when the venue does
    /// not say which one, which makes every subscription on the endpoint suspect.
    Rejection { channel: Option<ChannelTag>, kind: RejectionKind, message: String },
    Heartbeat,
    Unknown,
}

/// Typed output of `VenueAdapter::parse`.
#[derive(Debug, Clone, PartialEq)]
pub enum CanonicalRecord {
    Ticker(Ticker),
    Trade(Trade),
    BookSnapshot(BookSnapshot),
    BookDelta(BookDelta),
    Candle(Candle),
    Order(Order),
    MyTrade(Trade),
    Balance(Balances),
}

/// Venue-specific translation between the wire and canonical records.
///
/// Everything here is synchronous: the dispatcher calls it while holding the
/// client state lock, so a frame is parsed completely before anything mutates.
pub trait VenueAdapter: Send + Sync + 'static {
    fn id(&self) -> &str;

    fn endpoint(&self, access: Access) -> String;

    /// Extra handshake headers, e.g. a bearer token for the private endpoint.
    fn connect_headers(&self, _access: Access) -> Result<Vec<(String, String)>, crate::error::StreamError> {
        Ok(Vec::new())
    }

    fn classify(&self, raw: &Value) -> Classified;

    fn parse(&self, tag: ChannelTag, raw: &Value, markets: &MarketIndex) -> Result<Vec<CanonicalRecord>, AdapterError>;

    /// Full subscribe frame for `channel`. An empty id list means every market.
    fn build_subscribe_frame(&self, channel: ChannelTag, market_ids: &[String]) -> Result<String, AdapterError>;

    /// Venue id for a unified symbol when the market directory does not know it.
    fn market_id_fallback(&self, symbol: &str) -> Option<String>;

    /// Unified symbol for a venue id when the market directory does not know it.
    fn symbol_fallback(&self, market_id: &str) -> Option<String>;
}

pub mod upbit;
pub mod upbit_types;
