// Symbol <-> venue market id lookups
use ahash::AHashMap;
use serde::{Deserialize, Serialize};

use crate::error::StreamError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Market {
    pub id: String,     // venue id, e.g. "KRW-BTC"
    pub symbol: String, // unified, e.g. "BTC/KRW"
    pub base: String,
    pub quote: String,
}

/// Loaded once per client, read synchronously by the dispatcher.
#[derive(Debug, Clone, Default)]
pub struct MarketIndex {
    by_symbol: AHashMap<String, Market>,
    by_id: AHashMap<String, Market>,
}

impl MarketIndex {
    pub fn new(markets: impl IntoIterator<Item = Market>) -> Self {
        let mut index = Self::default();
        for m in markets {
            index.by_id.insert(m.id.clone(), m.clone());
            index.by_symbol.insert(m.symbol.clone(), m);
        }
        index
    }

    pub fn by_symbol(&self, symbol: &str) -> Option<&Market> {
        self.by_symbol.get(symbol)
    }

    pub fn by_id(&self, id: &str) -> Option<&Market> {
        self.by_id.get(id)
    }

    pub fn symbols(&self) -> impl Iterator<Item = &str> {
        self.by_symbol.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

/// Source of market metadata. Loaded before the first subscription so that
/// frame dispatch never has to wait on a lookup.
#[async_trait::async_trait]
pub trait MarketDirectory: Send + Sync {
    async fn load_markets(&self) -> Result<Vec<Market>, StreamError>;
}

/// Fixed market list, for tests and offline runs.
#[derive(Debug, Clone, Default)]
pub struct StaticMarkets(pub Vec<Market>);

#[async_trait::async_trait]
impl MarketDirectory for StaticMarkets {
    async fn load_markets(&self) -> Result<Vec<Market>, StreamError> {
        Ok(self.0.clone())
    }
}
