use std::fmt;

/// Correlation key naming *what* a waiter wants, e.g. `ticker:BTC/KRW` or `myAsset`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageHash(String);

impl MessageHash {
    pub fn for_symbol(channel: &str, symbol: &str) -> Self {
        MessageHash(format!("{channel}:{symbol}"))
    }

    /// Aggregate (all-symbol) stream.
    pub fn channel_wide(channel: &str) -> Self {
        MessageHash(channel.to_string())
    }

    pub fn channel(&self) -> &str {
        self.0.split_once(':').map_or(self.0.as_str(), |(c, _)| c)
    }

    pub fn symbol(&self) -> Option<&str> {
        self.0.split_once(':').map(|(_, s)| s)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageHash {
    fn from(s: &str) -> Self {
        MessageHash(s.to_string())
    }
}
