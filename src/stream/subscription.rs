// Deduplicates logical subscriptions so concurrent watchers share one wire request
use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::market_data::adapters::ChannelTag;
use crate::stream::hash::MessageHash;

#[derive(Debug, Clone, PartialEq)]
pub struct Subscription {
    pub channel: ChannelTag,
    pub market_ids: BTreeSet<String>,
    /// Subscribed without a market filter (aggregate private streams).
    pub all_markets: bool,
    /// Hashes armed under this subscription; rejected together if the venue refuses it.
    pub hashes: BTreeSet<MessageHash>,
    pub active: bool,
}

impl Subscription {
    fn new(channel: ChannelTag) -> Self {
        Self {
            channel,
            market_ids: BTreeSet::new(),
            all_markets: false,
            hashes: BTreeSet::new(),
            active: false,
        }
    }

    /// Ids to put in a subscribe frame. Empty means every market.
    pub fn scope(&self) -> Vec<String> {
        if self.all_markets {
            Vec::new()
        } else {
            self.market_ids.iter().cloned().collect()
        }
    }
}

#[derive(Debug, Default)]
pub struct SubscriptionManager {
    subs: BTreeMap<ChannelTag, Subscription>,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge `market_id` into the channel. Returns the complete id set when a
    /// frame has to go out, `None` when the active subscription already covers it.
    pub fn ensure_subscribed(
        &mut self,
        channel: ChannelTag,
        market_id: Option<&str>,
        hash: &MessageHash,
    ) -> Option<Vec<String>> {
        let ids = market_id.map(|id| vec![id.to_string()]);
        self.ensure_subscribed_many(channel, ids.as_deref(), std::slice::from_ref(hash))
    }

    /// `market_ids == None` subscribes the channel for every market.
    pub fn ensure_subscribed_many(
        &mut self,
        channel: ChannelTag,
        market_ids: Option<&[String]>,
        hashes: &[MessageHash],
    ) -> Option<Vec<String>> {
        let sub = self.subs.entry(channel).or_insert_with(|| Subscription::new(channel));
        sub.hashes.extend(hashes.iter().cloned());

        let widened = match market_ids {
            None => !std::mem::replace(&mut sub.all_markets, true),
            Some(ids) => {
                let mut added = false;
                for id in ids {
                    added |= sub.market_ids.insert(id.clone());
                }
                added && !sub.all_markets
            }
        };

        if widened || !sub.active {
            sub.active = true;
            debug!(channel = %channel, ids = sub.market_ids.len(), all = sub.all_markets, "Subscription needs a frame");
            Some(sub.scope())
        } else {
            None
        }
    }

    /// Drop one market (or the whole channel when `market_id` is `None`).
    /// Returns the remaining id set to re-send, if anything is left active.
    pub fn remove(&mut self, channel: ChannelTag, market_id: Option<&str>, hash: &MessageHash) -> Option<Vec<String>> {
        let sub = self.subs.get_mut(&channel)?;
        sub.hashes.remove(hash);
        match market_id {
            Some(id) if sub.market_ids.remove(id) => {}
            Some(_) => return None,
            None => {
                self.subs.remove(&channel);
                return None;
            }
        }
        if sub.market_ids.is_empty() && !sub.all_markets {
            self.subs.remove(&channel);
            return None;
        }
        sub.active.then(|| sub.scope())
    }

    /// Mark the channel (or every channel) inactive and hand back the hashes
    /// whose waiters must be rejected. Nothing is retried automatically.
    pub fn mark_rejected(&mut self, channel: Option<ChannelTag>) -> Vec<MessageHash> {
        let mut hashes = Vec::new();
        for sub in self.subs.values_mut().filter(|s| channel.map_or(true, |c| c == s.channel)) {
            sub.active = false;
            hashes.extend(std::mem::take(&mut sub.hashes));
        }
        hashes
    }

    /// Every active `(channel, ids)` pair, for resubscribing after a reconnect.
    pub fn replay(&self) -> Vec<(ChannelTag, Vec<String>)> {
        self.subs.values().filter(|s| s.active).map(|s| (s.channel, s.scope())).collect()
    }

    /// Scope of one channel, if it is active.
    pub fn scope_of(&self, channel: ChannelTag) -> Option<Vec<String>> {
        self.subs.get(&channel).filter(|s| s.active).map(Subscription::scope)
    }

    pub fn deactivate_all(&mut self) {
        for sub in self.subs.values_mut() {
            sub.active = false;
        }
    }

    pub fn clear(&mut self) {
        self.subs.clear();
    }

    pub fn is_subscribed(&self, channel: ChannelTag, market_id: Option<&str>) -> bool {
        self.subs.get(&channel).is_some_and(|s| {
            s.active && (s.all_markets || market_id.map_or(false, |id| s.market_ids.contains(id)))
        })
    }

    pub fn active_channels(&self) -> impl Iterator<Item = ChannelTag> + '_ {
        self.subs.values().filter(|s| s.active).map(|s| s.channel)
    }

    pub fn get(&self, channel: ChannelTag) -> Option<&Subscription> {
        self.subs.get(&channel)
    }
}
