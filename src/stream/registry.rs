//! Pending-request registry.
//!
//! Maps a [`MessageHash`] to every caller currently waiting on it. One inbound
//! event resolves all of them at once and clears the list; the next `watch`
//! re-arms the same hash. A caller waiting on several hashes holds one shared
//! completion slot, so whichever hash fires first wins and the other entries
//! go dead and get pruned.

use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use itertools::Itertools;
use parking_lot::Mutex;
use smallvec::SmallVec;
use tokio::sync::oneshot;
use tracing::trace;

use crate::error::StreamError;
use crate::stream::hash::MessageHash;

type Outcome<V> = Result<V, StreamError>;
type Slot<V> = Arc<Mutex<Option<oneshot::Sender<Outcome<V>>>>>;

struct Waiter<V> {
    id: u64,
    created_at: Instant,
    slot: Slot<V>,
}

impl<V> Clone for Waiter<V> {
    fn clone(&self) -> Self {
        Self { id: self.id, created_at: self.created_at, slot: Arc::clone(&self.slot) }
    }
}

impl<V> Waiter<V> {
    fn is_live(&self) -> bool {
        self.slot.lock().as_ref().is_some_and(|tx| !tx.is_closed())
    }

    fn complete(&self, outcome: Outcome<V>) -> bool {
        match self.slot.lock().take() {
            Some(tx) => tx.send(outcome).is_ok(),
            None => false,
        }
    }
}

/// Handle returned to a caller; resolves when any of its hashes fires.
pub struct Pending<V> {
    id: u64,
    hashes: Vec<MessageHash>,
    rx: oneshot::Receiver<Outcome<V>>,
}

impl<V> Pending<V> {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn hashes(&self) -> &[MessageHash] {
        &self.hashes
    }

    /// Wait for the next event. A deadline only affects this caller.
    pub async fn wait(self, deadline: Option<Duration>) -> Result<V, StreamError> {
        let Pending { hashes, rx, .. } = self;
        match deadline {
            None => rx.await.unwrap_or(Err(StreamError::Closed)),
            Some(after) => match tokio::time::timeout(after, rx).await {
                Ok(received) => received.unwrap_or(Err(StreamError::Closed)),
                Err(_) => Err(StreamError::timeout(hashes.iter().join("|"), after)),
            },
        }
    }
}

pub struct PendingRequestRegistry<V> {
    waiters: AHashMap<MessageHash, SmallVec<[Waiter<V>; 2]>>,
    next_id: u64,
}

impl<V: Clone> Default for PendingRequestRegistry<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone> PendingRequestRegistry<V> {
    pub fn new() -> Self {
        Self { waiters: AHashMap::new(), next_id: 1 }
    }

    pub fn subscribe(&mut self, hash: MessageHash) -> Pending<V> {
        self.subscribe_many(std::slice::from_ref(&hash))
    }

    pub fn subscribe_many(&mut self, hashes: &[MessageHash]) -> Pending<V> {
        let (tx, rx) = oneshot::channel();
        let waiter = Waiter { id: self.next_id, created_at: Instant::now(), slot: Arc::new(Mutex::new(Some(tx))) };
        self.next_id += 1;

        let hashes: Vec<MessageHash> = hashes.iter().unique().cloned().collect();
        for hash in &hashes {
            let list = self.waiters.entry(hash.clone()).or_default();
            list.retain(|w| w.is_live());
            list.push(waiter.clone());
        }
        trace!(id = waiter.id, hashes = %hashes.iter().join(","), "Armed waiter");
        Pending { id: waiter.id, hashes, rx }
    }

    /// Deliver `value` to every live waiter on `hash`. Returns how many received it.
    pub fn resolve(&mut self, hash: &MessageHash, value: V) -> usize {
        let Some(list) = self.waiters.remove(hash) else {
            return 0;
        };
        list.iter().filter(|w| w.is_live() && w.complete(Ok(value.clone()))).count()
    }

    pub fn reject(&mut self, hash: &MessageHash, error: StreamError) -> usize {
        let Some(list) = self.waiters.remove(hash) else {
            return 0;
        };
        list.iter().filter(|w| w.complete(Err(error.clone()))).count()
    }

    pub fn reject_all(&mut self, error: StreamError) -> usize {
        self.waiters
            .drain()
            .flat_map(|(_, list)| list)
            .filter(|w| w.complete(Err(error.clone())))
            .count()
    }

    /// Reject only the waiters on `hash` that have been waiting longer than `max_age`.
    pub fn timeout(&mut self, hash: &MessageHash, max_age: Duration) -> usize {
        let Some(list) = self.waiters.get_mut(hash) else {
            return 0;
        };
        let now = Instant::now();
        let mut expired = 0;
        list.retain(|w| {
            if now.duration_since(w.created_at) < max_age {
                return true;
            }
            if w.complete(Err(StreamError::timeout(hash.as_str(), max_age))) {
                expired += 1;
            }
            false
        });
        if list.is_empty() {
            self.waiters.remove(hash);
        }
        expired
    }

    pub fn waiter_count(&self, hash: &MessageHash) -> usize {
        self.waiters.get(hash).map_or(0, |list| list.iter().filter(|w| w.is_live()).count())
    }

    pub fn is_pending(&self, hash: &MessageHash) -> bool {
        self.waiter_count(hash) > 0
    }

    pub fn pending_hashes(&self) -> impl Iterator<Item = &MessageHash> {
        self.waiters.iter().filter(|(_, list)| list.iter().any(|w| w.is_live())).map(|(h, _)| h)
    }
}
