//! Watchable key→value directories.
//!
//! A `Directory` is a map published through a `tokio::sync::watch`
//! channel. Writers go through `set_key` / `delete_key`, which only notify
//! watchers when the stored value actually changes. Readers either take a
//! snapshot, watch the whole map, or follow a `DirectorySubscription` that
//! turns successive snapshots into per-key change events.

use std::collections::{BTreeMap, VecDeque};

use tokio::sync::watch;

/// A map whose changes can be observed.
#[derive(Debug)]
pub struct Directory<K, V> {
    tx: watch::Sender<BTreeMap<K, V>>,
}

impl<K, V> Default for Directory<K, V>
where
    K: Ord + Clone,
    V: Clone + PartialEq,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Directory<K, V>
where
    K: Ord + Clone,
    V: Clone + PartialEq,
{
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(BTreeMap::new());
        Self { tx }
    }

    /// Insert or replace `key`. Returns true if watchers were notified.
    pub fn set_key(&self, key: K, value: V) -> bool {
        self.tx.send_if_modified(|map| {
            if map.get(&key) == Some(&value) {
                false
            } else {
                map.insert(key, value);
                true
            }
        })
    }

    /// Remove `key`. Returns true if it was present.
    pub fn delete_key(&self, key: &K) -> bool {
        self.tx.send_if_modified(|map| map.remove(key).is_some())
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.tx.borrow().get(key).cloned()
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.tx.borrow().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.tx.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> BTreeMap<K, V> {
        self.tx.borrow().clone()
    }

    /// Receiver that sees the whole map on every change.
    pub fn watch(&self) -> watch::Receiver<BTreeMap<K, V>> {
        self.tx.subscribe()
    }

    /// Per-key change stream, starting with every key currently present.
    pub fn subscribe(&self) -> DirectorySubscription<K, V> {
        DirectorySubscription::new(self.tx.subscribe())
    }
}

/// Turns a watched map into an ordered stream of `(key, Option<value>)`
/// changes.
///
/// The first call to `next` reports every key present at subscription
/// time; after that only differences are reported. The snapshot read and
/// the "seen" mark happen together, so no update between the initial read
/// and the next change is lost. Intermediate states that a key passes
/// through between two polls may be coalesced; the final state never is.
pub struct DirectorySubscription<K, V> {
    rx: watch::Receiver<BTreeMap<K, V>>,
    seen: BTreeMap<K, V>,
    pending: VecDeque<(K, Option<V>)>,
    primed: bool,
}

impl<K, V> DirectorySubscription<K, V>
where
    K: Ord + Clone,
    V: Clone + PartialEq,
{
    pub fn new(rx: watch::Receiver<BTreeMap<K, V>>) -> Self {
        Self {
            rx,
            seen: BTreeMap::new(),
            pending: VecDeque::new(),
            primed: false,
        }
    }

    /// Next change, or `None` once the directory has been dropped.
    pub async fn next(&mut self) -> Option<(K, Option<V>)> {
        loop {
            if let Some(change) = self.pending.pop_front() {
                return Some(change);
            }
            if self.primed {
                if self.rx.changed().await.is_err() {
                    return None;
                }
            } else {
                self.primed = true;
            }
            let current = self.rx.borrow_and_update().clone();
            self.diff(current);
        }
    }

    fn diff(&mut self, current: BTreeMap<K, V>) {
        for (key, value) in &current {
            if self.seen.get(key) != Some(value) {
                self.pending.push_back((key.clone(), Some(value.clone())));
            }
        }
        for key in self.seen.keys() {
            if !current.contains_key(key) {
                self.pending.push_back((key.clone(), None));
            }
        }
        self.seen = current;
    }
}
