//! Minidirs: replicate a writer's local map to a changing set of readers.
//!
//! A `MinidirWriteManager` watches a local map and a directory of readers
//! (peer → `(entity, MinidirBcard)`). Every reader it knows about receives
//! a full snapshot of the local map whenever the map changes, and once when
//! the reader first appears. A `MinidirReadManager` merges the snapshots of
//! every writer into one map keyed by `(writer peer, key)`.
//!
//! Snapshots carry the writer's incarnation id and a sequence number so a
//! reader can discard anything older than what it already applied. A
//! writer that goes away cleanly sends an empty snapshot; one whose peer
//! departs the transport has its entries evicted by every reader.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use shardline_core::PeerId;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

use crate::mailbox::{Address, Mailbox, MailboxManager};

/// One writer's complete contribution to a reader.
#[derive(Debug, Clone)]
pub struct MinidirUpdate<K, V> {
    pub writer_peer: PeerId,
    pub writer_id: Uuid,
    pub seq: u64,
    pub entries: BTreeMap<K, V>,
}

/// How writers reach a reader.
#[derive(Serialize, Deserialize)]
#[serde(bound = "")]
pub struct MinidirBcard<K, V> {
    pub update_mailbox: Address<MinidirUpdate<K, V>>,
}

impl<K, V> Clone for MinidirBcard<K, V> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K, V> Copy for MinidirBcard<K, V> {}

impl<K, V> PartialEq for MinidirBcard<K, V> {
    fn eq(&self, other: &Self) -> bool {
        self.update_mailbox == other.update_mailbox
    }
}

impl<K, V> Eq for MinidirBcard<K, V> {}

impl<K, V> fmt::Debug for MinidirBcard<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MinidirBcard")
            .field("update_mailbox", &self.update_mailbox)
            .finish()
    }
}

/// Merged view of every writer's entries, keyed by `(writer peer, key)`.
pub type MinidirValues<K, V> = BTreeMap<(PeerId, K), V>;

// ── Reader ─────────────────────────────────────────────────────────

pub struct MinidirReadManager<K, V> {
    values: Arc<watch::Sender<MinidirValues<K, V>>>,
    mailbox: Mailbox<MinidirUpdate<K, V>>,
    evictor: JoinHandle<()>,
}

type WriterSeqs = Mutex<HashMap<PeerId, (Uuid, u64)>>;

impl<K, V> MinidirReadManager<K, V>
where
    K: Ord + Clone + Send + Sync + 'static,
    V: Clone + PartialEq + Send + Sync + 'static,
{
    pub fn new(manager: &MailboxManager) -> Self {
        let (tx, _rx) = watch::channel(BTreeMap::new());
        let values = Arc::new(tx);
        let writers: Arc<WriterSeqs> = Arc::default();

        let sink = Arc::clone(&values);
        let seqs = Arc::clone(&writers);
        let departed = manager.departed_peers();
        let mailbox = Mailbox::new_ordered(manager, move |_cancel, update: MinidirUpdate<K, V>| {
            // Updates still queued from a writer whose peer has died.
            if departed.borrow().contains(&update.writer_peer) {
                debug!(writer = %update.writer_peer, "ignoring update from departed writer");
            } else {
                apply_update(&sink, &seqs, update);
            }
            async {}
        });
        let evictor = tokio::spawn(evict_departed(
            manager.departed_peers(),
            Arc::clone(&values),
            writers,
        ));
        Self {
            values,
            mailbox,
            evictor,
        }
    }

    pub fn bcard(&self) -> MinidirBcard<K, V> {
        MinidirBcard {
            update_mailbox: self.mailbox.address(),
        }
    }

    pub fn values(&self) -> watch::Receiver<MinidirValues<K, V>> {
        self.values.subscribe()
    }

    pub fn snapshot(&self) -> MinidirValues<K, V> {
        self.values.borrow().clone()
    }
}

impl<K, V> Drop for MinidirReadManager<K, V> {
    fn drop(&mut self) {
        self.evictor.abort();
    }
}

/// Drop every entry written by a peer once that peer departs. A writer
/// that dies never sends its closing empty snapshot.
async fn evict_departed<K, V>(
    mut departed: watch::Receiver<BTreeSet<PeerId>>,
    values: Arc<watch::Sender<MinidirValues<K, V>>>,
    writers: Arc<WriterSeqs>,
) where
    K: Ord + Clone,
    V: Clone + PartialEq,
{
    loop {
        {
            let gone = departed.borrow_and_update();
            writers.lock().retain(|peer, _| !gone.contains(peer));
            let evicted = values.send_if_modified(|map| {
                let before = map.len();
                map.retain(|(peer, _), _| !gone.contains(peer));
                map.len() != before
            });
            if evicted {
                debug!(departed = gone.len(), "evicted entries of departed writers");
            }
        }
        if departed.changed().await.is_err() {
            break;
        }
    }
}

fn apply_update<K, V>(
    values: &watch::Sender<MinidirValues<K, V>>,
    writers: &WriterSeqs,
    update: MinidirUpdate<K, V>,
) where
    K: Ord + Clone,
    V: Clone + PartialEq,
{
    {
        let mut writers = writers.lock();
        if let Some((id, seq)) = writers.get(&update.writer_peer) {
            if *id == update.writer_id && *seq >= update.seq {
                debug!(writer = %update.writer_peer, seq = update.seq, "ignoring stale minidir update");
                return;
            }
        }
        writers.insert(update.writer_peer, (update.writer_id, update.seq));
    }

    let peer = update.writer_peer;
    values.send_if_modified(|map| {
        let current: BTreeMap<K, V> = map
            .iter()
            .filter(|((p, _), _)| *p == peer)
            .map(|((_, k), v)| (k.clone(), v.clone()))
            .collect();
        if current == update.entries {
            return false;
        }
        map.retain(|(p, _), _| *p != peer);
        for (k, v) in update.entries {
            map.insert((peer, k), v);
        }
        true
    });
}

// ── Writer ─────────────────────────────────────────────────────────

struct WriterState<K, V> {
    writer_id: Uuid,
    seq: u64,
    readers: BTreeMap<PeerId, MinidirBcard<K, V>>,
}

impl<K: Clone + Send + 'static, V: Clone + Send + 'static> WriterState<K, V> {
    fn snapshot(&mut self, manager: &MailboxManager, entries: BTreeMap<K, V>) -> MinidirUpdate<K, V> {
        self.seq += 1;
        MinidirUpdate {
            writer_peer: manager.peer(),
            writer_id: self.writer_id,
            seq: self.seq,
            entries,
        }
    }

    fn send_all(&mut self, manager: &MailboxManager, entries: BTreeMap<K, V>) {
        let update = self.snapshot(manager, entries);
        for bcard in self.readers.values() {
            manager.send(&bcard.update_mailbox, update.clone());
        }
    }
}

/// Pushes a local map to every reader listed in a directory.
pub struct MinidirWriteManager<K, V>
where
    K: Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    manager: MailboxManager,
    state: Arc<Mutex<WriterState<K, V>>>,
    task: JoinHandle<()>,
}

impl<K, V> MinidirWriteManager<K, V>
where
    K: Ord + Clone + Send + Sync + 'static,
    V: Clone + PartialEq + Send + Sync + 'static,
{
    pub fn new<E>(
        manager: &MailboxManager,
        mut values: watch::Receiver<BTreeMap<K, V>>,
        mut readers: watch::Receiver<BTreeMap<PeerId, (E, MinidirBcard<K, V>)>>,
    ) -> Self
    where
        E: Send + Sync + 'static,
    {
        let state = Arc::new(Mutex::new(WriterState {
            writer_id: Uuid::new_v4(),
            seq: 0,
            readers: BTreeMap::new(),
        }));

        let task_state = Arc::clone(&state);
        let task_manager = manager.clone();
        let task = tokio::spawn(async move {
            sync_readers(&task_manager, &task_state, &mut values, &mut readers);
            loop {
                tokio::select! {
                    changed = values.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let entries = values.borrow_and_update().clone();
                        task_state.lock().send_all(&task_manager, entries);
                    }
                    changed = readers.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        sync_readers(&task_manager, &task_state, &mut values, &mut readers);
                    }
                }
            }
        });

        Self {
            manager: manager.clone(),
            state,
            task,
        }
    }
}

/// Adopt the current reader set, sending a snapshot to readers that are
/// new or whose bcard changed.
fn sync_readers<K, V, E>(
    manager: &MailboxManager,
    state: &Mutex<WriterState<K, V>>,
    values: &mut watch::Receiver<BTreeMap<K, V>>,
    readers: &mut watch::Receiver<BTreeMap<PeerId, (E, MinidirBcard<K, V>)>>,
) where
    K: Ord + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    let current: BTreeMap<PeerId, MinidirBcard<K, V>> = readers
        .borrow_and_update()
        .iter()
        .map(|(peer, (_, bcard))| (*peer, *bcard))
        .collect();

    let mut state = state.lock();
    let fresh: Vec<MinidirBcard<K, V>> = current
        .iter()
        .filter(|(peer, bcard)| state.readers.get(*peer) != Some(*bcard))
        .map(|(_, bcard)| *bcard)
        .collect();
    state.readers = current;
    if fresh.is_empty() {
        return;
    }

    let entries = values.borrow().clone();
    let update = state.snapshot(manager, entries);
    for bcard in fresh {
        manager.send(&bcard.update_mailbox, update.clone());
    }
}

impl<K, V> Drop for MinidirWriteManager<K, V>
where
    K: Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    fn drop(&mut self) {
        self.task.abort();
        let mut state = self.state.lock();
        state.seq += 1;
        let update = MinidirUpdate {
            writer_peer: self.manager.peer(),
            writer_id: state.writer_id,
            seq: state.seq,
            entries: BTreeMap::new(),
        };
        for bcard in state.readers.values() {
            self.manager.send(&bcard.update_mailbox, update.clone());
        }
    }
}
