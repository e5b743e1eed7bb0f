use crate::metrics::KindMetrics;
use ahash::AHashMap as HashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use tenant_controller_core::{Change, Document};
use tenant_controller_log::MessageId;
use tokio::sync::watch;

pub type SharedStore<D> = Arc<Store<D>>;

/// The materialized view of a document class: the latest version of every live document, by key.
///
/// The store is updated by its log consumer and, eagerly, by its writer. Every update carries the
/// id of the log entry it came from, and an update older than the entry last applied under the
/// same key is discarded. The view therefore only moves forward through the log, whichever of the
/// consumer and the writer gets to a key first.
///
/// Reads return clones so that no caller holds a reference into the map.
#[derive(Debug)]
pub struct Store<D> {
    kind: &'static str,
    docs: RwLock<Docs<D>>,
    synced: watch::Sender<bool>,
    metrics: KindMetrics,
}

#[derive(Debug)]
struct Docs<D> {
    live: HashMap<String, D>,

    /// The id of the latest entry applied under each key, tombstones included.
    applied: HashMap<String, MessageId>,
}

// === impl Store ===

impl<D: Document> Store<D> {
    pub fn new(kind: &'static str, metrics: KindMetrics) -> Self {
        let (synced, _) = watch::channel(false);
        Self {
            kind,
            docs: RwLock::new(Docs {
                live: HashMap::default(),
                applied: HashMap::default(),
            }),
            synced,
            metrics,
        }
    }

    pub fn shared(kind: &'static str, metrics: KindMetrics) -> SharedStore<D> {
        Arc::new(Self::new(kind, metrics))
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub fn metrics(&self) -> &KindMetrics {
        &self.metrics
    }

    /// Returns the document stored under `key`, if any.
    pub fn get(&self, key: &str) -> Option<D> {
        self.docs.read().live.get(key).cloned()
    }

    /// Stores `doc`, read from entry `id`, under its key.
    ///
    /// Returns false if a later entry has already been applied under the key.
    pub fn set(&self, id: MessageId, doc: D) -> bool {
        let key = doc.key();
        let size = {
            let mut docs = self.docs.write();
            if !docs.advance(&key, id) {
                drop(docs);
                self.stale(id, &key);
                return false;
            }
            docs.live.insert(key, doc);
            docs.live.len()
        };
        self.metrics.applies.inc();
        self.metrics.size.set(size as i64);
        true
    }

    /// Removes the document stored under `key`, as of the tombstone at entry `id`.
    ///
    /// Returns false if a later entry has already been applied under the key.
    pub fn delete(&self, id: MessageId, key: &str) -> bool {
        let (removed, size) = {
            let mut docs = self.docs.write();
            if !docs.advance(key, id) {
                drop(docs);
                self.stale(id, key);
                return false;
            }
            let removed = docs.live.remove(key).is_some();
            (removed, docs.live.len())
        };
        if !removed {
            tracing::debug!(kind = self.kind, %key, %id, "Tombstone for unknown key");
        }
        self.metrics.deletes.inc();
        self.metrics.size.set(size as i64);
        true
    }

    pub fn apply(&self, id: MessageId, change: Change<D>) -> bool {
        match change {
            Change::Upsert(doc) => self.set(id, doc),
            Change::Tombstone(key) => self.delete(id, &key),
        }
    }

    /// Returns a snapshot of every document in the store, in no particular order.
    pub fn list(&self) -> Vec<D> {
        self.docs.read().live.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.docs.read().live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.read().live.is_empty()
    }

    /// Watches whether the store has caught up with its topic.
    ///
    /// This becomes true once a consumer has applied every entry that was on the topic when it
    /// opened its reader, and stays true.
    pub fn synced(&self) -> watch::Receiver<bool> {
        self.synced.subscribe()
    }

    pub(crate) fn mark_synced(&self) {
        if self.synced.send_if_modified(|synced| !std::mem::replace(synced, true)) {
            tracing::info!(kind = self.kind, size = self.len(), "Caught up with the log");
        }
    }

    fn stale(&self, id: MessageId, key: &str) {
        tracing::debug!(kind = self.kind, %key, %id, "Skipped entry older than the applied version");
        self.metrics.stale.inc();
    }
}

// === impl Docs ===

impl<D> Docs<D> {
    /// Records `id` as the latest entry applied under `key`, unless a later one already was.
    fn advance(&mut self, key: &str, id: MessageId) -> bool {
        match self.applied.get_mut(key) {
            Some(applied) if *applied > id => false,
            Some(applied) => {
                *applied = id;
                true
            }
            None => {
                self.applied.insert(key.to_string(), id);
                true
            }
        }
    }
}
