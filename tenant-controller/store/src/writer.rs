use crate::store::SharedStore;
use ahash::RandomState;
use chrono::offset::Utc;
use tenant_controller_core::{Reconcile, ValidationError};
use tenant_controller_log::{MessageId, Producer, TransportError};
use tokio::{sync::Mutex, time};

/// Writes documents to a class's topic and eagerly applies them to its store.
///
/// A write is applied to the store only once the broker has acknowledged it, and it is applied
/// before `write` returns, so the writer always observes its own writes even before the
/// consumer has replayed them. The consumer's later replay of the same entry is a no-op in
/// effect, and an acknowledgement that arrives after a later entry for the same key has been
/// applied does not roll the store back.
///
/// Writes to the same key are serialized from the read of the current version through the
/// update of the store, so each one reconciles against the version its predecessor produced.
pub struct Writer<P, D> {
    producer: P,
    store: SharedStore<D>,
    timeout: time::Duration,
    locks: KeyLocks,
}

/// A fixed set of locks that keys hash onto.
struct KeyLocks {
    hasher: RandomState,
    stripes: Box<[Mutex<()>]>,
}

#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("{0} not found")]
    NotFound(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("write was not acknowledged within {0:?}")]
    Timeout(time::Duration),

    #[error("failed to encode document: {0}")]
    Encode(#[from] serde_json::Error),
}

// === impl Writer ===

impl<P, D> Writer<P, D>
where
    P: Producer,
    D: Reconcile,
{
    pub fn new(producer: P, store: SharedStore<D>, timeout: time::Duration) -> Self {
        Self {
            producer,
            store,
            timeout,
            locks: KeyLocks::new(64),
        }
    }

    pub fn store(&self) -> &SharedStore<D> {
        &self.store
    }

    /// Creates or updates the document stored under `key`.
    ///
    /// Returns the document as reconciled against the current version.
    pub async fn write(&self, key: &str, requested: D) -> Result<D, WriteError> {
        let res = self.upsert(key, requested).await;
        self.record(key, &res);
        res
    }

    /// Removes the document stored under `key`, returning the tombstone that was appended.
    pub async fn delete(&self, key: &str) -> Result<D, WriteError> {
        let res = self.remove(key).await;
        self.record(key, &res);
        res
    }

    async fn upsert(&self, key: &str, mut requested: D) -> Result<D, WriteError> {
        requested.set_key(key);
        let _lock = self.locks.lock(key).await;
        let existing = self.store.get(key);
        let doc = D::reconcile(requested, existing.as_ref(), Utc::now())?;

        let id = self.append(&doc).await?;
        tracing::info!(kind = self.store.kind(), %key, %id, "Appended document");
        self.store.set(id, doc.clone());
        Ok(doc)
    }

    async fn remove(&self, key: &str) -> Result<D, WriteError> {
        let _lock = self.locks.lock(key).await;
        let existing = self
            .store
            .get(key)
            .ok_or_else(|| WriteError::NotFound(key.to_string()))?;
        let tombstone = D::reconcile(D::tombstone(&existing), Some(&existing), Utc::now())?;

        let id = self.append(&tombstone).await?;
        tracing::info!(kind = self.store.kind(), %key, %id, "Appended tombstone");
        self.store.delete(id, key);
        Ok(tombstone)
    }

    async fn append(&self, doc: &D) -> Result<MessageId, WriteError> {
        let payload = serde_json::to_vec(doc)?;
        let key = doc.key();
        let send = self.producer.send(&key, payload.into());
        match time::timeout(self.timeout, send).await {
            Ok(res) => Ok(res?),
            Err(_) => Err(WriteError::Timeout(self.timeout)),
        }
    }

    fn record(&self, key: &str, res: &Result<D, WriteError>) {
        let metrics = self.store.metrics();
        match res {
            Ok(_) => metrics.writes.inc(),
            Err(error) => {
                tracing::warn!(kind = self.store.kind(), %key, %error, "Write failed");
                metrics.write_failures.inc()
            }
        };
    }
}

// === impl KeyLocks ===

impl KeyLocks {
    fn new(stripes: usize) -> Self {
        Self {
            hasher: RandomState::new(),
            stripes: (0..stripes).map(|_| Mutex::new(())).collect(),
        }
    }

    async fn lock(&self, key: &str) -> tokio::sync::MutexGuard<'_, ()> {
        let stripe = self.hasher.hash_one(key) as usize % self.stripes.len();
        self.stripes[stripe].lock().await
    }
}
