use crate::store::SharedStore;
use std::{marker::PhantomData, sync::Arc};
use tenant_controller_core::LogRecord;
use tenant_controller_log::{Client, MessageId, Reader, TransportError};

/// Replays a topic into a store.
///
/// Each run opens a fresh reader at the earliest retained entry, so a restarted consumer replays
/// the topic's entire history. Applying an entry is idempotent, so replay converges on the same
/// view regardless of how many times an entry has already been applied.
///
/// The store is marked as synced once the consumer has applied the entry that was at the head of
/// the topic when its reader opened.
pub struct Consumer<C, R: LogRecord> {
    client: C,
    topic: Arc<str>,
    store: SharedStore<R::Document>,
    _record: PhantomData<fn() -> R>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConsumeError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("failed to decode entry {id} (key {key:?}): {source}")]
    Decode {
        id: MessageId,
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

// === impl Consumer ===

impl<C, R> Consumer<C, R>
where
    C: Client,
    R: LogRecord,
{
    pub fn new(client: C, topic: impl Into<Arc<str>>, store: SharedStore<R::Document>) -> Self {
        Self {
            client,
            topic: topic.into(),
            store,
            _record: PhantomData,
        }
    }

    /// Applies entries until the reader fails or an entry can't be decoded.
    ///
    /// This only returns on error: entries are never skipped, since skipping one would silently
    /// drop a state transition from the view.
    pub async fn run(self) -> Result<(), ConsumeError> {
        let mut reader = self.client.reader(&self.topic).await?;
        let head = reader.head();
        tracing::info!(topic = %self.topic, kind = self.store.kind(), ?head, "Replaying topic");
        if head.is_none() {
            self.store.mark_synced();
        }

        loop {
            let entry = reader.next().await?;
            let record = serde_json::from_slice::<R>(&entry.payload).map_err(|source| {
                ConsumeError::Decode {
                    id: entry.id,
                    key: entry.key.clone(),
                    source,
                }
            })?;
            let change = record.into_change();
            tracing::debug!(id = %entry.id, key = %change.key(), "Applying entry");
            self.store.apply(entry.id, change);
            if head.is_some_and(|head| entry.id >= head) {
                self.store.mark_synced();
            }
        }
    }
}

impl<C: Clone, R: LogRecord> Clone for Consumer<C, R> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            topic: self.topic.clone(),
            store: self.store.clone(),
            _record: PhantomData,
        }
    }
}
