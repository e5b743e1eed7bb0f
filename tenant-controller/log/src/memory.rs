//! An in-process broker.
//!
//! Topics live for the lifetime of the [`Broker`] and are never compacted. Failures can be
//! injected to exercise reader and producer error paths.

use crate::{Client, Entry, MessageId, Producer, Reader, TransportError};
use ahash::AHashMap as HashMap;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::watch;

#[derive(Clone, Debug, Default)]
pub struct Broker(Arc<Inner>);

#[derive(Debug, Default)]
struct Inner {
    topics: RwLock<HashMap<String, Arc<Topic>>>,
    unavailable: AtomicBool,
    reject_sends: AtomicBool,
    send_latency: Mutex<Duration>,
}

#[derive(Debug)]
struct Topic {
    name: String,
    entries: RwLock<Vec<Entry>>,

    /// Published on every append and disconnect so that blocked readers wake up.
    state: watch::Sender<TopicState>,
}

#[derive(Copy, Clone, Debug, Default)]
struct TopicState {
    len: usize,

    /// Readers opened in an earlier epoch are disconnected.
    epoch: u64,
}

#[derive(Debug)]
pub struct MemoryReader {
    topic: Arc<Topic>,
    rx: watch::Receiver<TopicState>,
    epoch: u64,
    offset: usize,
    head: Option<MessageId>,
}

#[derive(Clone, Debug)]
pub struct MemoryProducer {
    broker: Broker,
    topic: Arc<Topic>,
}

// === impl Broker ===

impl Broker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an entry directly, as another instance's producer would.
    pub fn append(&self, topic: &str, key: &str, payload: impl Into<Bytes>) -> MessageId {
        self.topic(topic).append(key, payload.into())
    }

    /// Returns a snapshot of every entry on `topic`.
    pub fn entries(&self, topic: &str) -> Vec<Entry> {
        self.topic(topic).entries.read().clone()
    }

    /// Fails all readers currently open on `topic`, as a dropped connection would.
    pub fn disconnect_readers(&self, topic: &str) {
        self.topic(topic).disconnect();
    }

    /// Marks the broker as reachable or not. While unavailable, opening readers or producers and
    /// sending fail, and every open reader is disconnected.
    pub fn set_available(&self, available: bool) {
        self.0.unavailable.store(!available, Ordering::SeqCst);
        if !available {
            for topic in self.0.topics.read().values() {
                topic.disconnect();
            }
        }
    }

    /// Makes the broker refuse to acknowledge sends.
    pub fn reject_sends(&self, reject: bool) {
        self.0.reject_sends.store(reject, Ordering::SeqCst);
    }

    /// Delays every acknowledgement by `latency`.
    pub fn set_send_latency(&self, latency: Duration) {
        *self.0.send_latency.lock() = latency;
    }

    fn check_available(&self) -> Result<(), TransportError> {
        if self.0.unavailable.load(Ordering::SeqCst) {
            return Err(TransportError::Unavailable("memory broker is down".to_string()));
        }
        Ok(())
    }

    fn topic(&self, name: &str) -> Arc<Topic> {
        if let Some(topic) = self.0.topics.read().get(name) {
            return topic.clone();
        }
        self.0
            .topics
            .write()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Topic::new(name)))
            .clone()
    }
}

#[async_trait::async_trait]
impl Client for Broker {
    type Reader = MemoryReader;
    type Producer = MemoryProducer;

    async fn reader(&self, topic: &str) -> Result<MemoryReader, TransportError> {
        self.check_available()?;
        let topic = self.topic(topic);
        let rx = topic.state.subscribe();
        let TopicState { len, epoch } = *rx.borrow();
        let head = len.checked_sub(1).map(|last| MessageId(last as u64));
        tracing::debug!(topic = %topic.name, epoch, ?head, "Opened reader");
        Ok(MemoryReader {
            topic,
            rx,
            epoch,
            offset: 0,
            head,
        })
    }

    async fn producer(&self, topic: &str) -> Result<MemoryProducer, TransportError> {
        self.check_available()?;
        Ok(MemoryProducer {
            broker: self.clone(),
            topic: self.topic(topic),
        })
    }
}

// === impl Topic ===

impl Topic {
    fn new(name: &str) -> Self {
        let (state, _) = watch::channel(TopicState::default());
        Self {
            name: name.to_string(),
            entries: RwLock::new(Vec::new()),
            state,
        }
    }

    fn append(&self, key: &str, payload: Bytes) -> MessageId {
        let (id, len) = {
            let mut entries = self.entries.write();
            let id = MessageId(entries.len() as u64);
            entries.push(Entry {
                id,
                key: key.to_string(),
                payload,
            });
            (id, entries.len())
        };
        self.state.send_modify(|state| state.len = len);
        id
    }

    fn disconnect(&self) {
        self.state.send_modify(|state| state.epoch += 1);
    }
}

// === impl MemoryReader ===

#[async_trait::async_trait]
impl Reader for MemoryReader {
    fn head(&self) -> Option<MessageId> {
        self.head
    }

    async fn next(&mut self) -> Result<Entry, TransportError> {
        loop {
            // Marking the state as seen before inspecting the entries ensures an append racing
            // with this check still wakes the `changed` below.
            let state = *self.rx.borrow_and_update();
            if state.epoch != self.epoch {
                return Err(TransportError::Disconnected {
                    topic: self.topic.name.clone(),
                });
            }

            if self.offset < state.len {
                let entry = self.topic.entries.read()[self.offset].clone();
                self.offset += 1;
                return Ok(entry);
            }

            if self.rx.changed().await.is_err() {
                return Err(TransportError::Closed {
                    topic: self.topic.name.clone(),
                });
            }
        }
    }
}

// === impl MemoryProducer ===

#[async_trait::async_trait]
impl Producer for MemoryProducer {
    async fn send(&self, key: &str, payload: Bytes) -> Result<MessageId, TransportError> {
        let latency = *self.broker.0.send_latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        self.broker.check_available()?;
        if self.broker.0.reject_sends.load(Ordering::SeqCst) {
            return Err(TransportError::Rejected(format!(
                "{} refuses writes",
                self.topic.name
            )));
        }
        Ok(self.topic.append(key, payload))
    }
}
