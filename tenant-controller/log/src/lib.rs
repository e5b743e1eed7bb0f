//! The broker interface consumed by the tenant controller.
//!
//! A topic is an append-only, replayable sequence of keyed entries. The controller only ever
//! needs two operations against it: reading a topic from its earliest retained entry, and
//! appending an entry with acknowledgement. Connection management, authentication and the wire
//! protocol are the concern of the [`Client`] implementation.
//!
//! [`memory::Broker`] is an in-process implementation used by tests and standalone deployments.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod memory;

use bytes::Bytes;
use std::fmt;

/// The position of an entry within its topic.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MessageId(pub u64);

/// An entry read from a topic.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    pub id: MessageId,
    pub key: String,
    pub payload: Bytes,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    #[error("reader for {topic} disconnected")]
    Disconnected { topic: String },

    #[error("topic {topic} closed")]
    Closed { topic: String },

    #[error("broker rejected the entry: {0}")]
    Rejected(String),
}

/// A handle to the broker from which readers and producers are created.
#[async_trait::async_trait]
pub trait Client: Clone + Send + Sync + 'static {
    type Reader: Reader;
    type Producer: Producer;

    /// Opens a reader positioned at the earliest retained entry of `topic`.
    async fn reader(&self, topic: &str) -> Result<Self::Reader, TransportError>;

    /// Opens a producer for `topic`. Sends are not batched.
    async fn producer(&self, topic: &str) -> Result<Self::Producer, TransportError>;
}

#[async_trait::async_trait]
pub trait Reader: Send + 'static {
    /// Returns the id of the last entry on the topic when the reader was opened, or `None` if the
    /// topic was empty.
    fn head(&self) -> Option<MessageId>;

    /// Waits for the next entry.
    ///
    /// Errors are terminal: once `next` fails the reader must be dropped and a new one opened.
    async fn next(&mut self) -> Result<Entry, TransportError>;
}

#[async_trait::async_trait]
pub trait Producer: Send + Sync + 'static {
    /// Appends an entry, returning once the broker has acknowledged it.
    async fn send(&self, key: &str, payload: Bytes) -> Result<MessageId, TransportError>;
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
