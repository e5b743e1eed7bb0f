//! Log-backed materialized stores.
//!
//! A topic is the system of record for a document class; a [`Store`] holds the class's
//! materialized view in memory. The view is kept current by a [`Consumer`] that replays the
//! topic from its earliest entry, and the consumer is kept alive by a [`Watchdog`] that
//! relaunches it whenever it fails:
//!
//! ```text
//!               +--------+  append   +-------+  replay   +----------+
//! requests ---> | Writer | --------> | topic | --------> | Consumer |
//!               +--------+           +-------+           +----------+
//!                   |                                         |
//!                   | set / delete                            | apply
//!                   v                                         v
//!               +-----------------------------------------------+
//!               |                     Store                     | <--- reads
//!               +-----------------------------------------------+
//! ```
//!
//! Writers update the store eagerly once an append is acknowledged, so a writer reads its own
//! writes immediately. Writes made by other instances reach the store through the consumer.
//! Both paths tag each update with the entry's position in the topic, and the store keeps the
//! latest position per key, so the view converges on the last append whichever path lands first.
//!
//! Recovery relies on full replay rather than a stored cursor: every consumer run starts from
//! the earliest entry, and applying an entry is idempotent.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod consumer;
pub mod metrics;
mod store;
mod watchdog;
mod writer;

#[cfg(test)]
mod tests;

pub use self::{
    consumer::{ConsumeError, Consumer},
    metrics::{KindMetrics, Metrics},
    store::{SharedStore, Store},
    watchdog::{Backoff, State, Watchdog},
    writer::{WriteError, Writer},
};
