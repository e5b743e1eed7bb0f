//! Document model for the tenant controller.
//!
//! Every document class materialized by the controller is described by two traits:
//!
//! - [`Document`] is the value held in a materialized store, addressed by a stable natural key.
//! - [`LogRecord`] is the shape of an entry on the class's topic. Decoding an entry yields a
//!   [`Change`]: either an upsert of a document or a tombstone for a key.
//!
//! Classes that accept writes additionally implement [`Reconcile`], which merges a requested
//! document against the currently stored one.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod duration;
pub mod function;
mod reconcile;
pub mod tenant;

pub use self::{
    function::{FunctionEvent, FunctionMeta},
    reconcile::reconcile_tenant_plan,
    tenant::{PlanPolicy, PlanType, TenantPlan, TenantStatus},
};
use chrono::{offset::Utc, DateTime};
use serde::{de::DeserializeOwned, Serialize};

pub type Timestamp = DateTime<Utc>;

/// A document held in a materialized store.
pub trait Document: Clone + std::fmt::Debug + Send + Sync + 'static {
    /// Returns the natural key under which the document is stored.
    ///
    /// The key must be stable for the lifetime of the document.
    fn key(&self) -> String;
}

/// A change to a materialized store, decoded from a single log entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Change<D> {
    Upsert(D),
    Tombstone(String),
}

/// An entry on a document class's topic.
pub trait LogRecord: DeserializeOwned + Send + 'static {
    type Document: Document;

    fn into_change(self) -> Change<Self::Document>;
}

/// A document class that accepts writes.
pub trait Reconcile: Document + Serialize {
    /// Merges `requested` over `existing`, producing the next version of the document.
    ///
    /// `existing` is `None` when no document is stored under the key.
    fn reconcile(
        requested: Self,
        existing: Option<&Self>,
        now: Timestamp,
    ) -> Result<Self, ValidationError>;

    /// Builds the request that removes `existing` from the materialized view.
    fn tombstone(existing: &Self) -> Self;

    /// Forces the document's key. Writers use this so that a request body can't
    /// address a different document than the one named by the caller.
    fn set_key(&mut self, key: &str);
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("a valid plan type is missing: {0:?}")]
    UnknownPlan(String),

    #[error("a document name is required")]
    MissingName,

    #[error("message retention of {0} hours is out of range")]
    RetentionOutOfRange(i32),
}

impl<D: Document> Change<D> {
    pub fn key(&self) -> String {
        match self {
            Self::Upsert(doc) => doc.key(),
            Self::Tombstone(key) => key.clone(),
        }
    }
}
