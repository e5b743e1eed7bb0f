use crate::{Change, Document, LogRecord, Reconcile, Timestamp, ValidationError};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr, time::Duration};

/// Quota value meaning "no limit".
pub const UNLIMITED: i32 = -1;

/// Marks the first audit entry of a newly created plan.
pub const INITIAL_AUDIT: &str = "initial creation,";

/// Contributed to the audit trail when a plan is deleted.
pub const DELETED_AUDIT: &str = "deleted";

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TenantStatus {
    /// The zero value. Never a stored state: a merge replaces it with the existing status, or
    /// with `Activated` for a new plan.
    #[default]
    Unset,
    Activated,
    Deactivated,
    Suspended,
    Deleted,
}

/// The plan classes a tenant may subscribe to. Each class supplies the defaults for a newly
/// created plan.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum PlanType {
    Free,
    Starter,
    Production,
    Dedicated,
    Private,
}

/// Resource quotas and attributes granted by a plan.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PlanPolicy {
    pub name: String,
    pub num_of_topics: i32,
    pub num_of_namespaces: i32,
    pub message_hour_retention: i32,
    #[serde(with = "crate::duration::go")]
    pub message_retention: Duration,
    pub num_of_producers: i32,
    pub num_of_consumers: i32,
    pub functions: i32,
    pub feature_codes: String,
}

/// A tenant's subscription, as stored on the tenant topic.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TenantPlan {
    pub name: String,
    pub tenant_status: TenantStatus,
    pub org: String,
    pub users: String,
    pub plan_type: String,
    pub updated_at: Timestamp,
    pub policy: PlanPolicy,
    pub audit: String,
}

// === impl PlanType ===

impl PlanType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Starter => "starter",
            Self::Production => "production",
            Self::Dedicated => "dedicated",
            Self::Private => "private",
        }
    }

    /// Returns the policy a new plan of this class starts with.
    pub fn default_policy(&self) -> PlanPolicy {
        let (topics, namespaces, hours, producers, consumers, functions) = match self {
            Self::Free => (5, 1, 48, 3, 5, 1),
            Self::Starter => (50, 5, 7 * 24, 20, 50, 5),
            Self::Production => (500, 20, 14 * 24, 200, 500, 50),
            Self::Dedicated => (UNLIMITED, 100, 30 * 24, UNLIMITED, UNLIMITED, 200),
            Self::Private => (
                UNLIMITED, UNLIMITED, 30 * 24, UNLIMITED, UNLIMITED, UNLIMITED,
            ),
        };
        PlanPolicy {
            name: self.as_str().to_string(),
            num_of_topics: topics,
            num_of_namespaces: namespaces,
            message_hour_retention: hours,
            message_retention: retention_hours(hours),
            num_of_producers: producers,
            num_of_consumers: consumers,
            functions,
            feature_codes: String::new(),
        }
    }
}

impl FromStr for PlanType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "free" => Ok(Self::Free),
            "starter" => Ok(Self::Starter),
            "production" => Ok(Self::Production),
            "dedicated" => Ok(Self::Dedicated),
            "private" => Ok(Self::Private),
            _ => Err(ValidationError::UnknownPlan(s.to_string())),
        }
    }
}

impl fmt::Display for PlanType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Converts a quota in hours to a retention duration. Unlimited and unset quotas map to zero.
pub(crate) fn retention_hours(hours: i32) -> Duration {
    Duration::from_secs(u64::try_from(hours).unwrap_or(0) * 3600)
}

// === impl TenantPlan ===

impl Document for TenantPlan {
    fn key(&self) -> String {
        self.name.clone()
    }
}

impl LogRecord for TenantPlan {
    type Document = Self;

    fn into_change(self) -> Change<Self> {
        if self.tenant_status == TenantStatus::Deleted {
            Change::Tombstone(self.name)
        } else {
            Change::Upsert(self)
        }
    }
}

impl Reconcile for TenantPlan {
    fn reconcile(
        requested: Self,
        existing: Option<&Self>,
        now: Timestamp,
    ) -> Result<Self, ValidationError> {
        crate::reconcile_tenant_plan(requested, existing, now)
    }

    fn tombstone(existing: &Self) -> Self {
        Self {
            name: existing.name.clone(),
            plan_type: existing.plan_type.clone(),
            tenant_status: TenantStatus::Deleted,
            audit: DELETED_AUDIT.to_string(),
            ..Default::default()
        }
    }

    fn set_key(&mut self, key: &str) {
        self.name = key.to_string();
    }
}
