use crate::{
    duration,
    tenant::{retention_hours, PlanPolicy, PlanType, TenantPlan, TenantStatus, INITIAL_AUDIT},
    Timestamp, ValidationError,
};

/// Merges a requested tenant plan over the existing plan stored under the same name.
///
/// When there is no existing plan the request is a creation: every quota and attribute left unset
/// takes the plan class's default, an empty audit trail is initialized, and the status defaults to
/// `Activated`.
///
/// Otherwise the request is an update. Numeric quotas and string attributes are taken from the
/// request when set (non-zero, non-empty) and inherited otherwise, so an update cannot reset a
/// quota to zero. The audit trail is extended rather than replaced.
///
/// `updated_at` is always stamped with `now`.
pub fn reconcile_tenant_plan(
    mut requested: TenantPlan,
    existing: Option<&TenantPlan>,
    now: Timestamp,
) -> Result<TenantPlan, ValidationError> {
    let plan_type = requested.plan_type.parse::<PlanType>()?;
    if requested.name.is_empty() {
        return Err(ValidationError::MissingName);
    }
    requested.updated_at = now;

    let existing = match existing {
        Some(existing) => existing,
        None => {
            if requested.audit.is_empty() {
                requested.audit = INITIAL_AUDIT.to_string();
            }
            requested.policy = inherit_policy(requested.policy, &plan_type.default_policy())?;
            requested.tenant_status = take_status(requested.tenant_status, TenantStatus::Activated);
            return Ok(requested);
        }
    };

    requested.policy = inherit_policy(requested.policy, &existing.policy)?;
    requested.tenant_status = take_status(requested.tenant_status, existing.tenant_status);
    requested.org = take_non_empty(requested.org, &existing.org);
    requested.users = take_non_empty(requested.users, &existing.users);
    requested.audit = format!("{},{}", existing.audit, requested.audit);
    Ok(requested)
}

fn inherit_policy(
    requested: PlanPolicy,
    base: &PlanPolicy,
) -> Result<PlanPolicy, ValidationError> {
    let message_hour_retention =
        take_non_zero(requested.message_hour_retention, base.message_hour_retention);
    // The derived retention must fit in a Go duration to be written to the topic.
    if retention_hours(message_hour_retention) > duration::MAX {
        return Err(ValidationError::RetentionOutOfRange(message_hour_retention));
    }
    Ok(PlanPolicy {
        name: take_non_empty(requested.name, &base.name),
        num_of_topics: take_non_zero(requested.num_of_topics, base.num_of_topics),
        num_of_namespaces: take_non_zero(requested.num_of_namespaces, base.num_of_namespaces),
        message_hour_retention,
        message_retention: retention_hours(message_hour_retention),
        num_of_producers: take_non_zero(requested.num_of_producers, base.num_of_producers),
        num_of_consumers: take_non_zero(requested.num_of_consumers, base.num_of_consumers),
        functions: take_non_zero(requested.functions, base.functions),
        feature_codes: take_non_empty(requested.feature_codes, &base.feature_codes),
    })
}

fn take_non_zero(requested: i32, base: i32) -> i32 {
    if requested == 0 {
        base
    } else {
        requested
    }
}

fn take_non_empty(requested: String, base: &str) -> String {
    if requested.is_empty() {
        base.to_string()
    } else {
        requested
    }
}

fn take_status(requested: TenantStatus, base: TenantStatus) -> TenantStatus {
    if requested == TenantStatus::Unset {
        base
    } else {
        requested
    }
}
