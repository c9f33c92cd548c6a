//! Quota ceilings and plan visibility.
//!
//! Space and organization ceilings are maintained independently; a creation
//! must fit under both. The space is checked first when it has its own
//! quota, so a rejection names the narrowest scope that failed.

use tracing::debug;

use keel_core::{QuotaDefinition, ServicePlan, ServicePlanVisibility};

use crate::error::{AdmissionError, AdmissionResult, QuotaScope};

/// A quota definition paired with the current count it governs.
#[derive(Debug, Clone, Copy)]
pub struct ScopeUsage<'a> {
    pub quota: &'a QuotaDefinition,
    pub current: usize,
}

impl<'a> ScopeUsage<'a> {
    pub fn new(quota: &'a QuotaDefinition, current: usize) -> Self {
        Self { quota, current }
    }
}

/// Space first (when it has a quota), then the organization.
fn scopes<'a>(
    space: Option<ScopeUsage<'a>>,
    org: ScopeUsage<'a>,
) -> impl Iterator<Item = (QuotaScope, ScopeUsage<'a>)> {
    space
        .map(|usage| (QuotaScope::Space, usage))
        .into_iter()
        .chain(std::iter::once((QuotaScope::Organization, org)))
}

/// Room for one more route in the space (if it has a quota) and the org.
pub fn check_route_quota(space: Option<ScopeUsage<'_>>, org: ScopeUsage<'_>) -> AdmissionResult<()> {
    for (scope, usage) in scopes(space, org) {
        if !usage.quota.allows_routes(usage.current, 1) {
            debug!(%scope, quota = %usage.quota.name, current = usage.current, "route quota exceeded");
            return Err(AdmissionError::RouteQuotaExceeded {
                scope,
                quota: usage.quota.name.clone(),
            });
        }
    }
    Ok(())
}

/// Room for one more instance of `plan` in the space and the org.
///
/// Per scope, a quota that does not allow non-basic services rejects any
/// plan that is not free, and a full service count is reported as a free-
/// tier or paid-tier exhaustion depending on the same flag.
pub fn check_service_quota(
    plan: &ServicePlan,
    space: Option<ScopeUsage<'_>>,
    org: ScopeUsage<'_>,
) -> AdmissionResult<()> {
    for (scope, usage) in scopes(space, org) {
        let quota = usage.quota;

        if !quota.allows_services(usage.current, 1) {
            debug!(%scope, quota = %quota.name, current = usage.current, "service quota exceeded");
            return Err(if quota.non_basic_services_allowed {
                AdmissionError::ServiceQuotaExceeded {
                    scope,
                    quota: quota.name.clone(),
                }
            } else {
                AdmissionError::FreeServiceQuotaExceeded {
                    scope,
                    quota: quota.name.clone(),
                }
            });
        }

        if !plan.free && !quota.non_basic_services_allowed {
            return Err(AdmissionError::PaidServicesNotAllowed {
                scope,
                quota: quota.name.clone(),
                plan: plan.name.clone(),
            });
        }
    }
    Ok(())
}

/// Room for `additional_mb` more running memory in the space and the org.
///
/// `current` in each usage is the running memory of the scope's other
/// workloads, in MB.
pub fn check_memory_quota(
    space: Option<ScopeUsage<'_>>,
    org: ScopeUsage<'_>,
    additional_mb: usize,
) -> AdmissionResult<()> {
    for (scope, usage) in scopes(space, org) {
        if !usage.quota.allows_memory(usage.current, additional_mb) {
            debug!(
                %scope,
                quota = %usage.quota.name,
                used_mb = usage.current,
                additional_mb,
                limit_mb = usage.quota.memory_limit_mb,
                "memory quota exceeded"
            );
            return Err(AdmissionError::MemoryQuotaExceeded {
                scope,
                quota: usage.quota.name.clone(),
            });
        }
    }
    Ok(())
}

/// A non-public plan needs an explicit grant for the organization.
pub fn check_plan_visibility(
    plan: &ServicePlan,
    organization_id: &str,
    grants: &[ServicePlanVisibility],
) -> AdmissionResult<()> {
    if plan.public {
        return Ok(());
    }
    let granted = grants
        .iter()
        .any(|g| g.plan_id == plan.id && g.organization_id == organization_id);
    if granted {
        Ok(())
    } else {
        Err(AdmissionError::PlanNotVisible {
            plan: plan.name.clone(),
            organization: organization_id.to_string(),
        })
    }
}
