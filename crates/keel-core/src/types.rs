//! Shared domain types used across Keel crates.
//!
//! These are the records the reconciliation core reads and the admission
//! layer guards. All are JSON-serializable for storage in redb tables.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stable identifier of a workload (app).
pub type AppId = String;

pub type OrgId = String;

pub type SpaceId = String;

pub type DomainId = String;

pub type QuotaId = String;

pub type PlanId = String;

// ── Workloads ─────────────────────────────────────────────────────

/// Desired lifecycle state of a workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleState {
    Stopped,
    Started,
}

/// The authoritative desired-state record for a workload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppRecord {
    pub id: AppId,
    pub name: String,
    pub space_id: SpaceId,
    /// Opaque token regenerated on every desired-state-affecting update.
    pub version: String,
    pub last_updated: DateTime<Utc>,
    pub desired_instances: u32,
    pub lifecycle_state: LifecycleState,
    pub memory_mb: u32,
    /// Hash of the build artifact the fleet should run, once staged.
    pub droplet_hash: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl AppRecord {
    pub fn is_started(&self) -> bool {
        self.lifecycle_state == LifecycleState::Started
    }

    pub fn is_stopped(&self) -> bool {
        self.lifecycle_state == LifecycleState::Stopped
    }

    /// Memory the fleet holds for this workload: every desired instance while
    /// STARTED, nothing otherwise.
    pub fn running_memory_mb(&self) -> usize {
        if self.is_started() {
            self.memory_mb as usize * self.desired_instances as usize
        } else {
            0
        }
    }

    /// Whether moving from `self` to `next` changes what the fleet runs,
    /// and therefore requires a fresh version token.
    pub fn version_affecting_change(&self, next: &AppRecord) -> bool {
        self.desired_instances != next.desired_instances
            || self.lifecycle_state != next.lifecycle_state
            || self.memory_mb != next.memory_mb
            || self.droplet_hash != next.droplet_hash
    }
}

/// Audit record written alongside desired-state mutations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppEvent {
    pub id: String,
    pub app_id: AppId,
    pub actor: String,
    /// Event kind, e.g. "app.update" or "app.map_droplet".
    pub kind: String,
    pub metadata: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl AppEvent {
    pub fn table_key(&self) -> String {
        format!("{}:{}", self.app_id, self.id)
    }
}

// ── Tenancy ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrgStatus {
    Active,
    Suspended,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrganizationRecord {
    pub id: OrgId,
    pub name: String,
    pub quota_definition_id: QuotaId,
    pub status: OrgStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpaceRecord {
    pub id: SpaceId,
    pub name: String,
    pub organization_id: OrgId,
    /// Optional space-scoped ceilings, checked in addition to the org's.
    pub space_quota_definition_id: Option<QuotaId>,
}

/// Resource ceilings for an organization or a space.
///
/// A negative ceiling means unlimited.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuotaDefinition {
    pub id: QuotaId,
    pub name: String,
    pub total_routes: i64,
    pub total_services: i64,
    /// Whether plans that are not free may be provisioned at all.
    pub non_basic_services_allowed: bool,
    pub memory_limit_mb: i64,
}

impl QuotaDefinition {
    /// Whether `current + additional` routes stays within the ceiling.
    pub fn allows_routes(&self, current: usize, additional: usize) -> bool {
        within(self.total_routes, current, additional)
    }

    /// Whether `current + additional` service instances stays within the ceiling.
    pub fn allows_services(&self, current: usize, additional: usize) -> bool {
        within(self.total_services, current, additional)
    }

    /// Whether `current + additional` MB of running memory stays within the limit.
    pub fn allows_memory(&self, current_mb: usize, additional_mb: usize) -> bool {
        within(self.memory_limit_mb, current_mb, additional_mb)
    }
}

fn within(ceiling: i64, current: usize, additional: usize) -> bool {
    ceiling < 0 || (current + additional) as i64 <= ceiling
}

// ── Routing ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DomainRecord {
    pub id: DomainId,
    pub name: String,
    /// `None` for shared domains usable by every organization.
    pub owning_organization_id: Option<OrgId>,
}

impl DomainRecord {
    pub fn is_shared(&self) -> bool {
        self.owning_organization_id.is_none()
    }

    pub fn usable_by(&self, org_id: &str) -> bool {
        match &self.owning_organization_id {
            None => true,
            Some(owner) => owner == org_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RouteRecord {
    pub id: String,
    pub host: String,
    pub domain_id: DomainId,
    pub space_id: SpaceId,
    /// Normalized host, set only when the host carries an `[index]` placeholder.
    pub host_uniqueness: Option<String>,
    /// Normalized host, set only when the host carries a digit run.
    pub host_uniqueness2: Option<String>,
}

impl RouteRecord {
    /// Fully-qualified host name under the given domain.
    pub fn fqdn(&self, domain_name: &str) -> String {
        if self.host.is_empty() {
            domain_name.to_string()
        } else {
            format!("{}.{}", self.host, domain_name)
        }
    }
}

// ── Services ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServicePlan {
    pub id: PlanId,
    pub name: String,
    pub free: bool,
    /// Non-public plans need an explicit per-organization visibility grant.
    pub public: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServicePlanVisibility {
    pub plan_id: PlanId,
    pub organization_id: OrgId,
}

impl ServicePlanVisibility {
    pub fn table_key(&self) -> String {
        format!("{}:{}", self.plan_id, self.organization_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceInstance {
    pub id: String,
    pub name: String,
    pub space_id: SpaceId,
    pub plan_id: PlanId,
}
