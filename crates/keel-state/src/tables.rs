//! redb table definitions for the Keel state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

/// Desired-state records keyed by `{app_id}`.
pub const APPS: TableDefinition<&str, &[u8]> = TableDefinition::new("apps");

/// Audit events keyed by `{app_id}:{event_id}`.
pub const APP_EVENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("app_events");

pub const ORGANIZATIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("organizations");

pub const SPACES: TableDefinition<&str, &[u8]> = TableDefinition::new("spaces");

/// Quota definitions, shared by organization and space scopes.
pub const QUOTAS: TableDefinition<&str, &[u8]> = TableDefinition::new("quota_definitions");

pub const DOMAINS: TableDefinition<&str, &[u8]> = TableDefinition::new("domains");

pub const ROUTES: TableDefinition<&str, &[u8]> = TableDefinition::new("routes");

pub const SERVICE_PLANS: TableDefinition<&str, &[u8]> = TableDefinition::new("service_plans");

/// Visibility grants keyed by `{plan_id}:{organization_id}`.
pub const PLAN_VISIBILITIES: TableDefinition<&str, &[u8]> =
    TableDefinition::new("service_plan_visibilities");

pub const SERVICE_INSTANCES: TableDefinition<&str, &[u8]> =
    TableDefinition::new("service_instances");
