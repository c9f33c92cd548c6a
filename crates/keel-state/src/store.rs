//! StateStore — redb-backed desired-state persistence for Keel.
//!
//! Provides typed operations over workloads, tenancy, routing and services.
//! All values are JSON-serialized into redb's `&[u8]` value columns. The
//! store supports both on-disk and in-memory backends (the latter for
//! testing).

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition, WriteTransaction};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use tokio::sync::broadcast;
use tracing::{debug, info};
use uuid::Uuid;

use keel_admission::{
    RouteUniqueness, ScopeUsage, check_domain, check_memory_quota, check_plan_visibility,
    check_route_quota, check_service_quota,
};
use keel_core::*;

use crate::changes::{ChangeOrigin, StateChange};
use crate::error::{StateError, StateResult};
use crate::tables::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type Table = TableDefinition<'static, &'static str, &'static [u8]>;

/// Capacity of the change feed before slow subscribers start lagging.
const CHANGE_BUFFER: usize = 256;

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
    changes: broadcast::Sender<StateChange>,
    uniqueness: Arc<RouteUniqueness>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self::with_database(db)?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self::with_database(db)?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn with_database(db: Database) -> StateResult<Self> {
        let (changes, _) = broadcast::channel(CHANGE_BUFFER);
        let store = Self {
            db: Arc::new(db),
            changes,
            uniqueness: Arc::new(RouteUniqueness::new()?),
        };
        store.ensure_tables()?;
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        for table in [
            APPS,
            APP_EVENTS,
            ORGANIZATIONS,
            SPACES,
            QUOTAS,
            DOMAINS,
            ROUTES,
            SERVICE_PLANS,
            PLAN_VISIBILITIES,
            SERVICE_INSTANCES,
        ] {
            txn.open_table(table).map_err(map_err!(Table))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Subscribe to committed workload changes.
    pub fn subscribe_changes(&self) -> broadcast::Receiver<StateChange> {
        self.changes.subscribe()
    }

    fn notify(&self, change: StateChange) {
        // No subscribers is fine; the change is already durable.
        let _ = self.changes.send(change);
    }

    // ── Plain records ──────────────────────────────────────────────

    fn put_record<T: Serialize>(&self, table: Table, key: &str, value: &T) -> StateResult<()> {
        let value = encode(value)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            t.insert(key, value.as_slice()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get_record<T: DeserializeOwned>(&self, table: Table, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        load(&t, key)
    }

    fn list_records<T: DeserializeOwned>(&self, table: Table, prefix: &str) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        scan(&t, prefix)
    }

    pub fn put_organization(&self, org: &OrganizationRecord) -> StateResult<()> {
        self.put_record(ORGANIZATIONS, &org.id, org)
    }

    pub fn get_organization(&self, id: &str) -> StateResult<Option<OrganizationRecord>> {
        self.get_record(ORGANIZATIONS, id)
    }

    pub fn put_space(&self, space: &SpaceRecord) -> StateResult<()> {
        self.put_record(SPACES, &space.id, space)
    }

    pub fn get_space(&self, id: &str) -> StateResult<Option<SpaceRecord>> {
        self.get_record(SPACES, id)
    }

    pub fn put_quota(&self, quota: &QuotaDefinition) -> StateResult<()> {
        self.put_record(QUOTAS, &quota.id, quota)
    }

    pub fn get_quota(&self, id: &str) -> StateResult<Option<QuotaDefinition>> {
        self.get_record(QUOTAS, id)
    }

    pub fn put_domain(&self, domain: &DomainRecord) -> StateResult<()> {
        self.put_record(DOMAINS, &domain.id, domain)
    }

    pub fn get_domain(&self, id: &str) -> StateResult<Option<DomainRecord>> {
        self.get_record(DOMAINS, id)
    }

    pub fn put_plan(&self, plan: &ServicePlan) -> StateResult<()> {
        self.put_record(SERVICE_PLANS, &plan.id, plan)
    }

    pub fn get_plan(&self, id: &str) -> StateResult<Option<ServicePlan>> {
        self.get_record(SERVICE_PLANS, id)
    }

    /// Make a non-public plan visible to one organization.
    pub fn grant_plan_visibility(&self, grant: &ServicePlanVisibility) -> StateResult<()> {
        self.put_record(PLAN_VISIBILITIES, &grant.table_key(), grant)?;
        info!(plan = %grant.plan_id, org = %grant.organization_id, "plan visibility granted");
        Ok(())
    }

    // ── Workloads ──────────────────────────────────────────────────

    /// Look up a workload's desired state.
    pub fn get_app(&self, id: &str) -> StateResult<Option<AppRecord>> {
        self.get_record(APPS, id)
    }

    pub fn list_apps(&self) -> StateResult<Vec<AppRecord>> {
        self.list_records(APPS, "")
    }

    /// Audit events recorded for a workload, oldest key first.
    pub fn list_events_for_app(&self, app_id: &str) -> StateResult<Vec<AppEvent>> {
        self.list_records(APP_EVENTS, &format!("{app_id}:"))
    }

    /// Create a stopped workload in an existing space.
    pub fn create_app(
        &self,
        ctx: &OperationContext,
        name: &str,
        space_id: &str,
        desired_instances: u32,
        memory_mb: u32,
    ) -> StateResult<AppRecord> {
        let now = Utc::now();
        let app = AppRecord {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            space_id: space_id.to_string(),
            version: new_version(),
            last_updated: now,
            desired_instances,
            lifecycle_state: LifecycleState::Stopped,
            memory_mb,
            droplet_hash: None,
            created_at: now,
        };

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let spaces = txn.open_table(SPACES).map_err(map_err!(Table))?;
            load::<SpaceRecord, _>(&spaces, space_id)?
                .ok_or_else(|| StateError::NotFound(format!("space {space_id}")))?;

            let mut apps = txn.open_table(APPS).map_err(map_err!(Table))?;
            apps.insert(app.id.as_str(), encode(&app)?.as_slice())
                .map_err(map_err!(Write))?;

            let mut events = txn.open_table(APP_EVENTS).map_err(map_err!(Table))?;
            record_event(&mut events, ctx, &app, "app.create")?;
        }
        txn.commit().map_err(map_err!(Transaction))?;

        info!(app_id = %app.id, %name, actor = %ctx.actor, "app created");
        self.notify(StateChange {
            app_id: app.id.clone(),
            before: None,
            after: Some(app.clone()),
            origin: ChangeOrigin::Api,
        });
        Ok(app)
    }

    /// Change the desired instance count. Scaling a STARTED workload up must
    /// fit its space and organization memory limits.
    pub fn scale_app(&self, ctx: &OperationContext, id: &str, instances: u32) -> StateResult<AppRecord> {
        self.mutate_app(ctx, id, "app.update", ChangeOrigin::Api, |app| {
            app.desired_instances = instances;
            Ok(())
        })
    }

    /// Mark the workload STARTED. It must have a droplet to run and its
    /// memory must fit the space and organization limits.
    pub fn start_app(&self, ctx: &OperationContext, id: &str) -> StateResult<AppRecord> {
        self.mutate_app(ctx, id, "app.start", ChangeOrigin::Api, |app| {
            if app.droplet_hash.is_none() {
                return Err(StateError::Invalid(format!("app {} has no droplet to run", app.id)));
            }
            app.lifecycle_state = LifecycleState::Started;
            Ok(())
        })
    }

    /// Mark the workload STOPPED.
    pub fn stop_app(&self, ctx: &OperationContext, id: &str) -> StateResult<AppRecord> {
        self.mutate_app(ctx, id, "app.stop", ChangeOrigin::Api, |app| {
            app.lifecycle_state = LifecycleState::Stopped;
            Ok(())
        })
    }

    /// Assign the build artifact the fleet should run, recording an audit
    /// event in the same transaction. The workload must be stopped.
    pub fn assign_droplet(
        &self,
        ctx: &OperationContext,
        id: &str,
        droplet_hash: &str,
    ) -> StateResult<AppRecord> {
        self.mutate_app(ctx, id, "app.map_droplet", ChangeOrigin::Api, |app| {
            if app.is_started() {
                return Err(StateError::Invalid(
                    "stop the app before changing droplet".to_string(),
                ));
            }
            app.droplet_hash = Some(droplet_hash.to_string());
            Ok(())
        })
    }

    /// Apply a fleet-requested full shutdown: the workload becomes STOPPED.
    ///
    /// The fleet has already been told to stop, so the resulting change is
    /// tagged [`ChangeOrigin::Fleet`].
    pub fn record_spindown(&self, id: &str) -> StateResult<AppRecord> {
        self.mutate_app(
            &OperationContext::system(),
            id,
            "app.spindown",
            ChangeOrigin::Fleet,
            |app| {
                app.lifecycle_state = LifecycleState::Stopped;
                Ok(())
            },
        )
    }

    /// Delete a workload. Returns true if it existed.
    pub fn delete_app(&self, ctx: &OperationContext, id: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let removed = {
            let mut apps = txn.open_table(APPS).map_err(map_err!(Table))?;
            let removed: Option<AppRecord> = match apps.remove(id).map_err(map_err!(Write))? {
                Some(guard) => Some(decode(guard.value())?),
                None => None,
            };
            if let Some(app) = &removed {
                let mut events = txn.open_table(APP_EVENTS).map_err(map_err!(Table))?;
                record_event(&mut events, ctx, app, "app.delete")?;
            }
            removed
        };
        txn.commit().map_err(map_err!(Transaction))?;

        let existed = removed.is_some();
        debug!(app_id = %id, existed, "app deleted");
        if let Some(app) = removed {
            self.notify(StateChange {
                app_id: id.to_string(),
                before: Some(app),
                after: None,
                origin: ChangeOrigin::Api,
            });
        }
        Ok(existed)
    }

    /// Read-modify-write a workload in one write transaction, with its audit
    /// event. A fresh version token is issued when the mutation changes what
    /// the fleet should run; `last_updated` moves on every write. A mutation
    /// that grows the workload's running memory is admitted against the
    /// memory limits in the same transaction.
    fn mutate_app<F>(
        &self,
        ctx: &OperationContext,
        id: &str,
        kind: &str,
        origin: ChangeOrigin,
        mutate: F,
    ) -> StateResult<AppRecord>
    where
        F: FnOnce(&mut AppRecord) -> StateResult<()>,
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let (before, after) = {
            let mut apps = txn.open_table(APPS).map_err(map_err!(Table))?;
            let before: AppRecord =
                load(&apps, id)?.ok_or_else(|| StateError::NotFound(format!("app {id}")))?;

            let mut after = before.clone();
            mutate(&mut after)?;
            if after.running_memory_mb() > before.running_memory_mb() {
                admit_memory(&txn, &apps, &after)?;
            }
            if before.version_affecting_change(&after) {
                after.version = new_version();
            }
            after.last_updated = Utc::now();

            apps.insert(id, encode(&after)?.as_slice())
                .map_err(map_err!(Write))?;

            let mut events = txn.open_table(APP_EVENTS).map_err(map_err!(Table))?;
            record_event(&mut events, ctx, &after, kind)?;
            (before, after)
        };
        txn.commit().map_err(map_err!(Transaction))?;

        debug!(
            app_id = %id,
            %kind,
            version = %after.version,
            state = ?after.lifecycle_state,
            instances = after.desired_instances,
            "app updated"
        );
        self.notify(StateChange {
            app_id: id.to_string(),
            before: Some(before),
            after: Some(after.clone()),
            origin,
        });
        Ok(after)
    }

    // ── Routes ─────────────────────────────────────────────────────

    pub fn list_routes(&self) -> StateResult<Vec<RouteRecord>> {
        self.list_records(ROUTES, "")
    }

    /// Create a route after host-uniqueness, domain and quota admission.
    pub fn create_route(
        &self,
        ctx: &OperationContext,
        host: &str,
        domain_id: &str,
        space_id: &str,
    ) -> StateResult<RouteRecord> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let route = {
            let spaces = txn.open_table(SPACES).map_err(map_err!(Table))?;
            let orgs = txn.open_table(ORGANIZATIONS).map_err(map_err!(Table))?;
            let quotas = txn.open_table(QUOTAS).map_err(map_err!(Table))?;
            let domains = txn.open_table(DOMAINS).map_err(map_err!(Table))?;
            let mut routes = txn.open_table(ROUTES).map_err(map_err!(Table))?;

            let tenancy = Tenancy::load(&spaces, &orgs, &quotas, space_id)?;
            tenancy.ensure_active(ctx)?;
            let domain: DomainRecord = load(&domains, domain_id)?
                .ok_or_else(|| StateError::NotFound(format!("domain {domain_id}")))?;

            check_domain(&domain, host, &tenancy.org.id)?;
            let existing: Vec<RouteRecord> = scan(&routes, "")?;
            let keys = self.uniqueness.check(host, &domain, &existing)?;

            let org_spaces = org_space_ids(&spaces, &tenancy.org.id)?;
            let space_count = existing.iter().filter(|r| r.space_id == space_id).count();
            let org_count = existing
                .iter()
                .filter(|r| org_spaces.contains(&r.space_id))
                .count();
            check_route_quota(
                tenancy.space_quota.as_ref().map(|q| ScopeUsage::new(q, space_count)),
                ScopeUsage::new(&tenancy.org_quota, org_count),
            )?;

            let route = RouteRecord {
                id: Uuid::new_v4().to_string(),
                host: host.to_string(),
                domain_id: domain_id.to_string(),
                space_id: space_id.to_string(),
                host_uniqueness: keys.host_uniqueness,
                host_uniqueness2: keys.host_uniqueness2,
            };
            routes
                .insert(route.id.as_str(), encode(&route)?.as_slice())
                .map_err(map_err!(Write))?;
            route
        };
        txn.commit().map_err(map_err!(Transaction))?;

        info!(route_id = %route.id, host = %route.host, %domain_id, actor = %ctx.actor, "route created");
        Ok(route)
    }

    /// Delete a route by ID. Returns true if it existed.
    pub fn delete_route(&self, id: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut routes = txn.open_table(ROUTES).map_err(map_err!(Table))?;
            existed = routes.remove(id).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(route_id = %id, existed, "route deleted");
        Ok(existed)
    }

    // ── Service instances ──────────────────────────────────────────

    pub fn list_service_instances(&self) -> StateResult<Vec<ServiceInstance>> {
        self.list_records(SERVICE_INSTANCES, "")
    }

    /// Provision a service instance after visibility and quota admission.
    pub fn create_service_instance(
        &self,
        ctx: &OperationContext,
        name: &str,
        space_id: &str,
        plan_id: &str,
    ) -> StateResult<ServiceInstance> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let instance = {
            let spaces = txn.open_table(SPACES).map_err(map_err!(Table))?;
            let orgs = txn.open_table(ORGANIZATIONS).map_err(map_err!(Table))?;
            let quotas = txn.open_table(QUOTAS).map_err(map_err!(Table))?;
            let plans = txn.open_table(SERVICE_PLANS).map_err(map_err!(Table))?;
            let visibilities = txn.open_table(PLAN_VISIBILITIES).map_err(map_err!(Table))?;
            let mut instances = txn.open_table(SERVICE_INSTANCES).map_err(map_err!(Table))?;

            let tenancy = Tenancy::load(&spaces, &orgs, &quotas, space_id)?;
            tenancy.ensure_active(ctx)?;
            let plan: ServicePlan = load(&plans, plan_id)?
                .ok_or_else(|| StateError::NotFound(format!("service plan {plan_id}")))?;

            let grants: Vec<ServicePlanVisibility> = scan(&visibilities, &format!("{plan_id}:"))?;
            check_plan_visibility(&plan, &tenancy.org.id, &grants)?;

            let existing: Vec<ServiceInstance> = scan(&instances, "")?;
            let org_spaces = org_space_ids(&spaces, &tenancy.org.id)?;
            let space_count = existing.iter().filter(|s| s.space_id == space_id).count();
            let org_count = existing
                .iter()
                .filter(|s| org_spaces.contains(&s.space_id))
                .count();
            check_service_quota(
                &plan,
                tenancy.space_quota.as_ref().map(|q| ScopeUsage::new(q, space_count)),
                ScopeUsage::new(&tenancy.org_quota, org_count),
            )?;

            let instance = ServiceInstance {
                id: Uuid::new_v4().to_string(),
                name: name.to_string(),
                space_id: space_id.to_string(),
                plan_id: plan_id.to_string(),
            };
            instances
                .insert(instance.id.as_str(), encode(&instance)?.as_slice())
                .map_err(map_err!(Write))?;
            instance
        };
        txn.commit().map_err(map_err!(Transaction))?;

        info!(instance_id = %instance.id, %name, %plan_id, actor = %ctx.actor, "service instance created");
        Ok(instance)
    }
}

/// The space, its organization and both quota scopes, read inside one
/// transaction.
struct Tenancy {
    org: OrganizationRecord,
    org_quota: QuotaDefinition,
    space_quota: Option<QuotaDefinition>,
}

impl Tenancy {
    fn load<S, O, Q>(spaces: &S, orgs: &O, quotas: &Q, space_id: &str) -> StateResult<Self>
    where
        S: ReadableTable<&'static str, &'static [u8]>,
        O: ReadableTable<&'static str, &'static [u8]>,
        Q: ReadableTable<&'static str, &'static [u8]>,
    {
        let space: SpaceRecord = load(spaces, space_id)?
            .ok_or_else(|| StateError::NotFound(format!("space {space_id}")))?;
        let org: OrganizationRecord = load(orgs, &space.organization_id)?
            .ok_or_else(|| StateError::NotFound(format!("organization {}", space.organization_id)))?;
        let org_quota: QuotaDefinition = load(quotas, &org.quota_definition_id)?.ok_or_else(|| {
            StateError::NotFound(format!("quota definition {}", org.quota_definition_id))
        })?;
        let space_quota = match &space.space_quota_definition_id {
            Some(id) => Some(
                load(quotas, id)?
                    .ok_or_else(|| StateError::NotFound(format!("space quota definition {id}")))?,
            ),
            None => None,
        };
        Ok(Self {
            org,
            org_quota,
            space_quota,
        })
    }

    /// Suspended organizations accept no new resources except from admins.
    fn ensure_active(&self, ctx: &OperationContext) -> StateResult<()> {
        if self.org.status == OrgStatus::Suspended && !ctx.admin {
            return Err(StateError::Suspended(self.org.name.clone()));
        }
        Ok(())
    }
}

/// Running memory of every other workload in the space and the org, plus
/// `app`'s, must fit under each scope's memory limit.
fn admit_memory<A>(txn: &WriteTransaction, apps: &A, app: &AppRecord) -> StateResult<()>
where
    A: ReadableTable<&'static str, &'static [u8]>,
{
    let spaces = txn.open_table(SPACES).map_err(map_err!(Table))?;
    let orgs = txn.open_table(ORGANIZATIONS).map_err(map_err!(Table))?;
    let quotas = txn.open_table(QUOTAS).map_err(map_err!(Table))?;
    let tenancy = Tenancy::load(&spaces, &orgs, &quotas, &app.space_id)?;
    let org_spaces = org_space_ids(&spaces, &tenancy.org.id)?;

    let (mut space_mb, mut org_mb) = (0, 0);
    for other in scan::<AppRecord, _>(apps, "")? {
        if other.id == app.id {
            continue;
        }
        let mb = other.running_memory_mb();
        if other.space_id == app.space_id {
            space_mb += mb;
        }
        if org_spaces.contains(&other.space_id) {
            org_mb += mb;
        }
    }

    check_memory_quota(
        tenancy.space_quota.as_ref().map(|q| ScopeUsage::new(q, space_mb)),
        ScopeUsage::new(&tenancy.org_quota, org_mb),
        app.running_memory_mb(),
    )?;
    Ok(())
}

fn org_space_ids<S>(spaces: &S, org_id: &str) -> StateResult<HashSet<String>>
where
    S: ReadableTable<&'static str, &'static [u8]>,
{
    let all: Vec<SpaceRecord> = scan(spaces, "")?;
    Ok(all
        .into_iter()
        .filter(|s| s.organization_id == org_id)
        .map(|s| s.id)
        .collect())
}

fn record_event(
    events: &mut redb::Table<'_, &'static str, &'static [u8]>,
    ctx: &OperationContext,
    app: &AppRecord,
    kind: &str,
) -> StateResult<()> {
    let event = AppEvent {
        id: Uuid::new_v4().to_string(),
        app_id: app.id.clone(),
        actor: ctx.actor.clone(),
        kind: kind.to_string(),
        metadata: json!({
            "state": app.lifecycle_state,
            "instances": app.desired_instances,
            "version": app.version,
            "droplet_hash": app.droplet_hash,
        }),
        timestamp: Utc::now(),
    };
    events
        .insert(event.table_key().as_str(), encode(&event)?.as_slice())
        .map_err(map_err!(Write))?;
    Ok(())
}

fn new_version() -> String {
    Uuid::new_v4().to_string()
}

fn encode<T: Serialize>(value: &T) -> StateResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(map_err!(Serialize))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StateResult<T> {
    serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
}

fn load<T, Tb>(table: &Tb, key: &str) -> StateResult<Option<T>>
where
    T: DeserializeOwned,
    Tb: ReadableTable<&'static str, &'static [u8]>,
{
    match table.get(key).map_err(map_err!(Read))? {
        Some(guard) => Ok(Some(decode(guard.value())?)),
        None => Ok(None),
    }
}

fn scan<T, Tb>(table: &Tb, prefix: &str) -> StateResult<Vec<T>>
where
    T: DeserializeOwned,
    Tb: ReadableTable<&'static str, &'static [u8]>,
{
    let mut results = Vec::new();
    for entry in table.iter().map_err(map_err!(Read))? {
        let (key, value) = entry.map_err(map_err!(Read))?;
        if key.value().starts_with(prefix) {
            results.push(decode(value.value())?);
        }
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_admission::{AdmissionError, QuotaScope};

    fn ctx() -> OperationContext {
        OperationContext::user("alice")
    }

    fn quota(id: &str, routes: i64, services: i64, paid: bool) -> QuotaDefinition {
        QuotaDefinition {
            id: id.to_string(),
            name: id.to_string(),
            total_routes: routes,
            total_services: services,
            non_basic_services_allowed: paid,
            memory_limit_mb: 10_240,
        }
    }

    /// One org with one space and a shared domain.
    fn seeded(org_quota: QuotaDefinition, space_quota: Option<QuotaDefinition>) -> StateStore {
        let store = StateStore::open_in_memory().unwrap();
        store.put_quota(&org_quota).unwrap();
        if let Some(q) = &space_quota {
            store.put_quota(q).unwrap();
        }
        store
            .put_organization(&OrganizationRecord {
                id: "org-1".to_string(),
                name: "acme".to_string(),
                quota_definition_id: org_quota.id.clone(),
                status: OrgStatus::Active,
            })
            .unwrap();
        store
            .put_space(&SpaceRecord {
                id: "space-1".to_string(),
                name: "dev".to_string(),
                organization_id: "org-1".to_string(),
                space_quota_definition_id: space_quota.map(|q| q.id),
            })
            .unwrap();
        store
            .put_domain(&DomainRecord {
                id: "dom-1".to_string(),
                name: "apps.example.com".to_string(),
                owning_organization_id: None,
            })
            .unwrap();
        store
    }

    fn default_store() -> StateStore {
        seeded(quota("org-q", 100, 100, true), None)
    }

    fn add_space(store: &StateStore, id: &str) {
        store
            .put_space(&SpaceRecord {
                id: id.to_string(),
                name: id.to_string(),
                organization_id: "org-1".to_string(),
                space_quota_definition_id: None,
            })
            .unwrap();
    }

    // ── Workloads ──────────────────────────────────────────────────

    #[test]
    fn app_create_and_get() {
        let store = default_store();
        let app = store.create_app(&ctx(), "web", "space-1", 2, 256).unwrap();

        let found = store.get_app(&app.id).unwrap();
        assert_eq!(found, Some(app.clone()));
        assert!(app.is_stopped());
        assert_eq!(store.list_apps().unwrap().len(), 1);
    }

    #[test]
    fn app_create_requires_space() {
        let store = default_store();
        let err = store.create_app(&ctx(), "web", "nope", 1, 256).unwrap_err();
        assert!(matches!(err, StateError::NotFound(_)));
    }

    #[test]
    fn get_nonexistent_app_returns_none() {
        let store = default_store();
        assert!(store.get_app("missing").unwrap().is_none());
    }

    #[test]
    fn version_changes_on_desired_state_update() {
        let store = default_store();
        let app = store.create_app(&ctx(), "web", "space-1", 1, 256).unwrap();

        let scaled = store.scale_app(&ctx(), &app.id, 3).unwrap();
        assert_ne!(scaled.version, app.version);
        assert!(scaled.last_updated >= app.last_updated);

        let same = store.scale_app(&ctx(), &app.id, 3).unwrap();
        assert_eq!(same.version, scaled.version, "no-op write keeps version");
    }

    #[test]
    fn start_requires_droplet() {
        let store = default_store();
        let app = store.create_app(&ctx(), "web", "space-1", 1, 256).unwrap();

        assert!(matches!(
            store.start_app(&ctx(), &app.id),
            Err(StateError::Invalid(_))
        ));

        store.assign_droplet(&ctx(), &app.id, "abc123").unwrap();
        let started = store.start_app(&ctx(), &app.id).unwrap();
        assert!(started.is_started());
    }

    #[test]
    fn droplet_change_rejected_while_started() {
        let store = default_store();
        let app = store.create_app(&ctx(), "web", "space-1", 1, 256).unwrap();
        store.assign_droplet(&ctx(), &app.id, "abc").unwrap();
        store.start_app(&ctx(), &app.id).unwrap();

        let err = store.assign_droplet(&ctx(), &app.id, "def").unwrap_err();
        assert!(err.to_string().contains("stop the app"));
        assert_eq!(
            store.get_app(&app.id).unwrap().unwrap().droplet_hash.as_deref(),
            Some("abc"),
            "failed transaction leaves record untouched"
        );
    }

    #[test]
    fn mutations_record_audit_events_with_actor() {
        let store = default_store();
        let app = store.create_app(&ctx(), "web", "space-1", 1, 256).unwrap();
        store.assign_droplet(&ctx(), &app.id, "abc").unwrap();

        let events = store.list_events_for_app(&app.id).unwrap();
        let kinds: HashSet<_> = events.iter().map(|e| e.kind.as_str()).collect();
        assert_eq!(events.len(), 2);
        assert!(kinds.contains("app.create"));
        assert!(kinds.contains("app.map_droplet"));
        assert!(events.iter().all(|e| e.actor == "alice"));
    }

    #[test]
    fn spindown_stops_app_as_system() {
        let store = default_store();
        let app = store.create_app(&ctx(), "web", "space-1", 1, 256).unwrap();
        store.assign_droplet(&ctx(), &app.id, "abc").unwrap();
        let started = store.start_app(&ctx(), &app.id).unwrap();

        let stopped = store.record_spindown(&app.id).unwrap();
        assert!(stopped.is_stopped());
        assert_ne!(stopped.version, started.version);

        let events = store.list_events_for_app(&app.id).unwrap();
        assert!(events.iter().any(|e| e.kind == "app.spindown" && e.actor == "system"));
    }

    /// A stopped app with a droplet, ready to start.
    fn staged_app(store: &StateStore, space_id: &str, instances: u32, memory_mb: u32) -> AppRecord {
        let app = store.create_app(&ctx(), "web", space_id, instances, memory_mb).unwrap();
        store.assign_droplet(&ctx(), &app.id, "abc").unwrap()
    }

    #[test]
    fn start_rejected_over_org_memory_limit() {
        let mut org_q = quota("org-q", 100, 100, true);
        org_q.memory_limit_mb = 1024;
        let store = seeded(org_q, None);
        add_space(&store, "space-2");

        let first = staged_app(&store, "space-1", 2, 256);
        store.start_app(&ctx(), &first.id).unwrap();
        let second = staged_app(&store, "space-2", 3, 256);

        let err = store.start_app(&ctx(), &second.id).unwrap_err();
        assert!(matches!(
            err,
            StateError::Admission(AdmissionError::MemoryQuotaExceeded {
                scope: QuotaScope::Organization,
                ..
            })
        ));
        assert!(store.get_app(&second.id).unwrap().unwrap().is_stopped());

        // Stopped apps hold no memory, so the limit frees up.
        store.stop_app(&ctx(), &first.id).unwrap();
        assert!(store.start_app(&ctx(), &second.id).unwrap().is_started());
    }

    #[test]
    fn scale_up_rejected_over_space_memory_limit() {
        let mut space_q = quota("space-q", 100, 100, true);
        space_q.memory_limit_mb = 512;
        let store = seeded(quota("org-q", 100, 100, true), Some(space_q));
        let app = staged_app(&store, "space-1", 1, 256);
        store.start_app(&ctx(), &app.id).unwrap();
        let mut rx = store.subscribe_changes();

        assert!(store.scale_app(&ctx(), &app.id, 2).is_ok());
        let err = store.scale_app(&ctx(), &app.id, 3).unwrap_err();
        assert!(matches!(
            err,
            StateError::Admission(AdmissionError::MemoryQuotaExceeded {
                scope: QuotaScope::Space,
                ref quota,
            }) if quota == "space-q"
        ));
        assert_eq!(store.get_app(&app.id).unwrap().unwrap().desired_instances, 2);

        // Scaling down needs no headroom; a stopped app scales freely.
        assert!(store.scale_app(&ctx(), &app.id, 1).is_ok());
        store.stop_app(&ctx(), &app.id).unwrap();
        assert!(store.scale_app(&ctx(), &app.id, 50).is_ok());

        // scale to 2, scale down, stop, scale to 50; the rejected scale never broadcast.
        assert_eq!(rx.try_recv().unwrap().after.unwrap().desired_instances, 2);
        assert_eq!(rx.try_recv().unwrap().after.unwrap().desired_instances, 1);
        assert!(rx.try_recv().unwrap().after.unwrap().is_stopped());
        assert_eq!(rx.try_recv().unwrap().after.unwrap().desired_instances, 50);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn delete_app() {
        let store = default_store();
        let app = store.create_app(&ctx(), "web", "space-1", 1, 256).unwrap();

        assert!(store.delete_app(&ctx(), &app.id).unwrap());
        assert!(!store.delete_app(&ctx(), &app.id).unwrap());
        assert!(store.get_app(&app.id).unwrap().is_none());
    }

    #[tokio::test]
    async fn changes_broadcast_after_commit() {
        let store = default_store();
        let mut rx = store.subscribe_changes();

        let app = store.create_app(&ctx(), "web", "space-1", 1, 256).unwrap();
        let created = rx.recv().await.unwrap();
        assert!(created.before.is_none());
        assert_eq!(created.origin, ChangeOrigin::Api);

        store.assign_droplet(&ctx(), &app.id, "abc").unwrap();
        store.start_app(&ctx(), &app.id).unwrap();
        store.record_spindown(&app.id).unwrap();
        store.delete_app(&ctx(), &app.id).unwrap();

        let _droplet = rx.recv().await.unwrap();
        let started = rx.recv().await.unwrap();
        assert!(started.after.as_ref().unwrap().is_started());
        let spindown = rx.recv().await.unwrap();
        assert_eq!(spindown.origin, ChangeOrigin::Fleet);
        let deleted = rx.recv().await.unwrap();
        assert!(deleted.is_delete());
    }

    #[test]
    fn failed_mutation_broadcasts_nothing() {
        let store = default_store();
        let app = store.create_app(&ctx(), "web", "space-1", 1, 256).unwrap();
        let mut rx = store.subscribe_changes();

        assert!(store.start_app(&ctx(), &app.id).is_err());
        assert!(rx.try_recv().is_err());
    }

    // ── Routes ─────────────────────────────────────────────────────

    #[test]
    fn route_create_stores_uniqueness_keys() {
        let store = default_store();
        let route = store.create_route(&ctx(), "web-[index]", "dom-1", "space-1").unwrap();

        assert_eq!(route.host_uniqueness.as_deref(), Some("web-*"));
        assert!(route.host_uniqueness2.is_none());
        assert_eq!(store.list_routes().unwrap(), vec![route]);
    }

    #[test]
    fn route_template_conflicts_with_concrete_host() {
        let store = default_store();
        store.create_route(&ctx(), "web-2", "dom-1", "space-1").unwrap();

        let err = store
            .create_route(&ctx(), "web-[index]", "dom-1", "space-1")
            .unwrap_err();
        match err {
            StateError::Admission(AdmissionError::HostConflict { fqdn }) => {
                assert_eq!(fqdn, "web-2.apps.example.com");
            }
            other => panic!("unexpected error: {other}"),
        }

        store.create_route(&ctx(), "api-[index]", "dom-1", "space-1").unwrap();
        assert_eq!(store.list_routes().unwrap().len(), 2);
    }

    #[test]
    fn route_org_quota_counts_all_spaces() {
        let store = seeded(quota("org-q", 2, 100, true), None);
        add_space(&store, "space-2");

        store.create_route(&ctx(), "a", "dom-1", "space-1").unwrap();
        store.create_route(&ctx(), "b", "dom-1", "space-2").unwrap();
        let err = store.create_route(&ctx(), "c", "dom-1", "space-1").unwrap_err();

        match err {
            StateError::Admission(e) => assert_eq!(e.scope(), Some(QuotaScope::Organization)),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn route_space_quota_checked_first() {
        let store = seeded(quota("org-q", 10, 100, true), Some(quota("space-q", 1, 100, true)));

        store.create_route(&ctx(), "a", "dom-1", "space-1").unwrap();
        let err = store.create_route(&ctx(), "b", "dom-1", "space-1").unwrap_err();

        match err {
            StateError::Admission(e) => assert_eq!(e.scope(), Some(QuotaScope::Space)),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn delete_route_frees_host() {
        let store = default_store();
        let route = store.create_route(&ctx(), "web", "dom-1", "space-1").unwrap();
        assert!(store.create_route(&ctx(), "web", "dom-1", "space-1").is_err());

        assert!(store.delete_route(&route.id).unwrap());
        assert!(store.create_route(&ctx(), "web", "dom-1", "space-1").is_ok());
    }

    #[test]
    fn suspended_org_rejects_non_admin() {
        let store = default_store();
        let mut org = store.get_organization("org-1").unwrap().unwrap();
        org.status = OrgStatus::Suspended;
        store.put_organization(&org).unwrap();

        assert!(matches!(
            store.create_route(&ctx(), "web", "dom-1", "space-1"),
            Err(StateError::Suspended(_))
        ));
        assert!(
            store
                .create_route(&OperationContext::admin("root"), "web", "dom-1", "space-1")
                .is_ok()
        );
    }

    // ── Service instances ──────────────────────────────────────────

    fn plan(id: &str, free: bool, public: bool) -> ServicePlan {
        ServicePlan {
            id: id.to_string(),
            name: id.to_string(),
            free,
            public,
        }
    }

    #[test]
    fn service_instance_org_ceiling_rejects_with_space_headroom() {
        let store = seeded(quota("org-q", 100, 1, true), Some(quota("space-q", 100, 10, true)));
        add_space(&store, "space-2");
        store.put_plan(&plan("p1", false, true)).unwrap();

        store
            .create_service_instance(&ctx(), "db-a", "space-2", "p1")
            .unwrap();
        let err = store
            .create_service_instance(&ctx(), "db-b", "space-1", "p1")
            .unwrap_err();

        match err {
            StateError::Admission(e) => {
                assert_eq!(e.scope(), Some(QuotaScope::Organization));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(store.list_service_instances().unwrap().len(), 1);
    }

    #[test]
    fn private_plan_requires_grant() {
        let store = default_store();
        store.put_plan(&plan("secret", true, false)).unwrap();

        let err = store
            .create_service_instance(&ctx(), "db", "space-1", "secret")
            .unwrap_err();
        assert!(matches!(
            err,
            StateError::Admission(AdmissionError::PlanNotVisible { .. })
        ));

        store
            .grant_plan_visibility(&ServicePlanVisibility {
                plan_id: "secret".to_string(),
                organization_id: "org-1".to_string(),
            })
            .unwrap();
        assert!(
            store
                .create_service_instance(&ctx(), "db", "space-1", "secret")
                .is_ok()
        );
    }

    #[test]
    fn paid_plan_rejected_under_free_org_quota() {
        let store = seeded(quota("trial", 100, 5, false), None);
        store.put_plan(&plan("paid", false, true)).unwrap();

        let err = store
            .create_service_instance(&ctx(), "db", "space-1", "paid")
            .unwrap_err();
        assert!(matches!(
            err,
            StateError::Admission(AdmissionError::PaidServicesNotAllowed { .. })
        ));
    }

    // ── Persistence (on-disk) ──────────────────────────────────────

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.redb");

        let app_id = {
            let store = StateStore::open(&db_path).unwrap();
            store.put_quota(&quota("org-q", 10, 10, true)).unwrap();
            store
                .put_space(&SpaceRecord {
                    id: "space-1".to_string(),
                    name: "dev".to_string(),
                    organization_id: "org-1".to_string(),
                    space_quota_definition_id: None,
                })
                .unwrap();
            store.create_app(&ctx(), "web", "space-1", 2, 128).unwrap().id
        };

        let store = StateStore::open(&db_path).unwrap();
        let app = store.get_app(&app_id).unwrap();
        assert_eq!(app.unwrap().name, "web");
        assert!(store.get_quota("org-q").unwrap().is_some());
    }

    #[test]
    fn empty_store_operations() {
        let store = StateStore::open_in_memory().unwrap();

        assert!(store.list_apps().unwrap().is_empty());
        assert!(store.list_routes().unwrap().is_empty());
        assert!(store.list_service_instances().unwrap().is_empty());
        assert!(store.list_events_for_app("any").unwrap().is_empty());
        assert!(!store.delete_route("nope").unwrap());
        assert!(!store.delete_app(&ctx(), "nope").unwrap());
        assert!(matches!(
            store.record_spindown("nope"),
            Err(StateError::NotFound(_))
        ));
    }
}
