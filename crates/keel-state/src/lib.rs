//! keel-state — the desired-state store for Keel.
//!
//! Backed by [redb](https://docs.rs/redb), holds the authoritative records
//! for workloads, tenancy (organizations, spaces, quotas), routing and
//! service instances, plus an audit trail of workload mutations.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Composite keys (`{app_id}:{event_id}`, `{plan_id}:{org_id}`) enable
//! prefix scans for related records.
//!
//! Mutations that must be atomic with their checks or side records run in a
//! single write transaction. redb admits one writer at a time, so a
//! read-modify-write of a workload cannot interleave with another.
//! Admission checks for routes and service instances run inside that same
//! transaction.
//!
//! After a workload mutation commits, a [`StateChange`] is broadcast to
//! subscribers. Fleet side effects hang off that feed, never off the write
//! path itself.

pub mod changes;
pub mod error;
pub mod store;
pub mod tables;

pub use changes::{ChangeOrigin, StateChange};
pub use error::{StateError, StateResult};
pub use store::StateStore;
