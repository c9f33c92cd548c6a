//! keel-admission — checks a desired-state mutation must pass before it commits.
//!
//! Every function here is pure: callers hand in the candidate record and the
//! records it competes with (existing routes, current counts, quota
//! definitions). The state store runs these checks inside the same write
//! transaction that inserts the candidate, so the counts cannot move between
//! check and commit.
//!
//! # Checks
//!
//! ```text
//! route create
//!   ├── RouteUniqueness::validate_host   host format
//!   ├── check_domain                     shared/private domain rules
//!   ├── RouteUniqueness::check           (host, domain) + wildcard collisions
//!   └── check_route_quota                space ceiling, then org ceiling
//!
//! app start / scale up
//!   └── check_memory_quota               running memory vs space/org limits
//!
//! service instance create
//!   ├── check_plan_visibility            non-public plans need a grant
//!   └── check_service_quota              paid-plan rule + space/org ceilings
//! ```

pub mod error;
pub mod quota;
pub mod routes;

pub use error::{AdmissionError, AdmissionResult, QuotaScope};
pub use quota::{
    ScopeUsage, check_memory_quota, check_plan_visibility, check_route_quota, check_service_quota,
};
pub use routes::{HostKeys, RouteUniqueness, check_domain};
