//! Admission rejection types.

use std::fmt;

use thiserror::Error;

/// Result type alias for admission checks.
pub type AdmissionResult<T> = Result<T, AdmissionError>;

/// Which set of ceilings rejected a creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaScope {
    Space,
    Organization,
}

impl fmt::Display for QuotaScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuotaScope::Space => f.write_str("space"),
            QuotaScope::Organization => f.write_str("organization"),
        }
    }
}

/// A constraint a candidate record failed.
#[derive(Debug, Error, PartialEq)]
pub enum AdmissionError {
    #[error("invalid host: {0:?}")]
    InvalidHost(String),

    #[error("host is taken: {fqdn}")]
    HostTaken { fqdn: String },

    #[error("Conflict with existing hostname {fqdn}")]
    HostConflict { fqdn: String },

    #[error("shared domain {domain} requires a host")]
    SharedDomainRequiresHost { domain: String },

    #[error("domain {domain} is not usable by organization {organization}")]
    DomainNotUsable { domain: String, organization: String },

    #[error("{scope} quota {quota} exceeded: total routes")]
    RouteQuotaExceeded { scope: QuotaScope, quota: String },

    #[error(
        "{scope} quota {quota} exceeded: total services. \
         Please file a support ticket to request additional resources"
    )]
    ServiceQuotaExceeded { scope: QuotaScope, quota: String },

    #[error(
        "{scope} quota {quota} exceeded: total services. \
         Please login to your account and upgrade"
    )]
    FreeServiceQuotaExceeded { scope: QuotaScope, quota: String },

    #[error("{scope} quota {quota}: paid service plans are not allowed (plan {plan})")]
    PaidServicesNotAllowed {
        scope: QuotaScope,
        quota: String,
        plan: String,
    },

    #[error("{scope} quota {quota} exceeded: memory limit")]
    MemoryQuotaExceeded { scope: QuotaScope, quota: String },

    #[error("service plan {plan} is not visible to organization {organization}")]
    PlanNotVisible { plan: String, organization: String },

    #[error("host pattern error: {0}")]
    Pattern(String),
}

impl AdmissionError {
    /// The quota scope that rejected the creation, if this is a quota error.
    pub fn scope(&self) -> Option<QuotaScope> {
        match self {
            AdmissionError::RouteQuotaExceeded { scope, .. }
            | AdmissionError::ServiceQuotaExceeded { scope, .. }
            | AdmissionError::FreeServiceQuotaExceeded { scope, .. }
            | AdmissionError::PaidServicesNotAllowed { scope, .. }
            | AdmissionError::MemoryQuotaExceeded { scope, .. } => Some(*scope),
            _ => None,
        }
    }
}
