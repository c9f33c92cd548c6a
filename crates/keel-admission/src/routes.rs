//! Route-host uniqueness.
//!
//! A host may carry an `[index]` placeholder (`web-[index]`) that the fleet
//! expands per instance. Such a template must not coexist with a concrete
//! host it would expand to (`web-2`) in the same domain. Both forms are
//! reduced to a wildcard key: lowercase, `[index]` → `*`, each digit run →
//! `*`. Templates store the key as `host_uniqueness`, hosts with digits as
//! `host_uniqueness2`, and a candidate is compared across the two columns.

use regex::Regex;
use tracing::debug;

use keel_core::{DomainRecord, RouteRecord};

use crate::error::{AdmissionError, AdmissionResult};

const INDEX_PLACEHOLDER: &str = "[index]";
const WILDCARD: &str = "*";

/// Derived uniqueness keys for a host.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HostKeys {
    /// Set when the host contains `[index]`.
    pub host_uniqueness: Option<String>,
    /// Set when the host contains a digit.
    pub host_uniqueness2: Option<String>,
}

/// Compiled host patterns. Build once and share.
#[derive(Debug, Clone)]
pub struct RouteUniqueness {
    digits: Regex,
    format: Regex,
}

impl RouteUniqueness {
    pub fn new() -> AdmissionResult<Self> {
        let digits = Regex::new(r"\d+").map_err(|e| AdmissionError::Pattern(e.to_string()))?;
        let format =
            Regex::new(r"^[\w\-\[\]]+$").map_err(|e| AdmissionError::Pattern(e.to_string()))?;
        Ok(Self { digits, format })
    }

    /// Reduce a host to its wildcard key.
    pub fn normalize(&self, host: &str) -> String {
        let lowered = host.to_lowercase().replace(INDEX_PLACEHOLDER, WILDCARD);
        self.digits.replace_all(&lowered, WILDCARD).into_owned()
    }

    fn has_placeholder(&self, host: &str) -> bool {
        host.to_lowercase().contains(INDEX_PLACEHOLDER)
    }

    fn has_digits(&self, host: &str) -> bool {
        self.digits.is_match(host)
    }

    /// Compute the keys persisted on a new route.
    pub fn keys(&self, host: &str) -> HostKeys {
        let normalized = self.normalize(host);
        HostKeys {
            host_uniqueness: self.has_placeholder(host).then(|| normalized.clone()),
            host_uniqueness2: self.has_digits(host).then_some(normalized),
        }
    }

    /// Reject hosts outside `[\w\-\[\]]+`. The empty host is allowed here;
    /// [`check_domain`] decides whether the domain accepts it.
    pub fn validate_host(&self, host: &str) -> AdmissionResult<()> {
        if host.is_empty() || self.format.is_match(host) {
            Ok(())
        } else {
            Err(AdmissionError::InvalidHost(host.to_string()))
        }
    }

    /// Check a candidate host against the existing routes of `domain`.
    ///
    /// Routes belonging to other domains are ignored. On success returns the
    /// keys to store on the new route.
    pub fn check<'a, I>(
        &self,
        candidate_host: &str,
        domain: &DomainRecord,
        existing: I,
    ) -> AdmissionResult<HostKeys>
    where
        I: IntoIterator<Item = &'a RouteRecord>,
    {
        self.validate_host(candidate_host)?;

        let keys = self.keys(candidate_host);
        let normalized = self.normalize(candidate_host);
        let has_placeholder = keys.host_uniqueness.is_some();
        let has_digits = keys.host_uniqueness2.is_some();

        for route in existing.into_iter().filter(|r| r.domain_id == domain.id) {
            if route.host.eq_ignore_ascii_case(candidate_host) {
                return Err(AdmissionError::HostTaken {
                    fqdn: route.fqdn(&domain.name),
                });
            }

            let template_clash = has_placeholder
                && (route.host_uniqueness.as_deref() == Some(normalized.as_str())
                    || route.host_uniqueness2.as_deref() == Some(normalized.as_str()));
            let concrete_clash =
                has_digits && route.host_uniqueness.as_deref() == Some(normalized.as_str());

            if template_clash || concrete_clash {
                debug!(
                    candidate = %candidate_host,
                    existing = %route.host,
                    domain = %domain.name,
                    "route host collides under wildcard normalization"
                );
                return Err(AdmissionError::HostConflict {
                    fqdn: route.fqdn(&domain.name),
                });
            }
        }

        Ok(keys)
    }
}

/// Domain rules for a route owned by `organization_id`: a shared domain
/// needs a non-empty host, a private domain must belong to the organization.
pub fn check_domain(domain: &DomainRecord, host: &str, organization_id: &str) -> AdmissionResult<()> {
    if domain.is_shared() && host.is_empty() {
        return Err(AdmissionError::SharedDomainRequiresHost {
            domain: domain.name.clone(),
        });
    }
    if !domain.usable_by(organization_id) {
        return Err(AdmissionError::DomainNotUsable {
            domain: domain.name.clone(),
            organization: organization_id.to_string(),
        });
    }
    Ok(())
}
