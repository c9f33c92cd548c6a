//! Explicit caller identity for desired-state mutations.

use serde::{Deserialize, Serialize};

/// Who is performing an operation.
///
/// Passed by value through every call chain that records an actor or
/// needs an admin check. There is no ambient "current user".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationContext {
    pub actor: String,
    pub admin: bool,
}

impl OperationContext {
    pub fn user(actor: &str) -> Self {
        Self {
            actor: actor.to_string(),
            admin: false,
        }
    }

    pub fn admin(actor: &str) -> Self {
        Self {
            actor: actor.to_string(),
            admin: true,
        }
    }

    /// Context for mutations the control plane performs on its own behalf,
    /// e.g. reacting to fleet feedback.
    pub fn system() -> Self {
        Self::admin("system")
    }
}
