//! Entitlement checks at the API boundary.
//!
//! [`crate::service::DedupService`] asks the [`EntitlementGate`] once per call.
//! A [`Grant`] can only be obtained from [`authorize`], so code holding one
//! acts for an entitled caller; the grant's caller id is what gets recorded
//! as the actor of resolutions and review decisions.

use crate::error::{DedupError, Result};

/// Who is calling. The gate decides what that identity may do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub id: String,
}

impl Caller {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    /// The local operator of the CLI.
    pub fn system() -> Self {
        Self::new("system")
    }
}

pub trait EntitlementGate: Send + Sync {
    /// Whether `caller` holds the deduplication capability.
    fn is_entitled(&self, caller: &Caller) -> bool;
}

/// A gate with a fixed answer, driven by configuration.
#[derive(Debug, Clone, Copy)]
pub struct StaticGate {
    entitled: bool,
}

impl StaticGate {
    pub fn new(entitled: bool) -> Self {
        Self { entitled }
    }

    pub fn allow_all() -> Self {
        Self::new(true)
    }
}

impl EntitlementGate for StaticGate {
    fn is_entitled(&self, _caller: &Caller) -> bool {
        self.entitled
    }
}

/// Proof that the gate admitted a caller.
#[derive(Debug, Clone)]
pub struct Grant {
    caller: Caller,
}

impl Grant {
    pub fn caller(&self) -> &Caller {
        &self.caller
    }
}

/// Check `caller` against `gate`.
pub fn authorize(gate: &dyn EntitlementGate, caller: &Caller) -> Result<Grant> {
    if gate.is_entitled(caller) {
        Ok(Grant {
            caller: caller.clone(),
        })
    } else {
        Err(DedupError::Authorization(format!(
            "caller '{}' lacks the deduplication entitlement",
            caller.id
        )))
    }
}
