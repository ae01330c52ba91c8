//! Policy reconciliation: what to tell the authority when a new
//! population count arrives for a targeted species.

use crate::codec::{Action, Target};

/// A policy the authority currently has on file for a species.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Policy {
    pub action: Action,
    pub id: u32,
}

/// The steps to bring the authority in line with an observation:
/// first delete the stale policy (if any), then create the new one
/// (if one is needed).
#[derive(Debug, PartialEq, Eq, Default)]
pub struct Reconciliation {
    pub delete: Option<u32>,
    pub create: Option<Action>,
}

#[must_use]
pub fn reconcile(current: Option<Policy>, count: u32, target: &Target) -> Reconciliation {
    let wanted = if count < target.min {
        Some(Action::Conserve)
    } else if count > target.max {
        Some(Action::Cull)
    } else {
        None
    };

    // The standing policy already says the right thing.
    if current.map(|policy| policy.action) == wanted {
        return Reconciliation::default();
    }

    Reconciliation {
        delete: current.map(|policy| policy.id),
        create: wanted,
    }
}
