//! Retry ledger: how many reschedules a workload has been through and which
//! nodes it has already been placed on.
//!
//! The ledger lives in an annotation on the owning workload. Its encoding
//! depends on the owner kind (see [`LedgerSchema`]), and the codec in
//! [`codec`] converts between annotation strings and [`Ledger`] values.

pub mod codec;

use std::collections::BTreeSet;

pub use codec::{decode, decode_budget, render};

/// Annotation declaring the retry budget on a workload.
pub const BUDGET_ANNOTATION: &str = "scheduling-retries";

/// Annotation placed on new pods listing nodes the scheduler should avoid.
pub const HINT_ANNOTATION: &str = "kse.com/scheduled-hosts";

/// Key for the attempt counter inside a ledger record.
pub const ATTEMPTS_FIELD: &str = "currentReschedulingTimes";

/// Persisted retry state for one workload (or one StatefulSet pod).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ledger {
    /// Completed reschedule cycles.
    pub attempts: u32,
    /// Nodes the workload was previously placed on.
    pub excluded_hosts: BTreeSet<String>,
}

impl Ledger {
    /// A ledger with `attempts` and no excluded hosts.
    pub fn cleared(attempts: u32) -> Self {
        Self {
            attempts,
            excluded_hosts: BTreeSet::new(),
        }
    }

    /// Host list in persisted order.
    pub fn hosts(&self) -> Vec<String> {
        self.excluded_hosts.iter().cloned().collect()
    }
}

/// How a ledger is laid out for a given owner kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerSchema {
    /// A single record with a kind-specific hosts field.
    Hosts {
        /// Annotation key holding the record.
        key: &'static str,
        /// Name of the hosts field inside the record.
        field: &'static str,
    },
    /// A map from pod name to record, used by StatefulSets.
    PodMap {
        /// Annotation key holding the map.
        key: &'static str,
    },
    /// A bare integer attempt counter, used by DaemonSets.
    Counter {
        /// Annotation key holding the counter.
        key: &'static str,
    },
}

impl LedgerSchema {
    /// Annotation key this schema is stored under.
    pub fn key(&self) -> &'static str {
        match self {
            LedgerSchema::Hosts { key, .. }
            | LedgerSchema::PodMap { key }
            | LedgerSchema::Counter { key } => key,
        }
    }

    /// Whether the schema has room for excluded hosts.
    pub fn tracks_hosts(&self) -> bool {
        !matches!(self, LedgerSchema::Counter { .. })
    }
}
