//! Collaborator interface to the surrounding data platform.
//!
//! The engine references the host's databases and exchanges only through
//! this trait: a registration predicate, the exchange ids of an activity,
//! and the builtin function table for the formula evaluator.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, PoisonError, RwLock};

use crate::formula::{default_builtins, BuiltinTable};

/// What the engine needs from the surrounding platform.
pub trait Host {
    /// Whether `name` is a registered database.
    fn is_registered_database(&self, name: &str) -> bool;

    /// The exchange ids belonging to one activity. Unknown activities yield
    /// an empty list.
    fn exchanges_for(&self, database: &str, code: &str) -> Vec<i64>;

    /// The builtin functions available to formulas.
    fn builtins(&self) -> BuiltinTable {
        default_builtins()
    }
}

#[derive(Debug, Default)]
struct HostState {
    databases: BTreeSet<String>,
    exchanges: BTreeMap<(String, String), Vec<i64>>,
}

/// In-memory [`Host`] for tests and embedders without a full platform.
///
/// Clones share state, so a test can keep a handle and register databases
/// after the store has taken ownership of its copy.
#[derive(Debug, Clone, Default)]
pub struct MemoryHost {
    state: Arc<RwLock<HostState>>,
}

impl MemoryHost {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a database name.
    pub fn register_database(&self, name: &str) {
        self.state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .databases
            .insert(name.to_string());
    }

    /// Record the exchange ids of one activity.
    pub fn set_exchanges(&self, database: &str, code: &str, ids: Vec<i64>) {
        self.state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .exchanges
            .insert((database.to_string(), code.to_string()), ids);
    }
}

impl Host for MemoryHost {
    fn is_registered_database(&self, name: &str) -> bool {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .databases
            .contains(name)
    }

    fn exchanges_for(&self, database: &str, code: &str) -> Vec<i64> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .exchanges
            .get(&(database.to_string(), code.to_string()))
            .cloned()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_host_registration() {
        let host = MemoryHost::new();
        assert!(!host.is_registered_database("A"));
        host.register_database("A");
        assert!(host.is_registered_database("A"));
    }

    #[test]
    fn test_memory_host_clones_share_state() {
        let host = MemoryHost::new();
        let clone = host.clone();
        host.register_database("B");
        assert!(clone.is_registered_database("B"));
    }

    #[test]
    fn test_memory_host_exchanges() {
        let host = MemoryHost::new();
        assert!(host.exchanges_for("B", "C").is_empty());
        host.set_exchanges("B", "C", vec![42, 43]);
        assert_eq!(host.exchanges_for("B", "C"), vec![42, 43]);
    }

    #[test]
    fn test_default_builtins_available() {
        let host = MemoryHost::new();
        assert!(host.builtins().contains_key("sqrt"));
    }
}
