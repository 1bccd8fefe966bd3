//! The parameters manager facade.
//!
//! A thin, stateless handle over one [`ParameterStore`]: bulk creation per
//! scope, the global parameter count, and the global recalculation pass.
//! It is a value, not a process-global, so tests and embedders can run
//! isolated engines side by side.

use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;

use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::host::Host;
use crate::model::{ActivityParameterDef, ParameterDef};
use crate::storage::ParameterStore;

/// Facade over a parameter store.
pub struct Parameters {
    store: ParameterStore,
}

fn check_unique_names<'a>(names: impl Iterator<Item = &'a str>) -> Result<()> {
    let mut seen = BTreeSet::new();
    for name in names {
        if !seen.insert(name) {
            return Err(Error::Batch(format!(
                "duplicate parameter name `{name}` in batch"
            )));
        }
    }
    Ok(())
}

impl Parameters {
    /// Wrap an existing store.
    #[must_use]
    pub fn new(store: ParameterStore) -> Self {
        Self { store }
    }

    /// Open a manager over a store at `path`.
    pub fn open(path: &Path, host: Box<dyn Host>) -> Result<Self> {
        Ok(Self::new(ParameterStore::open(path, host)?))
    }

    /// Open a manager from a resolved configuration.
    pub fn open_with_config(config: &StoreConfig, host: Box<dyn Host>) -> Result<Self> {
        Ok(Self::new(ParameterStore::open_with_config(config, host)?))
    }

    /// Open a manager over an in-memory store (for testing).
    pub fn in_memory(host: Box<dyn Host>) -> Result<Self> {
        Ok(Self::new(ParameterStore::open_memory(host)?))
    }

    /// The underlying store.
    #[must_use]
    pub fn store(&self) -> &ParameterStore {
        &self.store
    }

    /// The underlying store, mutably.
    pub fn store_mut(&mut self) -> &mut ParameterStore {
        &mut self.store
    }

    /// Total parameter rows across all three scopes.
    pub fn count(&self) -> Result<u64> {
        self.store.count_parameters()
    }

    /// Whether no parameters exist anywhere.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.count()? == 0)
    }

    /// Upsert a batch of project parameters and recalculate project scope.
    ///
    /// On return the `project` group is fresh.
    ///
    /// # Errors
    ///
    /// `Batch` when the batch repeats a name.
    pub fn new_project_parameters(&mut self, defs: &[ParameterDef]) -> Result<()> {
        check_unique_names(defs.iter().map(|d| d.name.as_str()))?;
        self.store.upsert_project_parameters(defs)?;
        self.store.recalculate_project()
    }

    /// Upsert a batch of database parameters and recalculate that scope.
    ///
    /// # Errors
    ///
    /// `Batch` when `database` is not registered or the batch repeats a
    /// name.
    pub fn new_database_parameters(
        &mut self,
        defs: &[ParameterDef],
        database: &str,
    ) -> Result<()> {
        if !self.store.host().is_registered_database(database) {
            return Err(Error::Batch(format!(
                "`{database}` is not a registered database"
            )));
        }
        check_unique_names(defs.iter().map(|d| d.name.as_str()))?;
        self.store.upsert_database_parameters(database, defs)?;
        self.store.recalculate_database(database)
    }

    /// Upsert a batch of activity parameters into one group and recalculate
    /// it.
    ///
    /// # Errors
    ///
    /// `Batch` when the batch repeats a name, spans more than one database,
    /// or targets an unregistered database.
    pub fn new_activity_parameters(
        &mut self,
        defs: &[ActivityParameterDef],
        group: &str,
    ) -> Result<()> {
        let databases: BTreeSet<&str> = defs.iter().map(|d| d.database.as_str()).collect();
        if databases.len() != 1 {
            return Err(Error::Batch(
                "activity parameter batch must target exactly one database".to_string(),
            ));
        }
        if let Some(database) = databases.first() {
            if !self.store.host().is_registered_database(database) {
                return Err(Error::Batch(format!(
                    "`{database}` is not a registered database"
                )));
            }
        }
        check_unique_names(defs.iter().map(|d| d.param.name.as_str()))?;
        self.store.upsert_activity_parameters(group, defs)?;
        self.store.recalculate_activity(group)
    }

    /// The global recalculation pass: project, then databases, then
    /// activity groups in dependency order.
    pub fn recalculate(&mut self) -> Result<()> {
        self.store.recalculate_all()
    }
}

impl fmt::Display for Parameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Parameters manager with {} objects",
            self.count().unwrap_or(0)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::MemoryHost;
    use crate::model::{ParameterUpdate, PROJECT_GROUP_NAME};

    fn manager() -> (Parameters, MemoryHost) {
        let host = MemoryHost::new();
        let manager = Parameters::in_memory(Box::new(host.clone())).unwrap();
        (manager, host)
    }

    fn def(name: &str) -> ParameterDef {
        ParameterDef::new(name)
    }

    #[test]
    fn test_display() {
        let (manager, _host) = manager();
        assert_eq!(manager.to_string(), "Parameters manager with 0 objects");
    }

    #[test]
    fn test_new_project_parameters() {
        let (mut manager, _host) = manager();

        let duplicates = [def("foo"), def("foo")];
        assert!(matches!(
            manager.new_project_parameters(&duplicates),
            Err(Error::Batch(_))
        ));

        assert!(manager.is_empty().unwrap());
        manager
            .new_project_parameters(&[
                def("foo").with_amount(4.0),
                def("bar").with_formula("foo + 3"),
            ])
            .unwrap();
        assert_eq!(manager.count().unwrap(), 2);
        assert_eq!(
            manager.store().get_project_parameter("foo").unwrap().unwrap().amount,
            Some(4.0)
        );
        assert_eq!(
            manager.store().get_project_parameter("bar").unwrap().unwrap().amount,
            Some(7.0)
        );
        assert!(
            manager
                .store()
                .get_group(PROJECT_GROUP_NAME)
                .unwrap()
                .unwrap()
                .fresh
        );
    }

    #[test]
    fn test_new_project_parameters_upserts() {
        let (mut manager, _host) = manager();
        manager
            .new_project_parameters(&[def("foo").with_amount(4.0)])
            .unwrap();
        manager
            .new_project_parameters(&[def("foo").with_amount(5.0)])
            .unwrap();
        assert_eq!(manager.count().unwrap(), 1);
        assert_eq!(
            manager.store().get_project_parameter("foo").unwrap().unwrap().amount,
            Some(5.0)
        );
    }

    #[test]
    fn test_new_database_parameters() {
        let (mut manager, host) = manager();

        assert!(matches!(
            manager.new_database_parameters(&[], "another"),
            Err(Error::Batch(_))
        ));
        host.register_database("another");
        assert!(matches!(
            manager.new_database_parameters(&[def("foo"), def("foo")], "another"),
            Err(Error::Batch(_))
        ));

        manager
            .new_database_parameters(
                &[
                    def("foo").with_amount(4.0),
                    def("bar").with_formula("foo + 3"),
                ],
                "another",
            )
            .unwrap();
        assert_eq!(manager.count().unwrap(), 2);
        assert_eq!(
            manager
                .store()
                .get_database_parameter("another", "bar")
                .unwrap()
                .unwrap()
                .amount,
            Some(7.0)
        );
        assert!(manager.store().get_group("another").unwrap().unwrap().fresh);
    }

    #[test]
    fn test_new_activity_parameters() {
        let (mut manager, host) = manager();

        // Empty batches have no target database.
        assert!(matches!(
            manager.new_activity_parameters(&[], "grp"),
            Err(Error::Batch(_))
        ));

        let defs = [
            ActivityParameterDef::new("B", "C", def("D").with_formula("2 ** 3")),
            ActivityParameterDef::new("B", "E", def("F").with_formula("2 * D")),
        ];
        assert!(matches!(
            manager.new_activity_parameters(&defs, "grp"),
            Err(Error::Batch(_))
        ));
        host.register_database("B");
        manager.new_activity_parameters(&defs, "grp").unwrap();
        assert_eq!(manager.count().unwrap(), 2);
        assert_eq!(
            manager
                .store()
                .get_activity_parameter("grp", "F")
                .unwrap()
                .unwrap()
                .amount,
            Some(16.0)
        );
        assert!(manager.store().get_group("grp").unwrap().unwrap().fresh);

        // Mixed databases in one batch are refused.
        let mixed = [
            ActivityParameterDef::new("B", "X", def("p")),
            ActivityParameterDef::new("K", "Y", def("q")),
        ];
        assert!(matches!(
            manager.new_activity_parameters(&mixed, "grp2"),
            Err(Error::Batch(_))
        ));
    }

    #[test]
    fn test_global_recalculate() {
        let (mut manager, host) = manager();
        host.register_database("B");
        let store = manager.store_mut();
        store
            .create_activity_parameter(
                "A",
                &ActivityParameterDef::new("B", "C", def("D").with_formula("2 ** 3")),
            )
            .unwrap();
        store
            .create_activity_parameter(
                "A",
                &ActivityParameterDef::new("B", "E", def("F").with_formula("foo + bar + D")),
            )
            .unwrap();
        store
            .create_database_parameter("B", &def("foo").with_formula("2 ** 2"))
            .unwrap();
        store
            .create_project_parameter(&def("bar").with_formula("2 * 2 * 2"))
            .unwrap();

        manager.recalculate().unwrap();
        let store = manager.store();
        assert_eq!(
            store.get_project_parameter("bar").unwrap().unwrap().amount,
            Some(8.0)
        );
        assert_eq!(
            store.get_database_parameter("B", "foo").unwrap().unwrap().amount,
            Some(4.0)
        );
        assert_eq!(
            store.get_activity_parameter("A", "F").unwrap().unwrap().amount,
            Some(20.0)
        );
        assert_eq!(
            store.get_activity_parameter("A", "D").unwrap().unwrap().amount,
            Some(8.0)
        );
    }

    #[test]
    fn test_count_spans_all_scopes() {
        let (mut manager, host) = manager();
        host.register_database("B");
        manager
            .new_project_parameters(&[def("p").with_amount(1.0)])
            .unwrap();
        manager
            .new_database_parameters(&[def("d").with_amount(2.0)], "B")
            .unwrap();
        manager
            .new_activity_parameters(
                &[ActivityParameterDef::new("B", "c", def("a").with_amount(3.0))],
                "grp",
            )
            .unwrap();
        assert_eq!(manager.count().unwrap(), 3);
        assert_eq!(manager.to_string(), "Parameters manager with 3 objects");

        // A manager-created row can still be updated through the store.
        manager
            .store_mut()
            .update_project_parameter("p", &ParameterUpdate::amount(9.0))
            .unwrap();
        assert!(manager.store().project_expired().unwrap());
    }
}
