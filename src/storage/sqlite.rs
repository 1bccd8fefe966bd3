//! SQLite store implementation.
//!
//! This module provides the main storage backend for the parameter engine.
//! It follows the MutationContext pattern for transaction discipline: every
//! public mutation runs through [`ParameterStore::mutate`], which opens an
//! IMMEDIATE transaction, runs the caller's closure, and then upserts a
//! stale group row (`fresh = 0`, `updated = now()`) for every group the
//! closure touched. This replaces the source system's database triggers with
//! a single invariant-preserving write path.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension, ToSql, Transaction};
use tracing::debug;

use crate::config::{StoreConfig, DEFAULT_BUSY_TIMEOUT_MS};
use crate::error::{Error, Result};
use crate::host::Host;
use crate::model::{
    ActivityParameter, ActivityParameterDef, ActivityParameterUpdate, DataBag, DatabaseParameter,
    Group, GroupDependency, ParameterDef, ParameterUpdate, ParameterizedExchange,
    ProjectParameter, Scope, PROJECT_GROUP_NAME,
};
use crate::storage::schema::apply_schema;

/// SQLite-backed parameter store.
///
/// Owns the connection and the host collaborator. Single-writer: concurrent
/// writers must serialize on `&mut self`.
pub struct ParameterStore {
    conn: Connection,
    host: Box<dyn Host>,
}

/// Context for a mutation operation.
///
/// Closures passed to [`ParameterStore::mutate`] mark the groups whose
/// parameters they changed; the wrapper then stamps those groups stale with
/// a fresh `updated` timestamp inside the same transaction.
#[derive(Debug, Default)]
pub struct MutationContext {
    touched: Vec<String>,
}

impl MutationContext {
    /// Mark a group as mutated: it will be created if absent, marked stale,
    /// and its `updated` timestamp advanced when the transaction commits.
    pub fn touch(&mut self, group: &str) {
        if !self.touched.iter().any(|g| g == group) {
            self.touched.push(group.to_string());
        }
    }
}

/// Wall-clock seconds; the freshness model promises second resolution only.
pub(crate) fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

/// Map constraint violations to the `Integrity` kind; pass everything else
/// through as a database error.
fn map_constraint(err: rusqlite::Error, message: impl Into<String>) -> Error {
    if is_constraint_violation(&err) {
        Error::Integrity(message.into())
    } else {
        Error::Database(err)
    }
}

fn parse_bag(text: &str) -> Result<DataBag> {
    Ok(serde_json::from_str(text)?)
}

fn parse_order(text: &str) -> Result<Vec<String>> {
    Ok(serde_json::from_str(text)?)
}

impl ParameterStore {
    /// Open a store at the given path, creating the schema if needed.
    pub fn open(path: &Path, host: Box<dyn Host>) -> Result<Self> {
        Self::open_with_config(&StoreConfig::new(path), host)
    }

    /// Open a store from a resolved configuration.
    pub fn open_with_config(config: &StoreConfig, host: Box<dyn Host>) -> Result<Self> {
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| Error::Config(format!("cannot create {}: {e}", parent.display())))?;
            }
        }
        let conn = Connection::open(&config.path)?;
        conn.busy_timeout(Duration::from_millis(config.busy_timeout_ms))?;
        apply_schema(&conn)?;
        Ok(Self { conn, host })
    }

    /// Open an in-memory store (for testing).
    pub fn open_memory(host: Box<dyn Host>) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.busy_timeout(Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS))?;
        apply_schema(&conn)?;
        Ok(Self { conn, host })
    }

    /// The host collaborator.
    #[must_use]
    pub fn host(&self) -> &dyn Host {
        self.host.as_ref()
    }

    /// Get a reference to the underlying connection (for read operations).
    #[must_use]
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Execute a mutation with the transaction protocol.
    ///
    /// 1. Begins an IMMEDIATE transaction (for write locking)
    /// 2. Executes the mutation closure
    /// 3. Upserts every touched group with `fresh = 0, updated = now()`
    /// 4. Commits (or rolls back on error)
    pub fn mutate<F, R>(&mut self, f: F) -> Result<R>
    where
        F: FnOnce(&Transaction, &dyn Host, &mut MutationContext) -> Result<R>,
    {
        let Self { conn, host } = self;
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        let mut ctx = MutationContext::default();

        let result = f(&tx, host.as_ref(), &mut ctx)?;

        let stamp = now();
        for group in &ctx.touched {
            tx.execute(
                "INSERT INTO groups (name, fresh, updated) VALUES (?1, 0, ?2)
                 ON CONFLICT(name) DO UPDATE SET fresh = 0, updated = excluded.updated",
                rusqlite::params![group, stamp],
            )?;
        }

        tx.commit()?;
        Ok(result)
    }

    // ================
    // Group Registry
    // ================

    /// Create a group explicitly. Explicitly created groups are born fresh.
    ///
    /// # Errors
    ///
    /// `Integrity` if the name is taken.
    pub fn create_group(&mut self, name: &str) -> Result<Group> {
        self.create_group_ordered(name, &[])
    }

    /// Create a group with an inheritance order list.
    ///
    /// The list is purged first: `"project"` and registered database names
    /// are stripped, since those scopes are always inherited implicitly.
    pub fn create_group_ordered(&mut self, name: &str, order: &[String]) -> Result<Group> {
        self.mutate(|tx, host, _ctx| {
            let order = purge_order_impl(host, order);
            let stamp = now();
            tx.execute(
                "INSERT INTO groups (name, fresh, updated, order_list) VALUES (?1, 1, ?2, ?3)",
                rusqlite::params![name, stamp, serde_json::to_string(&order)?],
            )
            .map_err(|e| map_constraint(e, format!("group `{name}` already exists")))?;
            Ok(Group {
                name: name.to_string(),
                fresh: true,
                updated: stamp,
                order,
            })
        })
    }

    /// Get a group by name.
    pub fn get_group(&self, name: &str) -> Result<Option<Group>> {
        get_group_impl(&self.conn, name)
    }

    /// Get a group, creating it stale if absent.
    pub fn get_or_create_group(&mut self, name: &str) -> Result<Group> {
        self.mutate(|tx, _host, _ctx| {
            if let Some(group) = get_group_impl(tx, name)? {
                return Ok(group);
            }
            let stamp = now();
            tx.execute(
                "INSERT INTO groups (name, fresh, updated) VALUES (?1, 0, ?2)",
                rusqlite::params![name, stamp],
            )?;
            Ok(Group {
                name: name.to_string(),
                fresh: false,
                updated: stamp,
                order: Vec::new(),
            })
        })
    }

    /// Mark a group stale. Does not advance `updated`.
    pub fn expire_group(&mut self, name: &str) -> Result<()> {
        self.mutate(|tx, _host, _ctx| {
            let rows = tx.execute("UPDATE groups SET fresh = 0 WHERE name = ?1", [name])?;
            if rows == 0 {
                return Err(Error::NotFound(format!("group `{name}`")));
            }
            Ok(())
        })
    }

    /// Mark a group fresh. Does not advance `updated`.
    pub fn freshen_group(&mut self, name: &str) -> Result<()> {
        self.mutate(|tx, _host, _ctx| {
            let rows = tx.execute("UPDATE groups SET fresh = 1 WHERE name = ?1", [name])?;
            if rows == 0 {
                return Err(Error::NotFound(format!("group `{name}`")));
            }
            Ok(())
        })
    }

    /// Replace a group's inheritance order (purged first). The group's
    /// symbol table changes, so it goes stale.
    pub fn set_group_order(&mut self, name: &str, order: &[String]) -> Result<Vec<String>> {
        self.mutate(|tx, host, _ctx| {
            let order = purge_order_impl(host, order);
            let rows = tx.execute(
                "UPDATE groups SET order_list = ?1, fresh = 0 WHERE name = ?2",
                rusqlite::params![serde_json::to_string(&order)?, name],
            )?;
            if rows == 0 {
                return Err(Error::NotFound(format!("group `{name}`")));
            }
            Ok(order)
        })
    }

    /// Strip `"project"` and registered database names from an order list,
    /// preserving the relative order of survivors.
    #[must_use]
    pub fn purge_order(&self, order: &[String]) -> Vec<String> {
        purge_order_impl(self.host.as_ref(), order)
    }

    /// Tear down a group: its row, both sides of its dependency edges, its
    /// activity parameters, and its parameterized exchanges.
    pub fn delete_group(&mut self, name: &str) -> Result<()> {
        self.mutate(|tx, _host, _ctx| {
            tx.execute(
                "DELETE FROM group_dependencies WHERE group_name = ?1 OR depends = ?1",
                [name],
            )?;
            tx.execute(
                "DELETE FROM parameterized_exchanges WHERE group_name = ?1",
                [name],
            )?;
            tx.execute("DELETE FROM activity_parameters WHERE group_name = ?1", [name])?;
            let rows = tx.execute("DELETE FROM groups WHERE name = ?1", [name])?;
            if rows == 0 {
                return Err(Error::NotFound(format!("group `{name}`")));
            }
            debug!(group = name, "deleted group");
            Ok(())
        })
    }

    /// Number of group rows.
    pub fn count_groups(&self) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM groups", [], |row| row.get(0))?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    // =================
    // Dependency Graph
    // =================

    /// Add a dependency edge `group -> depends`.
    ///
    /// # Errors
    ///
    /// `InvalidDependency` when `group` is `"project"`, or when `group` is a
    /// registered database and `depends` is not `"project"`. `Integrity` on
    /// self-edges, duplicates, and edges that would close a cycle.
    pub fn add_group_dependency(&mut self, group: &str, depends: &str) -> Result<GroupDependency> {
        self.mutate(|tx, host, _ctx| {
            if group == PROJECT_GROUP_NAME {
                return Err(Error::InvalidDependency(
                    "the `project` group cannot depend on anything".to_string(),
                ));
            }
            if host.is_registered_database(group) && depends != PROJECT_GROUP_NAME {
                return Err(Error::InvalidDependency(format!(
                    "database group `{group}` may only depend on `project`, not `{depends}`"
                )));
            }
            if group == depends {
                return Err(Error::Integrity(format!(
                    "group `{group}` cannot depend on itself"
                )));
            }
            if would_create_cycle(tx, group, depends)? {
                return Err(Error::Integrity(format!(
                    "dependency `{group}` -> `{depends}` closes a cycle"
                )));
            }
            tx.execute(
                "INSERT INTO group_dependencies (group_name, depends) VALUES (?1, ?2)",
                rusqlite::params![group, depends],
            )
            .map_err(|e| {
                map_constraint(e, format!("dependency `{group}` -> `{depends}` already exists"))
            })?;
            Ok(GroupDependency {
                group: group.to_string(),
                depends: depends.to_string(),
            })
        })
    }

    /// Look up a single dependency edge.
    pub fn get_group_dependency(&self, group: &str, depends: &str) -> Result<Option<GroupDependency>> {
        let found = self
            .conn
            .query_row(
                "SELECT group_name, depends FROM group_dependencies
                 WHERE group_name = ?1 AND depends = ?2",
                rusqlite::params![group, depends],
                |row| {
                    Ok(GroupDependency {
                        group: row.get(0)?,
                        depends: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(found)
    }

    /// Every group with a dependency path down to `name`.
    pub fn downstream(&self, name: &str) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "WITH RECURSIVE down(name) AS (
                 SELECT group_name FROM group_dependencies WHERE depends = ?1
                 UNION
                 SELECT gd.group_name FROM group_dependencies gd
                 JOIN down ON gd.depends = down.name
             )
             SELECT name FROM down ORDER BY name",
        )?;
        let names = stmt
            .query_map([name], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(names)
    }

    /// Mark every downstream group stale.
    pub fn expire_downstream(&mut self, name: &str) -> Result<()> {
        self.mutate(|tx, _host, _ctx| expire_downstream_impl(tx, name))
    }

    /// Remove every edge touching `name`, in either direction.
    pub fn remove_group_edges(&mut self, name: &str) -> Result<()> {
        self.mutate(|tx, _host, _ctx| {
            tx.execute(
                "DELETE FROM group_dependencies WHERE group_name = ?1 OR depends = ?1",
                [name],
            )?;
            Ok(())
        })
    }

    /// Number of dependency edges.
    pub fn count_group_dependencies(&self) -> Result<u64> {
        let count: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM group_dependencies", [], |row| row.get(0))?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    // ===================
    // Project Parameters
    // ===================

    /// Create a project parameter. Auto-creates and stales the `project`
    /// group.
    pub fn create_project_parameter(&mut self, def: &ParameterDef) -> Result<ProjectParameter> {
        let data = serde_json::to_string(&def.data)?;
        self.mutate(|tx, _host, ctx| {
            tx.execute(
                "INSERT INTO project_parameters (name, amount, formula, data)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![def.name, def.amount, def.formula, data],
            )
            .map_err(|e| {
                map_constraint(e, format!("project parameter `{}` already exists", def.name))
            })?;
            ctx.touch(PROJECT_GROUP_NAME);
            debug!(name = %def.name, "created project parameter");
            Ok(ProjectParameter {
                name: def.name.clone(),
                amount: def.amount,
                formula: def.formula.clone(),
                data: def.data.clone(),
            })
        })
    }

    /// Get a project parameter by name.
    pub fn get_project_parameter(&self, name: &str) -> Result<Option<ProjectParameter>> {
        let row = self
            .conn
            .query_row(
                "SELECT name, amount, formula, data FROM project_parameters WHERE name = ?1",
                [name],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<f64>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;
        row.map(|(name, amount, formula, data)| {
            Ok(ProjectParameter {
                name,
                amount,
                formula,
                data: parse_bag(&data)?,
            })
        })
        .transpose()
    }

    /// Partially update a project parameter.
    pub fn update_project_parameter(&mut self, name: &str, update: &ParameterUpdate) -> Result<()> {
        let mut set_parts: Vec<&str> = Vec::new();
        let mut params: Vec<Box<dyn ToSql>> = Vec::new();
        if let Some(amount) = update.amount {
            set_parts.push("amount");
            params.push(Box::new(amount));
        }
        if let Some(formula) = &update.formula {
            set_parts.push("formula");
            params.push(Box::new(formula.clone()));
        }
        if let Some(data) = &update.data {
            set_parts.push("data");
            params.push(Box::new(serde_json::to_string(data)?));
        }
        if set_parts.is_empty() {
            return Ok(());
        }

        self.mutate(|tx, _host, ctx| {
            let rows = execute_update(
                tx,
                "project_parameters",
                &set_parts,
                params,
                "name = ?",
                &[&name.to_string()],
            )?;
            if rows == 0 {
                return Err(Error::NotFound(format!("project parameter `{name}`")));
            }
            ctx.touch(PROJECT_GROUP_NAME);
            Ok(())
        })
    }

    /// Delete a project parameter.
    pub fn delete_project_parameter(&mut self, name: &str) -> Result<()> {
        self.mutate(|tx, _host, ctx| {
            let rows = tx.execute("DELETE FROM project_parameters WHERE name = ?1", [name])?;
            if rows == 0 {
                return Err(Error::NotFound(format!("project parameter `{name}`")));
            }
            ctx.touch(PROJECT_GROUP_NAME);
            Ok(())
        })
    }

    /// All project parameters as name -> attribute bag.
    pub fn load_project_parameters(&self) -> Result<BTreeMap<String, DataBag>> {
        let mut stmt = self
            .conn
            .prepare("SELECT name, amount, formula, data FROM project_parameters")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<f64>>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut out = BTreeMap::new();
        for row in rows {
            let (name, amount, formula, data) = row?;
            let param = ProjectParameter {
                name: name.clone(),
                amount,
                formula,
                data: parse_bag(&data)?,
            };
            let mut bag = param.dict();
            bag.remove("name");
            out.insert(name, bag);
        }
        Ok(out)
    }

    /// Stored project amounts as a symbol table; no evaluation happens.
    pub fn project_static(
        &self,
        only: Option<&[&str]>,
    ) -> Result<BTreeMap<String, Option<f64>>> {
        project_static_impl(&self.conn, only)
    }

    /// Whether the project scope is stale. Absent group means nothing was
    /// ever created, which is not stale.
    pub fn project_expired(&self) -> Result<bool> {
        Ok(get_group_impl(&self.conn, PROJECT_GROUP_NAME)?.is_some_and(|g| !g.fresh))
    }

    /// Number of project parameter rows.
    pub fn count_project_parameters(&self) -> Result<u64> {
        let count: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM project_parameters", [], |row| row.get(0))?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    // ====================
    // Database Parameters
    // ====================

    /// Create a database parameter. Auto-creates and stales the database's
    /// group.
    pub fn create_database_parameter(
        &mut self,
        database: &str,
        def: &ParameterDef,
    ) -> Result<DatabaseParameter> {
        let data = serde_json::to_string(&def.data)?;
        self.mutate(|tx, _host, ctx| {
            if database == PROJECT_GROUP_NAME {
                return Err(Error::Integrity(
                    "`project` is a reserved name and cannot be a database".to_string(),
                ));
            }
            tx.execute(
                "INSERT INTO database_parameters (database, name, amount, formula, data)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![database, def.name, def.amount, def.formula, data],
            )
            .map_err(|e| {
                map_constraint(
                    e,
                    format!("database parameter `{}` already exists in `{database}`", def.name),
                )
            })?;
            ctx.touch(database);
            debug!(database, name = %def.name, "created database parameter");
            Ok(DatabaseParameter {
                database: database.to_string(),
                name: def.name.clone(),
                amount: def.amount,
                formula: def.formula.clone(),
                data: def.data.clone(),
            })
        })
    }

    /// Get a database parameter by `(database, name)`.
    pub fn get_database_parameter(
        &self,
        database: &str,
        name: &str,
    ) -> Result<Option<DatabaseParameter>> {
        let row = self
            .conn
            .query_row(
                "SELECT database, name, amount, formula, data FROM database_parameters
                 WHERE database = ?1 AND name = ?2",
                rusqlite::params![database, name],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<f64>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()?;
        row.map(|(database, name, amount, formula, data)| {
            Ok(DatabaseParameter {
                database,
                name,
                amount,
                formula,
                data: parse_bag(&data)?,
            })
        })
        .transpose()
    }

    /// Partially update a database parameter.
    pub fn update_database_parameter(
        &mut self,
        database: &str,
        name: &str,
        update: &ParameterUpdate,
    ) -> Result<()> {
        let mut set_parts: Vec<&str> = Vec::new();
        let mut params: Vec<Box<dyn ToSql>> = Vec::new();
        if let Some(amount) = update.amount {
            set_parts.push("amount");
            params.push(Box::new(amount));
        }
        if let Some(formula) = &update.formula {
            set_parts.push("formula");
            params.push(Box::new(formula.clone()));
        }
        if let Some(data) = &update.data {
            set_parts.push("data");
            params.push(Box::new(serde_json::to_string(data)?));
        }
        if set_parts.is_empty() {
            return Ok(());
        }

        self.mutate(|tx, _host, ctx| {
            let rows = execute_update(
                tx,
                "database_parameters",
                &set_parts,
                params,
                "database = ? AND name = ?",
                &[&database.to_string(), &name.to_string()],
            )?;
            if rows == 0 {
                return Err(Error::NotFound(format!(
                    "database parameter `{name}` in `{database}`"
                )));
            }
            ctx.touch(database);
            Ok(())
        })
    }

    /// Delete a database parameter.
    pub fn delete_database_parameter(&mut self, database: &str, name: &str) -> Result<()> {
        self.mutate(|tx, _host, ctx| {
            let rows = tx.execute(
                "DELETE FROM database_parameters WHERE database = ?1 AND name = ?2",
                rusqlite::params![database, name],
            )?;
            if rows == 0 {
                return Err(Error::NotFound(format!(
                    "database parameter `{name}` in `{database}`"
                )));
            }
            ctx.touch(database);
            Ok(())
        })
    }

    /// All parameters of one database as name -> attribute bag.
    pub fn load_database_parameters(&self, database: &str) -> Result<BTreeMap<String, DataBag>> {
        let mut stmt = self.conn.prepare(
            "SELECT database, name, amount, formula, data FROM database_parameters
             WHERE database = ?1",
        )?;
        let rows = stmt.query_map([database], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<f64>>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut out = BTreeMap::new();
        for row in rows {
            let (database, name, amount, formula, data) = row?;
            let param = DatabaseParameter {
                database,
                name: name.clone(),
                amount,
                formula,
                data: parse_bag(&data)?,
            };
            let mut bag = param.dict();
            bag.remove("name");
            out.insert(name, bag);
        }
        Ok(out)
    }

    /// Stored amounts of one database scope.
    pub fn database_static(
        &self,
        database: &str,
        only: Option<&[&str]>,
    ) -> Result<BTreeMap<String, Option<f64>>> {
        database_static_impl(&self.conn, database, only)
    }

    /// Whether a database scope is stale.
    pub fn database_expired(&self, database: &str) -> Result<bool> {
        Ok(get_group_impl(&self.conn, database)?.is_some_and(|g| !g.fresh))
    }

    /// Number of database parameter rows (all databases).
    pub fn count_database_parameters(&self) -> Result<u64> {
        let count: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM database_parameters", [], |row| row.get(0))?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    // ====================
    // Activity Parameters
    // ====================

    /// Create an activity parameter in a group. Auto-creates and stales the
    /// group.
    ///
    /// # Errors
    ///
    /// `Integrity` when the group name is reserved or collides with a
    /// database name, when the group would span two databases, when the
    /// activity is already owned by another group, or on a `(group, name)`
    /// duplicate.
    pub fn create_activity_parameter(
        &mut self,
        group: &str,
        def: &ActivityParameterDef,
    ) -> Result<ActivityParameter> {
        let data = serde_json::to_string(&def.param.data)?;
        self.mutate(|tx, host, ctx| {
            check_activity_insert(tx, host, group, &def.database, &def.code)?;
            tx.execute(
                "INSERT INTO activity_parameters (group_name, database, code, name, amount, formula, data)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    group,
                    def.database,
                    def.code,
                    def.param.name,
                    def.param.amount,
                    def.param.formula,
                    data
                ],
            )
            .map_err(|e| {
                map_constraint(
                    e,
                    format!(
                        "activity parameter `{}` already exists in group `{group}`",
                        def.param.name
                    ),
                )
            })?;
            ctx.touch(group);
            debug!(group, name = %def.param.name, "created activity parameter");
            Ok(ActivityParameter {
                group: group.to_string(),
                database: def.database.clone(),
                code: def.code.clone(),
                name: def.param.name.clone(),
                amount: def.param.amount,
                formula: def.param.formula.clone(),
                data: def.param.data.clone(),
            })
        })
    }

    /// Get an activity parameter by `(group, name)`.
    pub fn get_activity_parameter(
        &self,
        group: &str,
        name: &str,
    ) -> Result<Option<ActivityParameter>> {
        self.activity_parameter_where(
            "group_name = ?1 AND name = ?2",
            rusqlite::params![group, name],
        )
    }

    /// Get an activity parameter by its activity key `(database, code)` and
    /// name.
    pub fn get_activity_parameter_by_activity(
        &self,
        database: &str,
        code: &str,
        name: &str,
    ) -> Result<Option<ActivityParameter>> {
        self.activity_parameter_where(
            "database = ?1 AND code = ?2 AND name = ?3",
            rusqlite::params![database, code, name],
        )
    }

    fn activity_parameter_where(
        &self,
        clause: &str,
        params: &[&dyn ToSql],
    ) -> Result<Option<ActivityParameter>> {
        let sql = format!(
            "SELECT group_name, database, code, name, amount, formula, data
             FROM activity_parameters WHERE {clause}"
        );
        let row = self
            .conn
            .query_row(&sql, params, |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<f64>>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, String>(6)?,
                ))
            })
            .optional()?;
        row.map(|(group, database, code, name, amount, formula, data)| {
            Ok(ActivityParameter {
                group,
                database,
                code,
                name,
                amount,
                formula,
                data: parse_bag(&data)?,
            })
        })
        .transpose()
    }

    /// Partially update an activity parameter.
    ///
    /// # Errors
    ///
    /// `Integrity` when the update names a different `database` or `code`:
    /// both pin the activity and are immutable after insert.
    pub fn update_activity_parameter(
        &mut self,
        group: &str,
        name: &str,
        update: &ActivityParameterUpdate,
    ) -> Result<()> {
        let mut set_parts: Vec<&str> = Vec::new();
        let mut params: Vec<Box<dyn ToSql>> = Vec::new();
        if let Some(amount) = update.amount {
            set_parts.push("amount");
            params.push(Box::new(amount));
        }
        if let Some(formula) = &update.formula {
            set_parts.push("formula");
            params.push(Box::new(formula.clone()));
        }
        if let Some(data) = &update.data {
            set_parts.push("data");
            params.push(Box::new(serde_json::to_string(data)?));
        }

        self.mutate(|tx, _host, ctx| {
            let current: Option<(String, String)> = tx
                .query_row(
                    "SELECT database, code FROM activity_parameters
                     WHERE group_name = ?1 AND name = ?2",
                    rusqlite::params![group, name],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            let Some((database, code)) = current else {
                return Err(Error::NotFound(format!(
                    "activity parameter `{name}` in group `{group}`"
                )));
            };

            if update.database.as_deref().is_some_and(|d| d != database) {
                return Err(Error::Integrity(
                    "activity parameter `database` is immutable".to_string(),
                ));
            }
            if update.code.as_deref().is_some_and(|c| c != code) {
                return Err(Error::Integrity(
                    "activity parameter `code` is immutable".to_string(),
                ));
            }

            if !set_parts.is_empty() {
                execute_update(
                    tx,
                    "activity_parameters",
                    &set_parts,
                    params,
                    "group_name = ? AND name = ?",
                    &[&group.to_string(), &name.to_string()],
                )?;
            }
            ctx.touch(group);
            Ok(())
        })
    }

    /// Delete an activity parameter.
    pub fn delete_activity_parameter(&mut self, group: &str, name: &str) -> Result<()> {
        self.mutate(|tx, _host, ctx| {
            let rows = tx.execute(
                "DELETE FROM activity_parameters WHERE group_name = ?1 AND name = ?2",
                rusqlite::params![group, name],
            )?;
            if rows == 0 {
                return Err(Error::NotFound(format!(
                    "activity parameter `{name}` in group `{group}`"
                )));
            }
            ctx.touch(group);
            Ok(())
        })
    }

    /// All parameters of one activity group as name -> attribute bag.
    pub fn load_activity_parameters(&self, group: &str) -> Result<BTreeMap<String, DataBag>> {
        let mut stmt = self.conn.prepare(
            "SELECT group_name, database, code, name, amount, formula, data
             FROM activity_parameters WHERE group_name = ?1",
        )?;
        let rows = stmt.query_map([group], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<f64>>(4)?,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, String>(6)?,
            ))
        })?;

        let mut out = BTreeMap::new();
        for row in rows {
            let (group, database, code, name, amount, formula, data) = row?;
            let param = ActivityParameter {
                group,
                database,
                code,
                name: name.clone(),
                amount,
                formula,
                data: parse_bag(&data)?,
            };
            let mut bag = param.dict();
            bag.remove("name");
            out.insert(name, bag);
        }
        Ok(out)
    }

    /// Stored amounts of one activity group.
    pub fn activity_static(
        &self,
        group: &str,
        only: Option<&[&str]>,
    ) -> Result<BTreeMap<String, Option<f64>>> {
        activity_static_impl(&self.conn, group, only)
    }

    /// Whether an activity group is stale.
    pub fn activity_expired(&self, group: &str) -> Result<bool> {
        Ok(get_group_impl(&self.conn, group)?.is_some_and(|g| !g.fresh))
    }

    /// Number of activity parameter rows (all groups).
    pub fn count_activity_parameters(&self) -> Result<u64> {
        let count: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM activity_parameters", [], |row| row.get(0))?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    // ========================
    // Parameterized Exchanges
    // ========================

    /// Attach a formula to an exchange of one of the group's activities.
    ///
    /// When the group already has activity parameters, the exchange id must
    /// belong to one of the group's activities per the host.
    pub fn create_parameterized_exchange(
        &mut self,
        group: &str,
        exchange: i64,
        formula: &str,
    ) -> Result<ParameterizedExchange> {
        self.mutate(|tx, host, ctx| {
            let activities = group_activities(tx, group)?;
            if !activities.is_empty() {
                let known = activities
                    .iter()
                    .any(|(db, code)| host.exchanges_for(db, code).contains(&exchange));
                if !known {
                    return Err(Error::Integrity(format!(
                        "exchange {exchange} does not belong to any activity of group `{group}`"
                    )));
                }
            }
            tx.execute(
                "INSERT INTO parameterized_exchanges (group_name, exchange, formula)
                 VALUES (?1, ?2, ?3)",
                rusqlite::params![group, exchange, formula],
            )
            .map_err(|e| {
                map_constraint(
                    e,
                    format!("exchange {exchange} is already parameterized in group `{group}`"),
                )
            })?;
            ctx.touch(group);
            Ok(ParameterizedExchange {
                group: group.to_string(),
                exchange,
                formula: formula.to_string(),
            })
        })
    }

    /// All parameterized exchanges of one group, by exchange id.
    pub fn load_parameterized_exchanges(&self, group: &str) -> Result<Vec<ParameterizedExchange>> {
        let mut stmt = self.conn.prepare(
            "SELECT group_name, exchange, formula FROM parameterized_exchanges
             WHERE group_name = ?1 ORDER BY exchange",
        )?;
        let rows = stmt
            .query_map([group], |row| {
                Ok(ParameterizedExchange {
                    group: row.get(0)?,
                    exchange: row.get(1)?,
                    formula: row.get(2)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Delete one parameterized exchange.
    pub fn delete_parameterized_exchange(&mut self, group: &str, exchange: i64) -> Result<()> {
        self.mutate(|tx, _host, ctx| {
            let rows = tx.execute(
                "DELETE FROM parameterized_exchanges WHERE group_name = ?1 AND exchange = ?2",
                rusqlite::params![group, exchange],
            )?;
            if rows == 0 {
                return Err(Error::NotFound(format!(
                    "parameterized exchange {exchange} in group `{group}`"
                )));
            }
            ctx.touch(group);
            Ok(())
        })
    }

    /// Number of parameterized exchange rows.
    pub fn count_parameterized_exchanges(&self) -> Result<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM parameterized_exchanges",
            [],
            |row| row.get(0),
        )?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    // ==============
    // Batch Upserts
    // ==============

    /// Insert-or-replace a batch of project parameters in one transaction.
    pub fn upsert_project_parameters(&mut self, defs: &[ParameterDef]) -> Result<()> {
        self.mutate(|tx, _host, ctx| {
            for def in defs {
                tx.execute(
                    "INSERT INTO project_parameters (name, amount, formula, data)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(name) DO UPDATE SET
                       amount = excluded.amount,
                       formula = excluded.formula,
                       data = excluded.data",
                    rusqlite::params![
                        def.name,
                        def.amount,
                        def.formula,
                        serde_json::to_string(&def.data)?
                    ],
                )?;
                ctx.touch(PROJECT_GROUP_NAME);
            }
            Ok(())
        })
    }

    /// Insert-or-replace a batch of database parameters in one transaction.
    pub fn upsert_database_parameters(
        &mut self,
        database: &str,
        defs: &[ParameterDef],
    ) -> Result<()> {
        self.mutate(|tx, _host, ctx| {
            if database == PROJECT_GROUP_NAME {
                return Err(Error::Integrity(
                    "`project` is a reserved name and cannot be a database".to_string(),
                ));
            }
            for def in defs {
                tx.execute(
                    "INSERT INTO database_parameters (database, name, amount, formula, data)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(database, name) DO UPDATE SET
                       amount = excluded.amount,
                       formula = excluded.formula,
                       data = excluded.data",
                    rusqlite::params![
                        database,
                        def.name,
                        def.amount,
                        def.formula,
                        serde_json::to_string(&def.data)?
                    ],
                )?;
                ctx.touch(database);
            }
            Ok(())
        })
    }

    /// Insert-or-replace a batch of activity parameters in one transaction.
    ///
    /// New rows pass the full activity integrity checks; existing rows keep
    /// their immutable `(database, code)` key, and a definition naming a
    /// different one is refused.
    pub fn upsert_activity_parameters(
        &mut self,
        group: &str,
        defs: &[ActivityParameterDef],
    ) -> Result<()> {
        self.mutate(|tx, host, ctx| {
            for def in defs {
                let current: Option<(String, String)> = tx
                    .query_row(
                        "SELECT database, code FROM activity_parameters
                         WHERE group_name = ?1 AND name = ?2",
                        rusqlite::params![group, def.param.name],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .optional()?;
                match current {
                    Some((database, code)) => {
                        if database != def.database || code != def.code {
                            return Err(Error::Integrity(format!(
                                "activity parameter `{}` is pinned to (`{database}`, `{code}`)",
                                def.param.name
                            )));
                        }
                        tx.execute(
                            "UPDATE activity_parameters
                             SET amount = ?1, formula = ?2, data = ?3
                             WHERE group_name = ?4 AND name = ?5",
                            rusqlite::params![
                                def.param.amount,
                                def.param.formula,
                                serde_json::to_string(&def.param.data)?,
                                group,
                                def.param.name
                            ],
                        )?;
                    }
                    None => {
                        check_activity_insert(tx, host, group, &def.database, &def.code)?;
                        tx.execute(
                            "INSERT INTO activity_parameters
                             (group_name, database, code, name, amount, formula, data)
                             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                            rusqlite::params![
                                group,
                                def.database,
                                def.code,
                                def.param.name,
                                def.param.amount,
                                def.param.formula,
                                serde_json::to_string(&def.param.data)?
                            ],
                        )?;
                    }
                }
                ctx.touch(group);
            }
            Ok(())
        })
    }

    // =================
    // Scope Dispatchers
    // =================

    /// [`Self::load_project_parameters`] /
    /// [`Self::load_database_parameters`] /
    /// [`Self::load_activity_parameters`] behind a typed scope.
    pub fn load(&self, scope: &Scope) -> Result<BTreeMap<String, DataBag>> {
        match scope {
            Scope::Project => self.load_project_parameters(),
            Scope::Database(db) => self.load_database_parameters(db),
            Scope::Activity(group) => self.load_activity_parameters(group),
        }
    }

    /// Stored amounts of one scope behind a typed scope.
    pub fn static_amounts(
        &self,
        scope: &Scope,
        only: Option<&[&str]>,
    ) -> Result<BTreeMap<String, Option<f64>>> {
        match scope {
            Scope::Project => self.project_static(only),
            Scope::Database(db) => self.database_static(db, only),
            Scope::Activity(group) => self.activity_static(group, only),
        }
    }

    /// Whether one scope is stale, behind a typed scope.
    pub fn expired(&self, scope: &Scope) -> Result<bool> {
        Ok(get_group_impl(&self.conn, scope.group_name())?.is_some_and(|g| !g.fresh))
    }

    /// Total parameter rows across the three tables.
    pub fn count_parameters(&self) -> Result<u64> {
        Ok(self.count_project_parameters()?
            + self.count_database_parameters()?
            + self.count_activity_parameters()?)
    }
}

// ── Shared helpers (used from both `&self` reads and transactions) ──

pub(crate) fn get_group_impl(conn: &Connection, name: &str) -> Result<Option<Group>> {
    let row = conn
        .query_row(
            "SELECT name, fresh, updated, order_list FROM groups WHERE name = ?1",
            [name],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, bool>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                ))
            },
        )
        .optional()?;
    row.map(|(name, fresh, updated, order)| {
        Ok(Group {
            name,
            fresh,
            updated,
            order: parse_order(&order)?,
        })
    })
    .transpose()
}

pub(crate) fn purge_order_impl(host: &dyn Host, order: &[String]) -> Vec<String> {
    order
        .iter()
        .filter(|name| name.as_str() != PROJECT_GROUP_NAME && !host.is_registered_database(name))
        .cloned()
        .collect()
}

pub(crate) fn expire_downstream_impl(conn: &Connection, name: &str) -> Result<()> {
    conn.execute(
        "WITH RECURSIVE down(name) AS (
             SELECT group_name FROM group_dependencies WHERE depends = ?1
             UNION
             SELECT gd.group_name FROM group_dependencies gd
             JOIN down ON gd.depends = down.name
         )
         UPDATE groups SET fresh = 0 WHERE name IN (SELECT name FROM down)",
        [name],
    )?;
    Ok(())
}

/// Whether adding `group -> depends` would close a cycle: true iff `depends`
/// already reaches `group` through existing edges.
fn would_create_cycle(conn: &Connection, group: &str, depends: &str) -> Result<bool> {
    let hit: bool = conn.query_row(
        "WITH RECURSIVE chain(name) AS (
             SELECT depends FROM group_dependencies WHERE group_name = ?1
             UNION
             SELECT gd.depends FROM group_dependencies gd
             JOIN chain ON gd.group_name = chain.name
         )
         SELECT EXISTS(SELECT 1 FROM chain WHERE name = ?2)",
        rusqlite::params![depends, group],
        |row| row.get(0),
    )?;
    Ok(hit)
}

/// Idempotently record an engine-discovered dependency edge. Self-edges are
/// skipped; a cycle is still an integrity violation.
pub(crate) fn ensure_dependency_impl(conn: &Connection, group: &str, depends: &str) -> Result<()> {
    if group == depends {
        return Ok(());
    }
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM group_dependencies WHERE group_name = ?1 AND depends = ?2)",
        rusqlite::params![group, depends],
        |row| row.get(0),
    )?;
    if exists {
        return Ok(());
    }
    if would_create_cycle(conn, group, depends)? {
        return Err(Error::Integrity(format!(
            "dependency `{group}` -> `{depends}` closes a cycle"
        )));
    }
    conn.execute(
        "INSERT INTO group_dependencies (group_name, depends) VALUES (?1, ?2)",
        rusqlite::params![group, depends],
    )?;
    Ok(())
}

fn static_query<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
    only: Option<&[&str]>,
) -> Result<BTreeMap<String, Option<f64>>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, Option<f64>>(1)?))
    })?;

    let mut out = BTreeMap::new();
    for row in rows {
        let (name, amount) = row?;
        if only.is_none_or(|names| names.contains(&name.as_str())) {
            out.insert(name, amount);
        }
    }
    Ok(out)
}

pub(crate) fn project_static_impl(
    conn: &Connection,
    only: Option<&[&str]>,
) -> Result<BTreeMap<String, Option<f64>>> {
    static_query(conn, "SELECT name, amount FROM project_parameters", [], only)
}

pub(crate) fn database_static_impl(
    conn: &Connection,
    database: &str,
    only: Option<&[&str]>,
) -> Result<BTreeMap<String, Option<f64>>> {
    static_query(
        conn,
        "SELECT name, amount FROM database_parameters WHERE database = ?1",
        [database],
        only,
    )
}

pub(crate) fn activity_static_impl(
    conn: &Connection,
    group: &str,
    only: Option<&[&str]>,
) -> Result<BTreeMap<String, Option<f64>>> {
    static_query(
        conn,
        "SELECT name, amount FROM activity_parameters WHERE group_name = ?1",
        [group],
        only,
    )
}

/// The distinct `(database, code)` activities of a group.
pub(crate) fn group_activities(conn: &Connection, group: &str) -> Result<Vec<(String, String)>> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT database, code FROM activity_parameters WHERE group_name = ?1",
    )?;
    let rows = stmt
        .query_map([group], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// The single database an activity group spans, if it has any rows.
pub(crate) fn group_database(conn: &Connection, group: &str) -> Result<Option<String>> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT database FROM activity_parameters WHERE group_name = ?1",
    )?;
    let mut databases = stmt
        .query_map([group], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    if databases.len() > 1 {
        return Err(Error::Integrity(format!(
            "group `{group}` spans multiple databases"
        )));
    }
    Ok(databases.pop())
}

fn check_activity_insert(
    conn: &Connection,
    host: &dyn Host,
    group: &str,
    database: &str,
    code: &str,
) -> Result<()> {
    if group == PROJECT_GROUP_NAME {
        return Err(Error::Integrity(
            "`project` is a reserved group name".to_string(),
        ));
    }
    if database == PROJECT_GROUP_NAME {
        return Err(Error::Integrity(
            "`project` is a reserved name and cannot be a database".to_string(),
        ));
    }
    // A group named after a database must be that database's own scope group.
    if group == database {
        if !host.is_registered_database(database) {
            return Err(Error::Integrity(format!(
                "group `{group}` collides with its database name"
            )));
        }
    } else if host.is_registered_database(group) {
        return Err(Error::Integrity(format!(
            "group `{group}` is a registered database name"
        )));
    }

    let other_database: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM activity_parameters
         WHERE group_name = ?1 AND database != ?2)",
        rusqlite::params![group, database],
        |row| row.get(0),
    )?;
    if other_database {
        return Err(Error::Integrity(format!(
            "group `{group}` already holds parameters from another database"
        )));
    }

    let other_group: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM activity_parameters
         WHERE database = ?1 AND code = ?2 AND group_name != ?3)",
        rusqlite::params![database, code, group],
        |row| row.get(0),
    )?;
    if other_group {
        return Err(Error::Integrity(format!(
            "activity (`{database}`, `{code}`) is already owned by another group"
        )));
    }

    Ok(())
}

/// Run a dynamic partial UPDATE; returns the affected row count.
///
/// One placeholder counter runs through the whole statement, so the bare
/// `?` markers in `where_clause` land after the SET bindings.
fn execute_update(
    conn: &Connection,
    table: &str,
    set_parts: &[&str],
    mut params: Vec<Box<dyn ToSql>>,
    where_clause: &str,
    where_params: &[&String],
) -> Result<usize> {
    let mut sql = format!("UPDATE {table} SET ");
    let mut n = 0;
    for field in set_parts {
        n += 1;
        if n > 1 {
            sql.push_str(", ");
        }
        sql.push_str(field);
        sql.push_str(&format!(" = ?{n}"));
    }

    sql.push_str(" WHERE ");
    for ch in where_clause.chars() {
        if ch == '?' {
            n += 1;
            sql.push_str(&format!("?{n}"));
        } else {
            sql.push(ch);
        }
    }
    for param in where_params {
        params.push(Box::new((*param).clone()));
    }

    let bindings: Vec<&dyn ToSql> = params.iter().map(AsRef::as_ref).collect();
    Ok(conn.execute(&sql, bindings.as_slice())?)
}
