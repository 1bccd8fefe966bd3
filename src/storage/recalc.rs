//! The recalculation engine.
//!
//! Per-scope drivers evaluate every formula-bearing row of a scope in
//! topological order against the layered symbol table, write the results
//! back, mark the scope's group fresh, and stale everything downstream.
//! Each per-scope pass is one transaction: a failure rolls back every amount
//! it wrote and leaves the target group stale.
//!
//! Calling a scope directly first brings its upstream scopes (project, the
//! group's database, inherited groups) up to date, so a single call
//! converges without a prior global pass. The global pass visits project,
//! then databases, then activity groups in dependency order.

use std::collections::{BTreeMap, BTreeSet};

use rusqlite::Connection;
use tracing::debug;

use crate::error::{Error, Result};
use crate::formula::{eval, free_names, parse, BuiltinTable, FormulaError};
use crate::model::{Scope, PROJECT_GROUP_NAME};
use crate::storage::sqlite::{
    activity_static_impl, database_static_impl, ensure_dependency_impl, expire_downstream_impl,
    group_database, project_static_impl, ParameterStore,
};

/// Which layer of the symbol table resolved a name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum Layer {
    Project,
    Database(String),
    Inherited(String),
    Own,
}

#[derive(Debug)]
struct LayeredSymbol {
    value: Option<f64>,
    layer: Layer,
}

type LayeredTable = BTreeMap<String, LayeredSymbol>;

fn overlay(table: &mut LayeredTable, values: BTreeMap<String, Option<f64>>, layer: &Layer) {
    for (name, value) in values {
        table.insert(
            name,
            LayeredSymbol {
                value,
                layer: layer.clone(),
            },
        );
    }
}

struct ScopeEvaluation {
    /// `(name, amount)` in evaluation order.
    amounts: Vec<(String, f64)>,
    /// Layers other than the scope's own that resolved at least one name.
    used_layers: BTreeSet<Layer>,
}

/// Topologically evaluate the formula rows of one scope.
///
/// Rows may reference each other (edges from free names to row names), any
/// value in `table`, and builtins. Unknown names are `MissingName`; defined
/// names whose amount was never computed are `Unset`; loops among the rows
/// are `Circular`.
fn evaluate_scope(
    formulas: &[(String, String)],
    table: &LayeredTable,
    builtins: &BuiltinTable,
) -> Result<ScopeEvaluation> {
    let row_names: BTreeSet<&str> = formulas.iter().map(|(name, _)| name.as_str()).collect();

    let mut parsed = BTreeMap::new();
    for (name, formula) in formulas {
        let expr = parse(formula).map_err(Error::from)?;
        let free = free_names(&expr, builtins);
        parsed.insert(name.clone(), (expr, free));
    }

    // Validate every non-row reference up front and record the layers used.
    let mut used_layers = BTreeSet::new();
    for (_, free) in parsed.values() {
        for dep in free {
            if row_names.contains(dep.as_str()) {
                continue;
            }
            match table.get(dep) {
                None => return Err(FormulaError::MissingName(dep.clone()).into()),
                Some(symbol) => {
                    if symbol.layer != Layer::Own {
                        used_layers.insert(symbol.layer.clone());
                    }
                    if symbol.value.is_none() {
                        return Err(FormulaError::Unset(dep.clone()).into());
                    }
                }
            }
        }
    }

    let mut symbols: BTreeMap<String, f64> = table
        .iter()
        .filter_map(|(name, symbol)| symbol.value.map(|v| (name.clone(), v)))
        .collect();

    // Kahn's algorithm; ties resolve in name order for determinism.
    let mut pending: BTreeMap<String, BTreeSet<String>> = parsed
        .iter()
        .map(|(name, (_, free))| {
            let deps = free
                .iter()
                .filter(|dep| row_names.contains(dep.as_str()))
                .cloned()
                .collect();
            (name.clone(), deps)
        })
        .collect();

    let mut amounts = Vec::with_capacity(parsed.len());
    loop {
        let Some(name) = pending
            .iter()
            .find(|(_, deps)| deps.is_empty())
            .map(|(name, _)| name.clone())
        else {
            break;
        };
        pending.remove(&name);

        let (expr, _) = &parsed[&name];
        let amount = eval(expr, &symbols, builtins).map_err(Error::from)?;
        symbols.insert(name.clone(), amount);
        for deps in pending.values_mut() {
            deps.remove(&name);
        }
        amounts.push((name, amount));
    }

    if let Some(name) = pending.keys().next() {
        return Err(FormulaError::Circular(name.clone()).into());
    }

    Ok(ScopeEvaluation {
        amounts,
        used_layers,
    })
}

fn formula_rows<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> Result<Vec<(String, String)>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

impl ParameterStore {
    /// Recalculate the project scope.
    ///
    /// Fast path: no `project` group, or a fresh one, returns immediately.
    /// Free names must resolve within project scope.
    pub fn recalculate_project(&mut self) -> Result<()> {
        let Some(group) = self.get_group(PROJECT_GROUP_NAME)? else {
            return Ok(());
        };
        if group.fresh {
            return Ok(());
        }
        debug!("recalculating project scope");

        self.mutate(|tx, host, _ctx| {
            let mut table = LayeredTable::new();
            overlay(&mut table, project_static_impl(tx, None)?, &Layer::Own);

            let formulas = formula_rows(
                tx,
                "SELECT name, formula FROM project_parameters WHERE formula IS NOT NULL",
                [],
            )?;
            let outcome = evaluate_scope(&formulas, &table, &host.builtins())?;

            for (name, amount) in &outcome.amounts {
                tx.execute(
                    "UPDATE project_parameters SET amount = ?1 WHERE name = ?2",
                    rusqlite::params![amount, name],
                )?;
            }

            tx.execute(
                "UPDATE groups SET fresh = 1 WHERE name = ?1",
                [PROJECT_GROUP_NAME],
            )?;
            expire_downstream_impl(tx, PROJECT_GROUP_NAME)?;
            Ok(())
        })
    }

    /// Recalculate one database scope.
    ///
    /// Brings the project scope up to date first when it is expired. A free
    /// name that resolves only through project scope creates the
    /// `(database, "project")` dependency edge as a stale-propagation hook.
    pub fn recalculate_database(&mut self, database: &str) -> Result<()> {
        let Some(group) = self.get_group(database)? else {
            return Ok(());
        };
        if group.fresh {
            return Ok(());
        }
        if self.project_expired()? {
            self.recalculate_project()?;
        }
        debug!(database, "recalculating database scope");

        self.mutate(|tx, host, _ctx| {
            let mut table = LayeredTable::new();
            overlay(&mut table, project_static_impl(tx, None)?, &Layer::Project);
            overlay(
                &mut table,
                database_static_impl(tx, database, None)?,
                &Layer::Own,
            );

            let formulas = formula_rows(
                tx,
                "SELECT name, formula FROM database_parameters
                 WHERE database = ?1 AND formula IS NOT NULL",
                [database],
            )?;
            let outcome = evaluate_scope(&formulas, &table, &host.builtins())?;

            for (name, amount) in &outcome.amounts {
                tx.execute(
                    "UPDATE database_parameters SET amount = ?1
                     WHERE database = ?2 AND name = ?3",
                    rusqlite::params![amount, database, name],
                )?;
            }

            if outcome.used_layers.contains(&Layer::Project) {
                ensure_dependency_impl(tx, database, PROJECT_GROUP_NAME)?;
            }

            tx.execute("UPDATE groups SET fresh = 1 WHERE name = ?1", [database])?;
            expire_downstream_impl(tx, database)?;
            Ok(())
        })
    }

    /// Recalculate one activity group.
    ///
    /// Brings project scope, the group's database scope, and every expired
    /// inherited group up to date first, then evaluates against the layered
    /// table (project, database, inherited groups in order, own rows on
    /// top). Every foreign layer that resolved a name gets a dependency
    /// edge.
    pub fn recalculate_activity(&mut self, group: &str) -> Result<()> {
        let mut stack = Vec::new();
        self.recalculate_activity_inner(group, &mut stack)
    }

    fn recalculate_activity_inner(&mut self, group: &str, stack: &mut Vec<String>) -> Result<()> {
        let Some(row) = self.get_group(group)? else {
            return Ok(());
        };
        if row.fresh {
            return Ok(());
        }
        if stack.iter().any(|g| g == group) {
            return Err(Error::Integrity(format!(
                "inheritance loop through group `{group}`"
            )));
        }
        stack.push(group.to_string());

        if self.project_expired()? {
            self.recalculate_project()?;
        }
        let database = group_database(self.conn(), group)?;
        if let Some(db) = &database {
            if self.database_expired(db)? {
                self.recalculate_database(db)?;
            }
        }
        for inherited in &row.order {
            if self.activity_expired(inherited)? {
                self.recalculate_activity_inner(inherited, stack)?;
            }
        }
        debug!(group, "recalculating activity group");

        let result = self.mutate(|tx, host, _ctx| {
            let mut table = LayeredTable::new();
            overlay(&mut table, project_static_impl(tx, None)?, &Layer::Project);
            if let Some(db) = &database {
                overlay(
                    &mut table,
                    database_static_impl(tx, db, None)?,
                    &Layer::Database(db.clone()),
                );
            }
            for inherited in &row.order {
                overlay(
                    &mut table,
                    activity_static_impl(tx, inherited, None)?,
                    &Layer::Inherited(inherited.clone()),
                );
            }
            overlay(
                &mut table,
                activity_static_impl(tx, group, None)?,
                &Layer::Own,
            );

            let formulas = formula_rows(
                tx,
                "SELECT name, formula FROM activity_parameters
                 WHERE group_name = ?1 AND formula IS NOT NULL",
                [group],
            )?;
            let outcome = evaluate_scope(&formulas, &table, &host.builtins())?;

            for (name, amount) in &outcome.amounts {
                tx.execute(
                    "UPDATE activity_parameters SET amount = ?1
                     WHERE group_name = ?2 AND name = ?3",
                    rusqlite::params![amount, group, name],
                )?;
            }

            for layer in &outcome.used_layers {
                match layer {
                    Layer::Project => ensure_dependency_impl(tx, group, PROJECT_GROUP_NAME)?,
                    Layer::Database(db) => ensure_dependency_impl(tx, group, db)?,
                    Layer::Inherited(inherited) => ensure_dependency_impl(tx, group, inherited)?,
                    Layer::Own => {}
                }
            }

            tx.execute("UPDATE groups SET fresh = 1 WHERE name = ?1", [group])?;
            expire_downstream_impl(tx, group)?;
            Ok(())
        });

        stack.pop();
        result
    }

    /// Recalculate one scope behind a typed scope value.
    pub fn recalculate(&mut self, scope: &Scope) -> Result<()> {
        match scope {
            Scope::Project => self.recalculate_project(),
            Scope::Database(db) => self.recalculate_database(db),
            Scope::Activity(group) => self.recalculate_activity(group),
        }
    }

    /// Evaluate the exchange formulas of a group against its layered table.
    ///
    /// The group is recalculated first when stale. Amounts are returned to
    /// the host, which owns the exchange records; nothing is written here.
    pub fn recalculate_exchanges(&mut self, group: &str) -> Result<Vec<(i64, f64)>> {
        self.recalculate_activity(group)?;

        let exchanges = self.load_parameterized_exchanges(group)?;
        if exchanges.is_empty() {
            return Ok(Vec::new());
        }

        let order = self
            .get_group(group)?
            .map(|g| g.order)
            .unwrap_or_default();
        let database = group_database(self.conn(), group)?;

        let mut table = LayeredTable::new();
        overlay(
            &mut table,
            project_static_impl(self.conn(), None)?,
            &Layer::Project,
        );
        if let Some(db) = &database {
            overlay(
                &mut table,
                database_static_impl(self.conn(), db, None)?,
                &Layer::Database(db.clone()),
            );
        }
        for inherited in &order {
            overlay(
                &mut table,
                activity_static_impl(self.conn(), inherited, None)?,
                &Layer::Inherited(inherited.clone()),
            );
        }
        overlay(
            &mut table,
            activity_static_impl(self.conn(), group, None)?,
            &Layer::Own,
        );

        let builtins = self.host().builtins();
        let symbols: BTreeMap<String, f64> = table
            .iter()
            .filter_map(|(name, symbol)| symbol.value.map(|v| (name.clone(), v)))
            .collect();

        let mut out = Vec::with_capacity(exchanges.len());
        for exchange in exchanges {
            let expr = parse(&exchange.formula).map_err(Error::from)?;
            for name in free_names(&expr, &builtins) {
                match table.get(&name) {
                    None => return Err(FormulaError::MissingName(name).into()),
                    Some(symbol) if symbol.value.is_none() => {
                        return Err(FormulaError::Unset(name).into());
                    }
                    Some(_) => {}
                }
            }
            let amount = eval(&expr, &symbols, &builtins).map_err(Error::from)?;
            out.push((exchange.exchange, amount));
        }
        Ok(out)
    }

    /// The global recalculation pass: project, then every database with
    /// parameters (name order), then activity groups in dependency order.
    /// One pass converges to the freshness invariant.
    pub fn recalculate_all(&mut self) -> Result<()> {
        self.recalculate_project()?;

        let databases: Vec<String> = {
            let mut stmt = self
                .conn()
                .prepare("SELECT DISTINCT database FROM database_parameters ORDER BY database")?;
            let rows = stmt
                .query_map([], |row| row.get(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows
        };
        for database in &databases {
            self.recalculate_database(database)?;
        }

        let groups: Vec<String> = {
            let mut stmt = self
                .conn()
                .prepare("SELECT DISTINCT group_name FROM activity_parameters ORDER BY group_name")?;
            let rows = stmt
                .query_map([], |row| row.get(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows
        };
        for group in topo_groups(self.conn(), &groups)? {
            self.recalculate_activity(&group)?;
        }
        Ok(())
    }
}

/// Order activity groups so every group follows the groups it depends on.
/// Edges to scopes outside the set (project, databases) are already
/// satisfied by the time groups run. Name order breaks ties.
fn topo_groups(conn: &Connection, groups: &[String]) -> Result<Vec<String>> {
    let in_set: BTreeSet<&str> = groups.iter().map(String::as_str).collect();

    let mut pending: BTreeMap<&str, BTreeSet<String>> = BTreeMap::new();
    for group in groups {
        let mut stmt = conn.prepare(
            "SELECT depends FROM group_dependencies WHERE group_name = ?1",
        )?;
        let deps = stmt
            .query_map([group], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?
            .into_iter()
            .filter(|dep| in_set.contains(dep.as_str()))
            .collect();
        pending.insert(group, deps);
    }

    let mut order = Vec::with_capacity(groups.len());
    while !pending.is_empty() {
        let Some(next) = pending
            .iter()
            .find(|(_, deps)| deps.is_empty())
            .map(|(name, _)| (*name).to_string())
        else {
            // The store refuses cycles at edge insert, so this is dead under
            // normal operation.
            return Err(Error::Integrity(
                "activity groups form a dependency cycle".to_string(),
            ));
        };
        pending.remove(next.as_str());
        for deps in pending.values_mut() {
            deps.remove(&next);
        }
        order.push(next);
    }
    Ok(order)
}
