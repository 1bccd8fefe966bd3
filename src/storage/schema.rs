//! Database schema definitions.
//!
//! Five tables: groups, group dependencies, the three parameter kinds, and
//! parameterized exchanges. Opaque attribute bags and group order lists are
//! stored as JSON text. Timestamps are INTEGER Unix seconds: the freshness
//! model only promises second resolution.

use rusqlite::{Connection, Result};

/// Current schema version for migration tracking.
pub const CURRENT_SCHEMA_VERSION: i32 = 1;

/// The complete SQL schema for the parameter store.
pub const SCHEMA_SQL: &str = r"
-- ====================
-- Schema Version Tracking
-- ====================

CREATE TABLE IF NOT EXISTS schema_migrations (
    version TEXT PRIMARY KEY,
    applied_at INTEGER NOT NULL
);

-- ====================
-- Groups
-- ====================

-- One row per parameter group; `fresh` is the freshness flag, `updated`
-- advances on every parameter mutation in the group. `order_list` holds the
-- inherited activity groups as a JSON array.
CREATE TABLE IF NOT EXISTS groups (
    name TEXT PRIMARY KEY,
    fresh INTEGER NOT NULL DEFAULT 1,
    updated INTEGER NOT NULL,
    order_list TEXT NOT NULL DEFAULT '[]'
);

-- Dependency edges: group_name depends on depends. Acyclicity and scope
-- rules are enforced by the write wrapper; the self-edge ban lives here.
CREATE TABLE IF NOT EXISTS group_dependencies (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    group_name TEXT NOT NULL,
    depends TEXT NOT NULL,
    UNIQUE(group_name, depends),
    CHECK (group_name != depends)
);

CREATE INDEX IF NOT EXISTS idx_group_dependencies_depends ON group_dependencies(depends);

-- ====================
-- Parameters
-- ====================

CREATE TABLE IF NOT EXISTS project_parameters (
    name TEXT PRIMARY KEY,
    amount REAL,
    formula TEXT,
    data TEXT NOT NULL DEFAULT '{}'
);

CREATE TABLE IF NOT EXISTS database_parameters (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    database TEXT NOT NULL,
    name TEXT NOT NULL,
    amount REAL,
    formula TEXT,
    data TEXT NOT NULL DEFAULT '{}',
    UNIQUE(database, name)
);

CREATE INDEX IF NOT EXISTS idx_database_parameters_database ON database_parameters(database);

CREATE TABLE IF NOT EXISTS activity_parameters (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    group_name TEXT NOT NULL,
    database TEXT NOT NULL,
    code TEXT NOT NULL,
    name TEXT NOT NULL,
    amount REAL,
    formula TEXT,
    data TEXT NOT NULL DEFAULT '{}',
    UNIQUE(group_name, name)
);

CREATE INDEX IF NOT EXISTS idx_activity_parameters_group ON activity_parameters(group_name);
CREATE INDEX IF NOT EXISTS idx_activity_parameters_activity ON activity_parameters(database, code);

-- ====================
-- Parameterized Exchanges
-- ====================

CREATE TABLE IF NOT EXISTS parameterized_exchanges (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    group_name TEXT NOT NULL,
    exchange INTEGER NOT NULL,
    formula TEXT NOT NULL,
    UNIQUE(group_name, exchange)
);

CREATE INDEX IF NOT EXISTS idx_parameterized_exchanges_group ON parameterized_exchanges(group_name);
";

/// Create all tables and indexes on a fresh or existing connection.
///
/// Safe to run on every open: the DDL is `IF NOT EXISTS` throughout, and the
/// version row is written at most once.
///
/// # Errors
///
/// Returns an error if connection tuning or the DDL fails.
pub fn apply_schema(conn: &Connection) -> Result<()> {
    // Connection tuning must happen before any table is touched.
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;

    conn.execute_batch(SCHEMA_SQL)?;

    let version = format!("v{CURRENT_SCHEMA_VERSION}");
    let recorded: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM schema_migrations WHERE version = ?1)",
        [&version],
        |row| row.get(0),
    )?;
    if !recorded {
        conn.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
            rusqlite::params![version, chrono::Utc::now().timestamp()],
        )?;
    }

    Ok(())
}
