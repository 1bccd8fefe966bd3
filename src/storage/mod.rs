//! SQLite storage layer for the parameter engine.
//!
//! This module provides the persistence layer using SQLite with:
//! - WAL mode for concurrent reads
//! - Transaction discipline: every public mutation runs in one IMMEDIATE
//!   transaction through a single `mutate` path
//! - Integrity checks (uniqueness, reserved names, immutability, cycles)
//!   enforced in the write wrappers rather than host-database triggers
//! - Group freshness and timestamp bookkeeping as part of the same
//!   transaction as the triggering write
//!
//! # Submodules
//!
//! - [`schema`] - Database schema definitions
//! - [`sqlite`] - Main store implementation
//! - [`recalc`] - The recalculation engine

pub mod recalc;
pub mod schema;
pub mod sqlite;

pub use sqlite::{MutationContext, ParameterStore};
