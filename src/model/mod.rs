//! Data models for the parameter engine.
//!
//! This module contains all row types:
//! - Group / GroupDependency
//! - ProjectParameter / DatabaseParameter / ActivityParameter
//! - ParameterizedExchange
//! - Scope (the three-level evaluation scope)

pub mod group;
pub mod parameter;
pub mod scope;

pub use group::{Group, GroupDependency, PROJECT_GROUP_NAME};
pub use parameter::{
    ActivityParameter, ActivityParameterDef, ActivityParameterUpdate, DataBag, DatabaseParameter,
    ParameterDef, ParameterUpdate, ParameterizedExchange, ProjectParameter, RESERVED_KEYS,
};
pub use scope::Scope;
