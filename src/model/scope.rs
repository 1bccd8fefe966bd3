//! Evaluation scopes.
//!
//! A parameter participates in exactly one of three symbol-table layers.
//! Activity groups may look upward into database and project scope; the
//! reverse direction does not exist, and taking `Scope` as a typed argument
//! keeps that upward-only rule out of the realm of runtime string checks.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::group::PROJECT_GROUP_NAME;

/// One of the three parameter scopes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "scope", content = "name")]
pub enum Scope {
    /// Project-wide parameters; group name `"project"`.
    Project,
    /// Parameters of one database.
    Database(String),
    /// Parameters of one activity group.
    Activity(String),
}

impl Scope {
    /// The group name that carries this scope's freshness flag.
    #[must_use]
    pub fn group_name(&self) -> &str {
        match self {
            Self::Project => PROJECT_GROUP_NAME,
            Self::Database(name) | Self::Activity(name) => name,
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Project => write!(f, "project"),
            Self::Database(name) => write!(f, "database={name}"),
            Self::Activity(name) => write!(f, "activity-group={name}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_names() {
        assert_eq!(Scope::Project.group_name(), "project");
        assert_eq!(Scope::Database("db".to_string()).group_name(), "db");
        assert_eq!(Scope::Activity("grp".to_string()).group_name(), "grp");
    }

    #[test]
    fn test_display() {
        assert_eq!(Scope::Project.to_string(), "project");
        assert_eq!(Scope::Database("db".to_string()).to_string(), "database=db");
        assert_eq!(
            Scope::Activity("grp".to_string()).to_string(),
            "activity-group=grp"
        );
    }
}
