//! Parameter groups and the dependency relation between them.

use serde::{Deserialize, Serialize};

/// Reserved group name for project-scope parameters.
///
/// It may never appear as a database name, as an activity parameter's group,
/// or as the `group` side of a dependency edge.
pub const PROJECT_GROUP_NAME: &str = "project";

/// A named bundle of parameters that recalculate together.
///
/// `fresh` is the freshness flag: true iff every formula-bearing parameter in
/// the group has been evaluated against the current values of its
/// dependencies. `updated` advances (wall-clock seconds) on every parameter
/// mutation in the group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub name: String,
    pub fresh: bool,
    /// Unix timestamp, second resolution.
    pub updated: i64,
    /// Other activity groups whose evaluated values this group inherits, in
    /// precedence order. Project and database scopes are always inherited
    /// implicitly and are purged from this list on write.
    pub order: Vec<String>,
}

/// A directed dependency edge: `group` depends on `depends`.
///
/// The relation must stay a DAG; `"project"` may only ever be depended on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupDependency {
    pub group: String,
    pub depends: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_serde_round_trip() {
        let group = Group {
            name: "heat pumps".to_string(),
            fresh: false,
            updated: 1_700_000_000,
            order: vec!["chillers".to_string()],
        };
        let json = serde_json::to_string(&group).unwrap();
        let back: Group = serde_json::from_str(&json).unwrap();
        assert_eq!(back, group);
    }
}
