//! The three parameter kinds and parameterized exchanges.
//!
//! Every parameter row carries a name, a nullable computed `amount`, an
//! optional `formula`, and an opaque `data` bag that the engine stores and
//! returns without interpretation. The `dict()` accessors flatten the bag
//! into the row's attributes the way the host application consumes them.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::cmp::Ordering;

/// The opaque attribute bag attached to each parameter row.
pub type DataBag = serde_json::Map<String, Value>;

/// Keys stored as first-class columns; `data` entries with these keys are
/// dropped when flattening so they can never shadow the real columns.
pub const RESERVED_KEYS: &[&str] = &["name", "amount", "formula", "database", "code", "group"];

fn fold_data(bag: &mut DataBag, data: &DataBag) {
    for (key, value) in data {
        if !RESERVED_KEYS.contains(&key.as_str()) {
            bag.insert(key.clone(), value.clone());
        }
    }
}

// ── Rows ──────────────────────────────────────────────────────

/// A project-wide parameter. Conceptually lives in the reserved group
/// `"project"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectParameter {
    pub name: String,
    pub amount: Option<f64>,
    pub formula: Option<String>,
    pub data: DataBag,
}

impl ProjectParameter {
    /// Flatten the row into an attribute bag (`data` keys folded in, null
    /// columns omitted).
    #[must_use]
    pub fn dict(&self) -> DataBag {
        let mut bag = DataBag::new();
        fold_data(&mut bag, &self.data);
        bag.insert("name".to_string(), json!(self.name));
        if let Some(amount) = self.amount {
            bag.insert("amount".to_string(), json!(amount));
        }
        if let Some(formula) = &self.formula {
            bag.insert("formula".to_string(), json!(formula));
        }
        bag
    }
}

// Identity and ordering follow the unique `name` key; display sorting is
// lexicographic. Comparing a parameter to anything else does not type-check.
impl PartialEq for ProjectParameter {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for ProjectParameter {}

impl PartialOrd for ProjectParameter {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ProjectParameter {
    fn cmp(&self, other: &Self) -> Ordering {
        self.name.cmp(&other.name)
    }
}

/// A parameter scoped to one database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseParameter {
    pub database: String,
    pub name: String,
    pub amount: Option<f64>,
    pub formula: Option<String>,
    pub data: DataBag,
}

impl DatabaseParameter {
    /// Flatten the row into an attribute bag.
    #[must_use]
    pub fn dict(&self) -> DataBag {
        let mut bag = DataBag::new();
        fold_data(&mut bag, &self.data);
        bag.insert("database".to_string(), json!(self.database));
        bag.insert("name".to_string(), json!(self.name));
        if let Some(amount) = self.amount {
            bag.insert("amount".to_string(), json!(amount));
        }
        if let Some(formula) = &self.formula {
            bag.insert("formula".to_string(), json!(formula));
        }
        bag
    }
}

/// A parameter attached to one activity of one database, owned by an
/// activity group.
///
/// `database` and `code` pin the activity and are immutable after insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityParameter {
    pub group: String,
    pub database: String,
    pub code: String,
    pub name: String,
    pub amount: Option<f64>,
    pub formula: Option<String>,
    pub data: DataBag,
}

impl ActivityParameter {
    /// Flatten the row into an attribute bag. The owning group is implied by
    /// the lookup and is not part of the bag.
    #[must_use]
    pub fn dict(&self) -> DataBag {
        let mut bag = DataBag::new();
        fold_data(&mut bag, &self.data);
        bag.insert("database".to_string(), json!(self.database));
        bag.insert("code".to_string(), json!(self.code));
        bag.insert("name".to_string(), json!(self.name));
        if let Some(amount) = self.amount {
            bag.insert("amount".to_string(), json!(amount));
        }
        if let Some(formula) = &self.formula {
            bag.insert("formula".to_string(), json!(formula));
        }
        bag
    }
}

/// A formula bound to an external exchange record, identified by an opaque
/// integer id. `(group, exchange)` is unique.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterizedExchange {
    pub group: String,
    pub exchange: i64,
    pub formula: String,
}

// ── Input definitions ─────────────────────────────────────────

/// Input definition for creating or upserting a parameter.
///
/// Unknown JSON keys deserialize into the `data` bag, so a definition like
/// `{"name": "foo", "amount": 4, "uncertainty type": 0}` round-trips.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterDef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formula: Option<String>,
    #[serde(flatten)]
    pub data: DataBag,
}

impl ParameterDef {
    /// Create a definition with just a name.
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    /// Set the literal amount.
    #[must_use]
    pub fn with_amount(mut self, amount: f64) -> Self {
        self.amount = Some(amount);
        self
    }

    /// Set the formula.
    #[must_use]
    pub fn with_formula(mut self, formula: &str) -> Self {
        self.formula = Some(formula.to_string());
        self
    }

    /// Add one entry to the opaque data bag.
    #[must_use]
    pub fn with_data_entry(mut self, key: &str, value: Value) -> Self {
        self.data.insert(key.to_string(), value);
        self
    }
}

/// Input definition for an activity parameter: a [`ParameterDef`] plus the
/// activity key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActivityParameterDef {
    pub database: String,
    pub code: String,
    #[serde(flatten)]
    pub param: ParameterDef,
}

impl ActivityParameterDef {
    /// Create a definition for one activity.
    #[must_use]
    pub fn new(database: &str, code: &str, param: ParameterDef) -> Self {
        Self {
            database: database.to_string(),
            code: code.to_string(),
            param,
        }
    }
}

// ── Partial updates ───────────────────────────────────────────

/// Partial update for project and database parameters. Fields left `None`
/// are untouched; `formula: Some(None)` clears the formula.
#[derive(Debug, Clone, Default)]
pub struct ParameterUpdate {
    pub amount: Option<f64>,
    pub formula: Option<Option<String>>,
    pub data: Option<DataBag>,
}

impl ParameterUpdate {
    /// Update only the amount.
    #[must_use]
    pub fn amount(amount: f64) -> Self {
        Self {
            amount: Some(amount),
            ..Self::default()
        }
    }

    /// Update only the formula.
    #[must_use]
    pub fn formula(formula: &str) -> Self {
        Self {
            formula: Some(Some(formula.to_string())),
            ..Self::default()
        }
    }
}

/// Partial update for activity parameters.
///
/// `database` and `code` are present so that attempts to change them can be
/// rejected at runtime: both are immutable after insert.
#[derive(Debug, Clone, Default)]
pub struct ActivityParameterUpdate {
    pub database: Option<String>,
    pub code: Option<String>,
    pub amount: Option<f64>,
    pub formula: Option<Option<String>>,
    pub data: Option<DataBag>,
}

impl ActivityParameterUpdate {
    /// Update only the amount.
    #[must_use]
    pub fn amount(amount: f64) -> Self {
        Self {
            amount: Some(amount),
            ..Self::default()
        }
    }

    /// Update only the formula.
    #[must_use]
    pub fn formula(formula: &str) -> Self {
        Self {
            formula: Some(Some(formula.to_string())),
            ..Self::default()
        }
    }
}
