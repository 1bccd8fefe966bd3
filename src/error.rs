//! Error types for the parameter engine.
//!
//! The error surface follows the engine's taxonomy:
//! - `Integrity` - a store invariant was violated (uniqueness, reserved
//!   names, immutability, cycles). Never recovered locally.
//! - `MissingName` - a formula references a name unbound after the full
//!   layered lookup.
//! - `InvalidDependency` - an illegal group dependency edge.
//! - `Batch` - a bulk-create precondition failed (duplicate names,
//!   unregistered database).
//!
//! Each error maps to a machine-readable [`ErrorCode`] for logging and for
//! callers that match on kind rather than message.

use thiserror::Error;

use crate::formula::FormulaError;

/// Result type alias for parameter engine operations.
pub type Result<T> = std::result::Result<T, Error>;

// ── Error Code ────────────────────────────────────────────────

/// Machine-readable error codes grouped by category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Integrity,
    MissingName,
    InvalidDependency,
    Batch,
    Formula,
    NotFound,
    Config,
    Database,
    Json,
}

impl ErrorCode {
    /// Machine-readable SCREAMING_SNAKE code string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Integrity => "INTEGRITY_ERROR",
            Self::MissingName => "MISSING_NAME",
            Self::InvalidDependency => "INVALID_DEPENDENCY",
            Self::Batch => "BATCH_ERROR",
            Self::Formula => "FORMULA_ERROR",
            Self::NotFound => "NOT_FOUND",
            Self::Config => "CONFIG_ERROR",
            Self::Database => "DATABASE_ERROR",
            Self::Json => "JSON_ERROR",
        }
    }

    /// Whether a caller should retry with corrected input.
    ///
    /// True for batch preconditions and formula problems a caller can fix
    /// by editing its input. False for integrity violations and I/O.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::MissingName | Self::InvalidDependency | Self::Batch | Self::Formula
        )
    }
}

// ── Error Enum ────────────────────────────────────────────────

/// Errors that can occur in parameter engine operations.
#[derive(Error, Debug)]
pub enum Error {
    /// A store invariant was violated: uniqueness, reserved names,
    /// immutability of activity keys, self-edges, or dependency cycles.
    #[error("integrity violation: {0}")]
    Integrity(String),

    /// A formula references a name unbound after the full layered lookup.
    #[error("formula references unknown name `{name}`")]
    MissingName { name: String },

    /// An illegal group dependency edge was requested.
    #[error("invalid group dependency: {0}")]
    InvalidDependency(String),

    /// A bulk-create precondition failed.
    #[error("invalid parameter batch: {0}")]
    Batch(String),

    /// A formula could not be parsed or evaluated.
    #[error("formula error: {0}")]
    Formula(FormulaError),

    /// A row named by a caller does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Store configuration could not be resolved.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Map this error to its structured [`ErrorCode`].
    #[must_use]
    pub const fn error_code(&self) -> ErrorCode {
        match self {
            Self::Integrity(_) => ErrorCode::Integrity,
            Self::MissingName { .. } => ErrorCode::MissingName,
            Self::InvalidDependency(_) => ErrorCode::InvalidDependency,
            Self::Batch(_) => ErrorCode::Batch,
            Self::Formula(_) => ErrorCode::Formula,
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::Config(_) => ErrorCode::Config,
            Self::Database(_) => ErrorCode::Database,
            Self::Json(_) => ErrorCode::Json,
        }
    }
}

impl From<FormulaError> for Error {
    fn from(err: FormulaError) -> Self {
        match err {
            FormulaError::MissingName(name) => Self::MissingName { name },
            other => Self::Formula(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let err = Error::Integrity("duplicate name".to_string());
        assert_eq!(err.error_code(), ErrorCode::Integrity);
        assert_eq!(err.error_code().as_str(), "INTEGRITY_ERROR");
        assert!(!err.error_code().is_retryable());

        let err = Error::Batch("duplicate names in batch".to_string());
        assert!(err.error_code().is_retryable());
    }

    #[test]
    fn test_missing_name_lifted_from_formula_error() {
        let err: Error = FormulaError::MissingName("foo".to_string()).into();
        assert!(matches!(err, Error::MissingName { ref name } if name == "foo"));

        let err: Error = FormulaError::DivisionByZero.into();
        assert!(matches!(err, Error::Formula(FormulaError::DivisionByZero)));
    }
}
