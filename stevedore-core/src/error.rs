//! Error types for STEVEDORE operations

use thiserror::Error;

/// Shape resolution errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ShapeError {
    #[error("The member '{member}' has not been found on entity '{entity}'")]
    UnknownMember { member: String, entity: String },

    #[error("Unsupported shape on entity '{entity}', navigation '{navigation}': {reason}")]
    UnsupportedShape {
        entity: String,
        navigation: String,
        reason: String,
    },
}

/// Failures reported by the bulk-load transport or the DDL executor.
///
/// Every variant carries the table identifier so the failure can be
/// diagnosed without the surrounding call stack.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Table {table} does not exist")]
    TableMissing { table: String },

    #[error("Constraint violation on {table}.{column}: {reason}")]
    ConstraintViolation {
        table: String,
        column: String,
        reason: String,
    },

    #[error("Connection failure while accessing {table}: {reason}")]
    Connection { table: String, reason: String },

    #[error("{operation} failed for {table}: {reason}")]
    Failed {
        table: String,
        operation: String,
        reason: String,
    },
}

impl TransportError {
    /// Identifier of the table the failure is about.
    pub fn table(&self) -> &str {
        match self {
            TransportError::TableMissing { table }
            | TransportError::ConstraintViolation { table, .. }
            | TransportError::Connection { table, .. }
            | TransportError::Failed { table, .. } => table,
        }
    }
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Incompatible options: {option_a} and {option_b}")]
    IncompatibleOptions { option_a: String, option_b: String },

    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },
}

/// Master error type for all STEVEDORE errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StevedoreError {
    #[error("Invalid argument '{argument}': {reason}")]
    InvalidArgument { argument: String, reason: String },

    #[error("Cannot create primary key on {table}, missing columns: {}", .columns.join(", "))]
    MissingKeyColumns { table: String, columns: Vec<String> },

    #[error("Shape error: {0}")]
    Shape(#[from] ShapeError),

    #[error("Transport failure: {0}")]
    Transport(#[from] TransportError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Cannot access a disposed object: {object}")]
    Disposed { object: String },

    #[error("Operation cancelled: {operation}")]
    Cancelled { operation: String },

    #[error("Lock poisoned: {resource}")]
    LockPoisoned { resource: String },
}

impl StevedoreError {
    pub fn invalid_argument(argument: impl Into<String>, reason: impl Into<String>) -> Self {
        StevedoreError::InvalidArgument {
            argument: argument.into(),
            reason: reason.into(),
        }
    }

    pub fn disposed(object: impl Into<String>) -> Self {
        StevedoreError::Disposed {
            object: object.into(),
        }
    }

    pub fn cancelled(operation: impl Into<String>) -> Self {
        StevedoreError::Cancelled {
            operation: operation.into(),
        }
    }

    /// Null/empty inputs, empty column sets and missing key columns.
    pub fn is_invalid_argument(&self) -> bool {
        matches!(
            self,
            StevedoreError::InvalidArgument { .. } | StevedoreError::MissingKeyColumns { .. }
        )
    }

    pub fn is_unknown_member(&self) -> bool {
        matches!(self, StevedoreError::Shape(ShapeError::UnknownMember { .. }))
    }

    pub fn is_unsupported_shape(&self) -> bool {
        matches!(self, StevedoreError::Shape(ShapeError::UnsupportedShape { .. }))
    }

    pub fn is_transport_failure(&self) -> bool {
        matches!(self, StevedoreError::Transport(_))
    }

    pub fn is_disposed(&self) -> bool {
        matches!(self, StevedoreError::Disposed { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, StevedoreError::Cancelled { .. })
    }
}

/// Result type alias for STEVEDORE operations.
pub type StevedoreResult<T> = Result<T, StevedoreError>;

// =============================================================================
// TESTS
// =============================================================================
