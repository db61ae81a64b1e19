//! Error types for histogram filling.

use thiserror::Error;

/// Errors raised while registering, filling or merging histograms.
#[derive(Error, Debug)]
pub enum HistError {
    /// I/O error while reading a run configuration.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Run configuration could not be parsed.
    #[error("config error: {0}")]
    Config(#[from] serde_json::Error),

    /// Histogram definition rejected at registration.
    #[error("invalid definition '{name}': {reason}")]
    InvalidDefinition {
        /// Histogram name.
        name: String,
        /// Why the definition was rejected.
        reason: String,
    },

    /// Expression text could not be compiled against the schema.
    #[error("cannot compile '{expr}': {reason}")]
    CompileError {
        /// Expression source text.
        expr: String,
        /// Parser or resolver message.
        reason: String,
    },

    /// Jagged values that must be paired slot-by-slot have different lengths.
    #[error("cardinality mismatch in '{expr}': expected {expected} values, got {found}")]
    CardinalityMismatch {
        /// Expression whose slot count disagreed.
        expr: String,
        /// Slot count established by the group representative.
        expected: usize,
        /// Slot count actually produced.
        found: usize,
    },

    /// Expression could not be evaluated for a record.
    #[error("evaluation error in '{expr}': {reason}")]
    Evaluation {
        /// Expression source text.
        expr: String,
        /// What went wrong.
        reason: String,
    },

    /// Two partial results cannot be combined.
    #[error("cannot merge histogram '{name}': {reason}")]
    MergeShapeMismatch {
        /// Histogram name (or `*` for set-level mismatches).
        name: String,
        /// Which property differed.
        reason: String,
    },

    /// Record batch columns are inconsistent.
    #[error("invalid record batch: {0}")]
    InvalidBatch(String),

    /// Worker thread pool could not be created.
    #[error("failed to create thread pool: {0}")]
    ThreadPool(String),
}

impl HistError {
    pub(crate) fn invalid_definition(name: &str, reason: impl Into<String>) -> Self {
        HistError::InvalidDefinition { name: name.to_string(), reason: reason.into() }
    }

    pub(crate) fn compile(expr: &str, reason: impl Into<String>) -> Self {
        HistError::CompileError { expr: expr.to_string(), reason: reason.into() }
    }

    pub(crate) fn merge_shape(name: &str, reason: impl Into<String>) -> Self {
        HistError::MergeShapeMismatch { name: name.to_string(), reason: reason.into() }
    }

    /// `true` for errors that only invalidate one record's contribution.
    pub fn is_per_record(&self) -> bool {
        matches!(self, HistError::CardinalityMismatch { .. } | HistError::Evaluation { .. })
    }
}

/// Result alias for histogram filling operations.
pub type Result<T> = std::result::Result<T, HistError>;
