// ⚠️ Error taxonomy for the reconciliation core
//
// Input rejection (a raw record that cannot be normalized) is NOT an error:
// the normalizer drops it and the importer counts it. Everything here is
// something a caller has to react to.

use crate::model::MappingStatus;
use thiserror::Error;

/// Result type used across the library
pub type Result<T> = std::result::Result<T, ReconcileError>;

#[derive(Error, Debug)]
pub enum ReconcileError {
    /// Mapping, athlete or club id that does not exist
    #[error("{what} not found: {id}")]
    NotFound { what: &'static str, id: String },

    /// Attempt to leave a terminal mapping state (or a lost compare-and-swap)
    #[error("mapping {mapping_id} cannot move from {from} to {to}")]
    InvalidTransition {
        mapping_id: String,
        from: MappingStatus,
        to: MappingStatus,
    },

    /// Caller-supplied parameter out of range or malformed
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Request clashes with an existing decision (e.g. a team code already linked)
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    /// Failure reported by a remote raw-data source
    #[error("upstream source error: {0}")]
    Upstream(String),
}

impl ReconcileError {
    pub fn not_found(what: &'static str, id: impl Into<String>) -> Self {
        ReconcileError::NotFound {
            what,
            id: id.into(),
        }
    }

    /// Errors caused by the request itself rather than by a collaborator
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ReconcileError::NotFound { .. }
                | ReconcileError::InvalidTransition { .. }
                | ReconcileError::InvalidInput(_)
                | ReconcileError::Conflict(_)
        )
    }
}
