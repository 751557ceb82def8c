//! Error types for the triage engine

use thiserror::Error;

use crate::schema::ReportStatus;

pub type Result<T> = std::result::Result<T, TriageError>;

#[derive(Error, Debug)]
pub enum TriageError {
    /// Malformed or out-of-range input. Caller must correct and resubmit.
    #[error("Invalid {entity}.{field}: {message}")]
    Validation {
        entity: &'static str,
        field: String,
        message: String,
    },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Report {report_id} cannot move from {from} to {to}")]
    InvalidTransition {
        report_id: String,
        from: ReportStatus,
        to: ReportStatus,
    },

    /// Classifier unreachable, timed out, or returned unusable output.
    #[error("Analysis failed for report {report_id}: {reason}")]
    AnalysisFailure { report_id: String, reason: String },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Timestamp error: {0}")]
    Timestamp(#[from] time::error::Format),
}

impl TriageError {
    pub fn validation(
        entity: &'static str,
        field: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        TriageError::Validation {
            entity,
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        TriageError::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// True when retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            TriageError::AnalysisFailure { .. } => true,
            TriageError::Database(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}
