use serde_json::json;
use thiserror::Error;

use crate::sync::SyncError;

/// Errors surfaced by composer, release and simulation operations.
#[derive(Debug, Error)]
pub enum AssignError {
    #[error("{0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("an assignment named {name:?} already exists in this course")]
    DuplicateName { name: String },

    #[error("score sync failed: {0}")]
    SyncDelivery(#[from] SyncError),

    #[error("duplicating {source_name:?} failed after {completed} copies: {cause}")]
    PartialBulkFailure {
        source_assignment_id: String,
        source_name: String,
        completed: usize,
        cause: Box<AssignError>,
    },

    #[error(transparent)]
    Db(#[from] rusqlite::Error),
}

impl AssignError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "bad_params",
            Self::NotFound(_) => "not_found",
            Self::DuplicateName { .. } => "duplicate_name",
            Self::SyncDelivery(_) => "sync_delivery_failed",
            Self::PartialBulkFailure { .. } => "partial_bulk_failure",
            Self::Db(_) => "db_query_failed",
        }
    }

    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            Self::DuplicateName { name } => Some(json!({ "name": name })),
            Self::SyncDelivery(e) => {
                let mut details = json!({ "transient": e.is_transient() });
                if let SyncError::Incomplete {
                    delivered,
                    failures,
                    ..
                } = e
                {
                    details["delivered"] = json!(delivered);
                    details["failed"] = json!(failures.len());
                    details["failedUsers"] =
                        json!(failures.iter().map(|(user, _)| user).collect::<Vec<_>>());
                }
                Some(details)
            }
            Self::PartialBulkFailure {
                source_assignment_id,
                source_name,
                completed,
                cause,
            } => Some(json!({
                "sourceAssignmentId": source_assignment_id,
                "sourceAssignmentName": source_name,
                "completed": completed,
                "causeCode": cause.code(),
            })),
            _ => None,
        }
    }
}

pub type AssignResult<T> = Result<T, AssignError>;


