use async_trait::async_trait;
use serde::Serialize;

use super::SyncError;
use crate::catalog::LtiCredential;

/// One student's score for an LTI 1.3 line item.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LineItemScore {
    pub user_id: String,
    pub score: f64,
}

/// Aggregate pushed once per assignment on the LTI 1.1 path.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutcomePayload {
    pub assignment_id: String,
    pub max_points: i64,
    pub course_id: String,
}

/// The external grade store.
#[async_trait]
pub trait ScoreSink: Send + Sync {
    /// Sends one score; sending the same score twice must leave the store unchanged.
    async fn push_line_item(
        &self,
        assignment_id: &str,
        max_points: i64,
        score: &LineItemScore,
        force: bool,
    ) -> Result<(), SyncError>;

    async fn push_outcome(
        &self,
        payload: &OutcomePayload,
        credential: &LtiCredential,
    ) -> Result<(), SyncError>;
}
