//! Score service client. Line items go to `/lti13/lineitems/{id}/scores`, 1.1 outcomes to
//! `/lti11/outcomes` signed with the consumer secret.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::instrument;

use super::sink::{LineItemScore, OutcomePayload, ScoreSink};
use super::SyncError;
use crate::catalog::LtiCredential;
use crate::config::SyncConfig;

pub struct HttpScoreSink {
    endpoint: Option<String>,
    timeout: Duration,
    client: reqwest::Client,
}

impl HttpScoreSink {
    pub fn new(config: &SyncConfig) -> Result<Self, SyncError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| SyncError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            endpoint: config.endpoint.clone(),
            timeout: config.timeout,
            client,
        })
    }

    fn url(&self, path: &str) -> Result<String, SyncError> {
        let base = self.endpoint.as_deref().ok_or(SyncError::NotConfigured)?;
        Ok(format!("{base}{path}"))
    }

    fn transport_error(&self, e: reqwest::Error) -> SyncError {
        if e.is_timeout() {
            SyncError::Timeout(self.timeout)
        } else {
            SyncError::Network(e.to_string())
        }
    }

    async fn check(response: reqwest::Response) -> Result<(), SyncError> {
        let status = response.status().as_u16();
        if status >= 400 {
            let message = response.text().await.unwrap_or_default();
            return Err(SyncError::Rejected { status, message });
        }
        Ok(())
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ScoreBody<'a> {
    user_id: &'a str,
    score_given: f64,
    score_maximum: i64,
    activity_progress: &'static str,
    grading_progress: &'static str,
    force: bool,
}

/// Hex SHA-256 of `secret || body`.
pub fn outcome_signature(secret: &str, body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.update(body);
    format!("{:x}", hasher.finalize())
}

#[async_trait]
impl ScoreSink for HttpScoreSink {
    #[instrument(skip(self, score), fields(user = %score.user_id))]
    async fn push_line_item(
        &self,
        assignment_id: &str,
        max_points: i64,
        score: &LineItemScore,
        force: bool,
    ) -> Result<(), SyncError> {
        let url = self.url(&format!("/lti13/lineitems/{assignment_id}/scores"))?;
        let body = ScoreBody {
            user_id: &score.user_id,
            score_given: score.score,
            score_maximum: max_points,
            activity_progress: "Completed",
            grading_progress: "FullyGraded",
            force,
        };
        let response = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        Self::check(response).await
    }

    #[instrument(skip(self, payload, credential), fields(assignment = %payload.assignment_id, consumer = %credential.consumer))]
    async fn push_outcome(
        &self,
        payload: &OutcomePayload,
        credential: &LtiCredential,
    ) -> Result<(), SyncError> {
        let url = self.url("/lti11/outcomes")?;
        let body = serde_json::to_vec(payload)
            .map_err(|e| SyncError::Network(format!("failed to encode outcome: {e}")))?;
        let signature = outcome_signature(&credential.secret, &body);
        let response = self
            .client
            .post(url)
            .header("content-type", "application/json")
            .header("X-LTI-Consumer", &credential.consumer)
            .header("X-LTI-Signature", signature)
            .body(body)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        Self::check(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn sink_for(server: &MockServer) -> HttpScoreSink {
        HttpScoreSink::new(&SyncConfig {
            endpoint: Some(server.uri()),
            timeout: Duration::from_secs(2),
            ..SyncConfig::default()
        })
        .unwrap()
    }

    fn score(user: &str, value: f64) -> LineItemScore {
        LineItemScore {
            user_id: user.into(),
            score: value,
        }
    }

    #[tokio::test]
    async fn line_item_is_posted_as_fully_graded() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/lti13/lineitems/a-1/scores"))
            .and(body_partial_json(serde_json::json!({
                "userId": "s1",
                "scoreGiven": 7.5,
                "scoreMaximum": 10,
                "gradingProgress": "FullyGraded",
                "force": true
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        sink_for(&server)
            .push_line_item("a-1", 10, &score("s1", 7.5), true)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn outcome_carries_consumer_and_signature() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/lti11/outcomes"))
            .and(header("X-LTI-Consumer", "py-fall-key"))
            .and(header_exists("X-LTI-Signature"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let payload = OutcomePayload {
            assignment_id: "a-1".into(),
            max_points: 12,
            course_id: "c-1".into(),
        };
        let credential = LtiCredential {
            consumer: "py-fall-key".into(),
            secret: "s3cret".into(),
        };
        sink_for(&server).push_outcome(&payload, &credential).await.unwrap();
    }

    #[tokio::test]
    async fn server_errors_are_transient_and_client_errors_are_not() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/lti13/lineitems/busy/scores"))
            .respond_with(ResponseTemplate::new(503).set_body_string("try later"))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/lti13/lineitems/gone/scores"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let sink = sink_for(&server);
        let busy = sink
            .push_line_item("busy", 1, &score("s1", 1.0), true)
            .await
            .unwrap_err();
        assert!(busy.is_transient());
        assert!(busy.to_string().contains("503"));

        let gone = sink
            .push_line_item("gone", 1, &score("s1", 1.0), true)
            .await
            .unwrap_err();
        assert!(!gone.is_transient());
    }

    #[tokio::test]
    async fn missing_endpoint_is_not_configured() {
        let sink = HttpScoreSink::new(&SyncConfig::default()).unwrap();
        let err = sink
            .push_line_item("a", 1, &score("s1", 1.0), false)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::NotConfigured));
    }

    #[test]
    fn signature_depends_on_secret() {
        let body = br#"{"assignmentId":"a"}"#;
        let a = outcome_signature("one", body);
        let b = outcome_signature("two", body);
        assert_eq!(a.len(), 64);
        assert_ne!(a, b);
        assert_eq!(a, outcome_signature("one", body));
    }
}
