//! Background delivery of released scores to the course's LMS.
//!
//! Jobs are prepared synchronously from the workspace (so the database never crosses threads)
//! and run on the sidecar's tokio runtime. One job per assignment is in flight at a time; a newer
//! dispatch aborts the older one.

pub mod http;
pub mod sink;

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use rusqlite::Connection;
use serde::Serialize;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use tracing::{debug, error, info, warn};

use crate::assignment::Assignment;
use crate::catalog::{self, Course, LtiCredential};
use crate::config::{max_backoff_delay, max_push_wait, SyncConfig};
use crate::context::RequestContext;
use crate::error::AssignResult;

pub use http::HttpScoreSink;
pub use sink::{LineItemScore, OutcomePayload, ScoreSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ProtocolVersion {
    #[serde(rename = "1.1")]
    V1p1,
    #[serde(rename = "1.3")]
    V1p3,
}

impl ProtocolVersion {
    pub fn from_course(course: &Course) -> Option<Self> {
        match course.lti_version.as_deref() {
            Some("1.1") => Some(Self::V1p1),
            Some("1.3") => Some(Self::V1p3),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::V1p1 => "1.1",
            Self::V1p3 => "1.3",
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum SyncError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("network error: {0}")]
    Network(String),

    #[error("score service rejected the push (HTTP {status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("no score service endpoint configured")]
    NotConfigured,

    #[error("superseded by a newer push for the same assignment")]
    Superseded,

    /// Some line items of a 1.3 push failed; the rest were delivered.
    #[error(
        "{} of {total} line items not delivered, first failure {}",
        .failures.len(),
        first_failure(.failures)
    )]
    Incomplete {
        delivered: usize,
        total: usize,
        failures: Vec<(String, SyncError)>,
    },
}

fn first_failure(failures: &[(String, SyncError)]) -> String {
    failures
        .first()
        .map(|(user, e)| format!("for {user}: {e}"))
        .unwrap_or_default()
}

impl SyncError {
    /// Failures worth another attempt on the idempotent path.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Network(_) => true,
            Self::Rejected { status, .. } => *status >= 500 || *status == 429,
            Self::NotConfigured | Self::Superseded => false,
            Self::Incomplete { failures, .. } => failures.iter().any(|(_, e)| e.is_transient()),
        }
    }

    /// Items that did reach the score service before the failure.
    pub fn delivered(&self) -> usize {
        match self {
            Self::Incomplete { delivered, .. } => *delivered,
            _ => 0,
        }
    }
}

#[derive(Debug, Clone)]
pub enum SyncJob {
    LineItems {
        assignment_id: String,
        max_points: i64,
        scores: Vec<LineItemScore>,
        force: bool,
    },
    Outcome {
        payload: OutcomePayload,
        credential: LtiCredential,
    },
}

impl SyncJob {
    pub fn assignment_id(&self) -> &str {
        match self {
            Self::LineItems { assignment_id, .. } => assignment_id,
            Self::Outcome { payload, .. } => &payload.assignment_id,
        }
    }

    pub fn protocol(&self) -> ProtocolVersion {
        match self {
            Self::LineItems { .. } => ProtocolVersion::V1p3,
            Self::Outcome { .. } => ProtocolVersion::V1p1,
        }
    }

    fn items(&self) -> usize {
        match self {
            Self::LineItems { scores, .. } => scores.len(),
            Self::Outcome { .. } => 1,
        }
    }
}

/// Why no job was built for an assignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NoJob {
    NotLti,
    NoCredential,
}

impl NoJob {
    pub fn reason(&self) -> &'static str {
        match self {
            Self::NotLti => "course has no LTI integration",
            Self::NoCredential => "no LTI 1.1 credential for this grading session",
        }
    }
}

/// Reads everything a push needs for `assignment`.
pub fn prepare_job(
    conn: &Connection,
    ctx: &RequestContext,
    assignment: &Assignment,
    force: bool,
) -> AssignResult<Result<SyncJob, NoJob>> {
    let course = catalog::fetch_course(conn, &assignment.course_id)?;
    let Some(protocol) = ProtocolVersion::from_course(&course) else {
        return Ok(Err(NoJob::NotLti));
    };
    match protocol {
        ProtocolVersion::V1p3 => {
            let scores = catalog::fetch_scores(conn, &assignment.id)?
                .into_iter()
                .map(|(user_id, score)| LineItemScore { user_id, score })
                .collect();
            Ok(Ok(SyncJob::LineItems {
                assignment_id: assignment.id.clone(),
                max_points: assignment.points,
                scores,
                force,
            }))
        }
        ProtocolVersion::V1p1 => {
            let Some(key) = ctx.consumer_key.as_deref() else {
                return Ok(Err(NoJob::NoCredential));
            };
            let Some(credential) = catalog::fetch_lti_credential(conn, &course.id, key)? else {
                return Ok(Err(NoJob::NoCredential));
            };
            Ok(Ok(SyncJob::Outcome {
                payload: OutcomePayload {
                    assignment_id: assignment.id.clone(),
                    max_points: assignment.points,
                    course_id: course.id,
                },
                credential,
            }))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub protocol: ProtocolVersion,
    pub delivered: usize,
}

/// Result of an explicit push: finished within the wait bound, or still running in the
/// background with its outcome going to the status registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Delivered(SyncReport),
    Pending(ProtocolVersion),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Pending,
    Succeeded,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub state: SyncState,
    pub protocol: Option<ProtocolVersion>,
    pub delivered: usize,
    pub message: Option<String>,
}

struct InFlight {
    generation: u64,
    task: JoinHandle<()>,
}

type StatusMap = Arc<Mutex<HashMap<String, SyncStatus>>>;
type InFlightMap = Arc<Mutex<HashMap<String, InFlight>>>;

pub struct ScoreSyncDispatcher {
    runtime: Handle,
    sink: Arc<dyn ScoreSink>,
    config: SyncConfig,
    inflight: InFlightMap,
    statuses: StatusMap,
    generation: AtomicU64,
    push_wait: Duration,
}

impl ScoreSyncDispatcher {
    pub fn new(runtime: Handle, sink: Arc<dyn ScoreSink>, config: SyncConfig) -> Self {
        Self {
            runtime,
            sink,
            config,
            inflight: Arc::new(Mutex::new(HashMap::new())),
            statuses: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
            push_wait: max_push_wait(),
        }
    }

    /// Overrides how long `push_blocking` holds the caller before reporting `Pending`.
    pub fn with_push_wait(mut self, wait: Duration) -> Self {
        self.push_wait = wait;
        self
    }

    pub fn with_http(runtime: Handle, config: SyncConfig) -> Result<Self, SyncError> {
        let sink = HttpScoreSink::new(&config)?;
        Ok(Self::new(runtime, Arc::new(sink), config))
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Swaps in a fresh HTTP sink built from `config`. Jobs already running keep the old one.
    pub fn reconfigure(&mut self, config: SyncConfig) -> Result<(), SyncError> {
        let sink = HttpScoreSink::new(&config)?;
        self.sink = Arc::new(sink);
        self.config = config;
        Ok(())
    }

    pub fn status(&self, assignment_id: &str) -> Option<SyncStatus> {
        let map = self.statuses.lock().unwrap_or_else(PoisonError::into_inner);
        map.get(assignment_id).cloned()
    }

    pub fn record_skipped(&self, assignment_id: &str, why: &NoJob) {
        debug!(assignment_id, reason = why.reason(), "score sync skipped");
        let mut map = self.statuses.lock().unwrap_or_else(PoisonError::into_inner);
        map.insert(
            assignment_id.to_string(),
            SyncStatus {
                state: SyncState::Skipped,
                protocol: None,
                delivered: 0,
                message: Some(why.reason().to_string()),
            },
        );
    }

    /// Starts `job` in the background. The receiver resolves with the outcome, or is dropped
    /// if a later dispatch for the same assignment supersedes this one.
    pub fn dispatch(&self, job: SyncJob) -> oneshot::Receiver<Result<SyncReport, SyncError>> {
        let assignment_id = job.assignment_id().to_string();
        let protocol = job.protocol();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();

        {
            let mut statuses = self.statuses.lock().unwrap_or_else(PoisonError::into_inner);
            statuses.insert(
                assignment_id.clone(),
                SyncStatus {
                    state: SyncState::Pending,
                    protocol: Some(protocol),
                    delivered: 0,
                    message: None,
                },
            );
        }

        let sink = Arc::clone(&self.sink);
        let config = self.config.clone();
        let statuses = Arc::clone(&self.statuses);
        let inflight = Arc::clone(&self.inflight);
        let task_assignment = assignment_id.clone();

        // Held across spawn so the task cannot finish before its entry exists.
        let mut running = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);
        let task = self.runtime.spawn(async move {
            info!(
                assignment_id = %task_assignment,
                protocol = protocol.as_str(),
                items = job.items(),
                "score sync started"
            );
            let result = deliver(sink.as_ref(), &config, &job).await;
            {
                let mut running = inflight.lock().unwrap_or_else(PoisonError::into_inner);
                if running
                    .get(&task_assignment)
                    .is_some_and(|f| f.generation == generation)
                {
                    running.remove(&task_assignment);
                    record_outcome(&statuses, &task_assignment, protocol, &result);
                }
            }
            match &result {
                Ok(report) => {
                    info!(assignment_id = %task_assignment, delivered = report.delivered, "score sync finished")
                }
                Err(e) => {
                    error!(assignment_id = %task_assignment, error = %e, "score sync failed")
                }
            }
            let _ = tx.send(result);
        });
        if let Some(previous) = running.insert(assignment_id.clone(), InFlight { generation, task }) {
            warn!(assignment_id = %assignment_id, "superseding in-flight score sync");
            previous.task.abort();
        }
        rx
    }

    /// Dispatches and waits for the outcome, at most `push_wait` regardless of roster size.
    /// A push still running at that point keeps going and reports through `status`.
    /// Must be called from outside the runtime.
    pub fn push_blocking(&self, job: SyncJob) -> Result<PushOutcome, SyncError> {
        let protocol = job.protocol();
        let wait = self.push_wait;
        let rx = self.dispatch(job);
        self.runtime.block_on(async move {
            match tokio::time::timeout(wait, rx).await {
                Ok(Ok(result)) => result.map(PushOutcome::Delivered),
                Ok(Err(_)) => Err(SyncError::Superseded),
                Err(_) => Ok(PushOutcome::Pending(protocol)),
            }
        })
    }
}

fn record_outcome(
    statuses: &StatusMap,
    assignment_id: &str,
    protocol: ProtocolVersion,
    result: &Result<SyncReport, SyncError>,
) {
    let status = match result {
        Ok(report) => SyncStatus {
            state: SyncState::Succeeded,
            protocol: Some(protocol),
            delivered: report.delivered,
            message: None,
        },
        Err(e) => SyncStatus {
            state: SyncState::Failed,
            protocol: Some(protocol),
            delivered: e.delivered(),
            message: Some(e.to_string()),
        },
    };
    let mut map = statuses.lock().unwrap_or_else(PoisonError::into_inner);
    map.insert(assignment_id.to_string(), status);
}

fn retry_strategy(config: &SyncConfig) -> impl Iterator<Item = Duration> {
    let base_ms = u64::try_from(config.backoff_base.as_millis()).unwrap_or(u64::MAX).max(1);
    ExponentialBackoff::from_millis(2)
        .factor(base_ms)
        .max_delay(max_backoff_delay())
        .map(jitter)
        .take(config.max_retries)
}

async fn with_timeout<T>(
    limit: Duration,
    fut: impl Future<Output = Result<T, SyncError>>,
) -> Result<T, SyncError> {
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| SyncError::Timeout(limit))?
}

async fn deliver(
    sink: &dyn ScoreSink,
    config: &SyncConfig,
    job: &SyncJob,
) -> Result<SyncReport, SyncError> {
    match job {
        SyncJob::LineItems {
            assignment_id,
            max_points,
            scores,
            force,
        } => {
            // Every student gets an attempt; one rejected user must not hold back the class.
            let mut failures = Vec::new();
            for score in scores {
                let pushed = RetryIf::start(
                    retry_strategy(config),
                    || {
                        with_timeout(
                            config.timeout,
                            sink.push_line_item(assignment_id, *max_points, score, *force),
                        )
                    },
                    SyncError::is_transient,
                )
                .await;
                if let Err(e) = pushed {
                    warn!(%assignment_id, user = %score.user_id, error = %e, "line item not delivered");
                    failures.push((score.user_id.clone(), e));
                }
            }
            let delivered = scores.len() - failures.len();
            if !failures.is_empty() {
                return Err(SyncError::Incomplete {
                    delivered,
                    total: scores.len(),
                    failures,
                });
            }
            Ok(SyncReport {
                protocol: ProtocolVersion::V1p3,
                delivered,
            })
        }
        // Not idempotent upstream, so a single attempt.
        SyncJob::Outcome {
            payload,
            credential,
        } => {
            with_timeout(config.timeout, sink.push_outcome(payload, credential)).await?;
            Ok(SyncReport {
                protocol: ProtocolVersion::V1p1,
                delivered: 1,
            })
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;

    /// In-memory grade store with scripted failures.
    #[derive(Default)]
    pub struct FakeSink {
        pub line_items: Mutex<HashMap<(String, String), f64>>,
        pub line_item_calls: AtomicU64,
        pub outcomes: Mutex<Vec<(OutcomePayload, String)>>,
        pub outcome_calls: AtomicU64,
        pub failures: Mutex<VecDeque<SyncError>>,
        pub delay: Option<Duration>,
    }

    impl FakeSink {
        pub fn failing(errors: impl IntoIterator<Item = SyncError>) -> Self {
            Self {
                failures: Mutex::new(errors.into_iter().collect()),
                ..Default::default()
            }
        }

        fn next_failure(&self) -> Option<SyncError> {
            self.failures.lock().unwrap().pop_front()
        }
    }

    #[async_trait]
    impl ScoreSink for FakeSink {
        async fn push_line_item(
            &self,
            assignment_id: &str,
            _max_points: i64,
            score: &LineItemScore,
            _force: bool,
        ) -> Result<(), SyncError> {
            self.line_item_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(d) = self.delay {
                tokio::time::sleep(d).await;
            }
            if let Some(e) = self.next_failure() {
                return Err(e);
            }
            self.line_items
                .lock()
                .unwrap()
                .insert((assignment_id.to_string(), score.user_id.clone()), score.score);
            Ok(())
        }

        async fn push_outcome(
            &self,
            payload: &OutcomePayload,
            credential: &LtiCredential,
        ) -> Result<(), SyncError> {
            self.outcome_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(e) = self.next_failure() {
                return Err(e);
            }
            self.outcomes
                .lock()
                .unwrap()
                .push((payload.clone(), credential.consumer.clone()));
            Ok(())
        }
    }
}
