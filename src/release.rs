use std::collections::BTreeMap;

use rusqlite::Connection;
use serde::Serialize;
use tracing::info;

use crate::assignment::{self, Assignment};
use crate::context::RequestContext;
use crate::error::AssignResult;
use crate::sync::{self, PushOutcome, ScoreSyncDispatcher};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseState {
    Unreleased,
    Released,
}

impl From<bool> for ReleaseState {
    fn from(released: bool) -> Self {
        if released {
            Self::Released
        } else {
            Self::Unreleased
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseOutcome {
    pub assignment_id: String,
    pub state: ReleaseState,
    /// True when a background score push was started.
    pub sync_dispatched: bool,
}

/// Persists the flag, then starts the LMS push when releasing. The flag stays set whatever the
/// push does; its result shows up in the sync status registry.
pub fn set_released(
    conn: &Connection,
    ctx: &RequestContext,
    dispatcher: &ScoreSyncDispatcher,
    assignment_id: &str,
    released: bool,
) -> AssignResult<ReleaseOutcome> {
    let mut a = assignment::fetch_in_course(conn, ctx, assignment_id)?;
    conn.execute(
        "UPDATE assignments SET released = ? WHERE id = ?",
        (released, assignment_id),
    )?;
    a.released = released;
    info!(assignment_id, released, user = ?ctx.user_id, "release state changed");

    let mut sync_dispatched = false;
    if released {
        match sync::prepare_job(conn, ctx, &a, true)? {
            Ok(job) => {
                // Outcome is reported through grades.syncStatus.
                drop(dispatcher.dispatch(job));
                sync_dispatched = true;
            }
            Err(why) => dispatcher.record_skipped(assignment_id, &why),
        }
    }

    Ok(ReleaseOutcome {
        assignment_id: a.id,
        state: released.into(),
        sync_dispatched,
    })
}

/// Explicit re-push. Waits a bounded time for delivery; a push still running after that is
/// reported as pending. `None` when the course has nothing to push to.
pub fn push_grades(
    conn: &Connection,
    ctx: &RequestContext,
    dispatcher: &ScoreSyncDispatcher,
    assignment_id: &str,
) -> AssignResult<Option<PushOutcome>> {
    let a: Assignment = assignment::fetch_in_course(conn, ctx, assignment_id)?;
    match sync::prepare_job(conn, ctx, &a, true)? {
        Ok(job) => Ok(Some(dispatcher.push_blocking(job)?)),
        Err(why) => {
            dispatcher.record_skipped(assignment_id, &why);
            Ok(None)
        }
    }
}

/// `{assignment name → released}` for every assignment of the course.
pub fn release_states(conn: &Connection, course_id: &str) -> AssignResult<BTreeMap<String, bool>> {
    let mut stmt = conn.prepare("SELECT name, released FROM assignments WHERE course_id = ?")?;
    let rows = stmt
        .query_map([course_id], |r| Ok((r.get::<_, String>(0)?, r.get::<_, bool>(1)?)))?
        .collect::<Result<BTreeMap<_, _>, _>>()?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::fixtures;
    use crate::config::SyncConfig;
    use crate::db::open_memory;
    use crate::sync::testing::FakeSink;
    use crate::sync::{SyncError, SyncState};
    use std::sync::Arc;
    use std::time::Duration;

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap()
    }

    fn config() -> SyncConfig {
        SyncConfig {
            max_retries: 0,
            timeout: Duration::from_secs(1),
            backoff_base: Duration::from_millis(1),
            endpoint: None,
        }
    }

    fn wait_for_terminal(d: &ScoreSyncDispatcher, aid: &str) -> SyncState {
        for _ in 0..200 {
            if let Some(s) = d.status(aid) {
                if s.state != SyncState::Pending {
                    return s.state;
                }
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("sync for {aid} never finished");
    }

    #[test]
    fn release_persists_even_when_push_fails() {
        let conn = open_memory();
        fixtures::seed(&conn);
        let ctx = RequestContext::for_course("c-fall");
        let a = assignment::create(&conn, &ctx, "Quiz", None).unwrap();

        let rt = runtime();
        let sink = Arc::new(FakeSink::failing([SyncError::Rejected {
            status: 500,
            message: "down".into(),
        }]));
        conn.execute(
            "INSERT INTO scores(assignment_id, student_id, score) VALUES(?, 's1', 3.0)",
            [&a.id],
        )
        .unwrap();
        let d = ScoreSyncDispatcher::new(rt.handle().clone(), sink, config());

        let out = set_released(&conn, &ctx, &d, &a.id, true).unwrap();
        assert!(out.sync_dispatched);
        assert_eq!(wait_for_terminal(&d, &a.id), SyncState::Failed);
        assert!(assignment::fetch_assignment(&conn, &a.id).unwrap().released);
        assert_eq!(release_states(&conn, "c-fall").unwrap().get("Quiz"), Some(&true));
    }

    #[test]
    fn unrelease_never_dispatches() {
        let conn = open_memory();
        fixtures::seed(&conn);
        let ctx = RequestContext::for_course("c-fall");
        let a = assignment::create(&conn, &ctx, "Quiz", None).unwrap();
        let rt = runtime();
        let sink = Arc::new(FakeSink::default());
        let d = ScoreSyncDispatcher::new(rt.handle().clone(), Arc::clone(&sink) as _, config());

        let out = set_released(&conn, &ctx, &d, &a.id, false).unwrap();
        assert_eq!(out.state, ReleaseState::Unreleased);
        assert!(!out.sync_dispatched);
        assert!(d.status(&a.id).is_none());
    }

    #[test]
    fn non_lti_course_is_skipped() {
        let conn = open_memory();
        fixtures::seed(&conn);
        let ctx = RequestContext::for_course("c-book");
        let a = assignment::create(&conn, &ctx, "HW", None).unwrap();
        let rt = runtime();
        let d = ScoreSyncDispatcher::new(rt.handle().clone(), Arc::new(FakeSink::default()), config());

        let out = set_released(&conn, &ctx, &d, &a.id, true).unwrap();
        assert!(!out.sync_dispatched);
        assert_eq!(d.status(&a.id).unwrap().state, SyncState::Skipped);
        assert!(push_grades(&conn, &ctx, &d, &a.id).unwrap().is_none());
    }

    #[test]
    fn explicit_push_surfaces_delivery_errors() {
        let conn = open_memory();
        fixtures::seed(&conn);
        let ctx = RequestContext::for_course("c-fall");
        let a = assignment::create(&conn, &ctx, "Quiz", None).unwrap();
        conn.execute(
            "INSERT INTO scores(assignment_id, student_id, score) VALUES(?, 's1', 3.0)",
            [&a.id],
        )
        .unwrap();
        let rt = runtime();
        let sink = Arc::new(FakeSink::failing([SyncError::Rejected {
            status: 422,
            message: "unknown line item".into(),
        }]));
        let d = ScoreSyncDispatcher::new(rt.handle().clone(), sink, config());

        let e = push_grades(&conn, &ctx, &d, &a.id).unwrap_err();
        assert_eq!(e.code(), "sync_delivery_failed");

        let out = push_grades(&conn, &ctx, &d, &a.id).unwrap().unwrap();
        let PushOutcome::Delivered(report) = out else {
            panic!("push still pending: {out:?}");
        };
        assert_eq!(report.delivered, 1);
    }
}
