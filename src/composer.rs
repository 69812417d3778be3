//! Question membership of an assignment: points, grading policy, reading requirements and
//! ordering. Every mutation runs under the assignment's lock and inside one transaction, and
//! finishes by recomputing `assignments.points` from the rows it just wrote.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::NaiveTime;
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::assignment::{self, Assignment};
use crate::catalog::{self, format_datetime, Course, Question};
use crate::context::RequestContext;
use crate::error::{AssignError, AssignResult};
use crate::policy::{self, Autograde, Requested, WhichToGrade};

/// One mutex per assignment id, created on first use.
#[derive(Default)]
pub struct AssignmentLocks {
    inner: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl AssignmentLocks {
    pub fn scope(&self, assignment_id: &str) -> Arc<Mutex<()>> {
        let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        map.entry(assignment_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub fn forget(&self, assignment_id: &str) {
        let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        map.remove(assignment_id);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuestionRef {
    Id(String),
    Name(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivitiesRequest {
    Absent,
    /// Derive from the page's activity count.
    Auto,
    Count(i64),
}

#[derive(Debug, Clone)]
pub struct QuestionSettings {
    pub points: Option<i64>,
    pub autograde: Requested<Autograde>,
    pub which_to_grade: Requested<WhichToGrade>,
    pub activities_required: ActivitiesRequest,
    pub sort_position: Option<i64>,
}

impl Default for QuestionSettings {
    fn default() -> Self {
        Self {
            points: None,
            autograde: Requested::Absent,
            which_to_grade: Requested::Absent,
            activities_required: ActivitiesRequest::Absent,
            sort_position: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionAggregate {
    pub status: &'static str,
    pub question_id: String,
    pub question_name: String,
    pub total_points: i64,
    pub points: i64,
    pub activity_count: i64,
    pub activities_required: Option<i64>,
    pub allowed_autograde: Vec<&'static str>,
    pub allowed_which_to_grade: Vec<&'static str>,
    pub resolved_autograde: Option<&'static str>,
    pub resolved_which_to_grade: &'static str,
    pub sorting_priority: i64,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReorderOutcome {
    pub reordered: usize,
    pub skipped: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DuplicateOutcome {
    pub source_assignment_id: String,
    pub assignment_id: String,
    pub name: String,
    pub due: String,
    pub questions: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentRow {
    pub question_id: String,
    pub name: String,
    pub question_type: &'static str,
    pub points: i64,
    pub autograde: Option<String>,
    pub which_to_grade: Option<String>,
    pub sorting_priority: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activity_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activities_required: Option<i64>,
    pub autograde_possible_values: Vec<&'static str>,
    pub which_to_grade_possible_values: Vec<&'static str>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentView {
    pub assignment: Assignment,
    pub readings: Vec<AssignmentRow>,
    pub questions: Vec<AssignmentRow>,
}

/// `max(1, floor(0.8 × activity_count))`
pub fn auto_activities_required(activity_count: i64) -> i64 {
    (activity_count * 4 / 5).max(1)
}

pub fn recompute_points(conn: &Connection, assignment_id: &str) -> AssignResult<i64> {
    let total: i64 = conn.query_row(
        "SELECT COALESCE(SUM(points), 0) FROM assignment_questions WHERE assignment_id = ?",
        [assignment_id],
        |r| r.get(0),
    )?;
    conn.execute(
        "UPDATE assignments SET points = ? WHERE id = ?",
        (total, assignment_id),
    )?;
    Ok(total)
}

fn next_priority(conn: &Connection, assignment_id: &str, reading: bool) -> AssignResult<i64> {
    Ok(conn.query_row(
        "SELECT COALESCE(MAX(sorting_priority), 0) + 1 FROM assignment_questions
         WHERE assignment_id = ? AND reading_assignment = ?",
        (assignment_id, reading),
        |r| r.get(0),
    )?)
}

fn existing_priority(
    conn: &Connection,
    assignment_id: &str,
    question_id: &str,
) -> AssignResult<Option<i64>> {
    Ok(conn
        .query_row(
            "SELECT sorting_priority FROM assignment_questions WHERE assignment_id = ? AND question_id = ?",
            (assignment_id, question_id),
            |r| r.get(0),
        )
        .optional()?)
}

pub struct Composer<'a> {
    conn: &'a Connection,
    locks: &'a AssignmentLocks,
    ctx: &'a RequestContext,
}

impl<'a> Composer<'a> {
    pub fn new(conn: &'a Connection, locks: &'a AssignmentLocks, ctx: &'a RequestContext) -> Self {
        Self { conn, locks, ctx }
    }

    fn resolve_question(
        &self,
        course: &Course,
        assignment_id: &str,
        question: &QuestionRef,
    ) -> AssignResult<Question> {
        match question {
            QuestionRef::Id(id) => catalog::fetch_question(self.conn, id),
            QuestionRef::Name(name) => {
                catalog::resolve_question_name(self.conn, name, course, Some(assignment_id))?
                    .ok_or_else(|| AssignError::not_found(format!("question {name}")))
            }
        }
    }

    pub fn add_or_update_question(
        &self,
        assignment_id: &str,
        question: &QuestionRef,
        settings: &QuestionSettings,
    ) -> AssignResult<QuestionAggregate> {
        let lock = self.locks.scope(assignment_id);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let tx = self.conn.unchecked_transaction()?;
        assignment::fetch_in_course(&tx, self.ctx, assignment_id)?;
        let course = catalog::fetch_course(&tx, &self.ctx.course_id)?;
        let q = self.resolve_question(&course, assignment_id, question)?;
        let qtype = q.question_type;

        policy::validate_requested(qtype, settings.autograde, settings.which_to_grade)
            .map_err(AssignError::Validation)?;
        if let Some(p) = settings.points {
            if p < 0 {
                return Err(AssignError::validation("points must be >= 0"));
            }
        }

        let reading = qtype.is_reading();
        let (activity_count, activities_required) = if reading {
            let count = catalog::count_activities(
                &tx,
                q.chapter.as_deref(),
                q.subchapter.as_deref(),
                &course.base_course,
            )?;
            let required = match settings.activities_required {
                ActivitiesRequest::Auto => Some(auto_activities_required(count)),
                ActivitiesRequest::Count(n) if n < 0 => {
                    return Err(AssignError::validation("activitiesRequired must be >= 0"));
                }
                ActivitiesRequest::Count(n) => Some(n),
                ActivitiesRequest::Absent => {
                    debug!(question = %q.name, "no activities requirement for reading");
                    None
                }
            };
            (count, required)
        } else {
            (0, None)
        };

        let points = settings
            .points
            .unwrap_or(if reading { activity_count } else { 1 });

        let resolution = policy::resolve(
            qtype,
            settings.autograde,
            settings.which_to_grade,
            q.has_unit_test(),
        );

        let sorting_priority = match settings.sort_position {
            Some(p) => p,
            None => match existing_priority(&tx, assignment_id, &q.id)? {
                Some(p) => p,
                None => next_priority(&tx, assignment_id, reading)?,
            },
        };

        tx.execute(
            "INSERT INTO assignment_questions(id, assignment_id, question_id, points, autograde, which_to_grade, sorting_priority, reading_assignment, activities_required)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(assignment_id, question_id) DO UPDATE SET
               points = excluded.points,
               autograde = excluded.autograde,
               which_to_grade = excluded.which_to_grade,
               sorting_priority = excluded.sorting_priority,
               reading_assignment = excluded.reading_assignment,
               activities_required = excluded.activities_required",
            rusqlite::params![
                uuid::Uuid::new_v4().to_string(),
                assignment_id,
                q.id,
                points,
                resolution.autograde.map(Autograde::as_str),
                resolution.which_to_grade.map(WhichToGrade::as_str).unwrap_or(""),
                sorting_priority,
                reading,
                activities_required
            ],
        )?;
        let total = recompute_points(&tx, assignment_id)?;
        tx.commit()?;

        debug!(
            assignment_id,
            question = %q.name,
            points,
            total,
            sorting_priority,
            "assignment question saved"
        );

        Ok(QuestionAggregate {
            status: "success",
            question_id: q.id,
            question_name: q.name,
            total_points: total,
            points,
            activity_count,
            activities_required,
            allowed_autograde: policy::autograde_menu(qtype),
            allowed_which_to_grade: policy::which_to_grade_menu(qtype),
            resolved_autograde: resolution.autograde.map(Autograde::as_str),
            resolved_which_to_grade: resolution
                .which_to_grade
                .map(WhichToGrade::as_str)
                .unwrap_or(""),
            sorting_priority,
        })
    }

    /// Detaches one question; detaching a question that is not linked only recomputes.
    pub fn remove_question(&self, assignment_id: &str, question_name: &str) -> AssignResult<i64> {
        let lock = self.locks.scope(assignment_id);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let tx = self.conn.unchecked_transaction()?;
        assignment::fetch_in_course(&tx, self.ctx, assignment_id)?;
        let course = catalog::fetch_course(&tx, &self.ctx.course_id)?;
        if let Some(q) =
            catalog::resolve_question_name(&tx, question_name, &course, Some(assignment_id))?
        {
            let n = tx.execute(
                "DELETE FROM assignment_questions WHERE assignment_id = ? AND question_id = ?",
                (assignment_id, &q.id),
            )?;
            debug!(assignment_id, question = question_name, removed = n, "assignment question removed");
        }
        let total = recompute_points(&tx, assignment_id)?;
        tx.commit()?;
        Ok(total)
    }

    /// `ordered_names` is the complete list of one bucket. Names that do not resolve to a linked
    /// question are skipped; the remaining names get 1..N in order.
    pub fn reorder(&self, assignment_id: &str, ordered_names: &[String]) -> AssignResult<ReorderOutcome> {
        let lock = self.locks.scope(assignment_id);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let tx = self.conn.unchecked_transaction()?;
        assignment::fetch_in_course(&tx, self.ctx, assignment_id)?;
        let course = catalog::fetch_course(&tx, &self.ctx.course_id)?;

        let mut outcome = ReorderOutcome::default();
        let mut next = 1_i64;
        // Fixed by the first linked name; rows from the other bucket keep their rank.
        let mut bucket: Option<bool> = None;
        for name in ordered_names {
            let Some(q) = catalog::resolve_question_name(&tx, name, &course, Some(assignment_id))?
            else {
                warn!(assignment_id, question = %name, "reorder: unknown question skipped");
                outcome.skipped.push(name.clone());
                continue;
            };
            let reading: Option<bool> = tx
                .query_row(
                    "SELECT reading_assignment FROM assignment_questions WHERE assignment_id = ? AND question_id = ?",
                    (assignment_id, &q.id),
                    |r| r.get(0),
                )
                .optional()?;
            let Some(reading) = reading else {
                warn!(assignment_id, question = %name, "reorder: question not in assignment skipped");
                outcome.skipped.push(name.clone());
                continue;
            };
            if *bucket.get_or_insert(reading) != reading {
                warn!(assignment_id, question = %name, "reorder: question from the other bucket skipped");
                outcome.skipped.push(name.clone());
                continue;
            }
            tx.execute(
                "UPDATE assignment_questions SET sorting_priority = ? WHERE assignment_id = ? AND question_id = ?",
                (next, assignment_id, &q.id),
            )?;
            next += 1;
            outcome.reordered += 1;
        }
        tx.commit()?;
        Ok(outcome)
    }

    /// Full builder view: top-level data plus reading and question rows with their menus.
    pub fn view(&self, assignment_id: &str) -> AssignResult<AssignmentView> {
        let lock = self.locks.scope(assignment_id);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        assignment::fetch_in_course(self.conn, self.ctx, assignment_id)?;
        recompute_points(self.conn, assignment_id)?;
        let a = assignment::fetch_assignment(self.conn, assignment_id)?;
        let course = catalog::fetch_course(self.conn, &self.ctx.course_id)?;

        let mut stmt = self.conn.prepare(
            "SELECT aq.question_id, aq.points, aq.autograde, aq.which_to_grade, aq.sorting_priority,
                    aq.reading_assignment, aq.activities_required
             FROM assignment_questions aq
             WHERE aq.assignment_id = ?
             ORDER BY aq.reading_assignment DESC, aq.sorting_priority",
        )?;
        let rows = stmt
            .query_map([assignment_id], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, i64>(1)?,
                    r.get::<_, Option<String>>(2)?,
                    r.get::<_, Option<String>>(3)?,
                    r.get::<_, i64>(4)?,
                    r.get::<_, bool>(5)?,
                    r.get::<_, Option<i64>>(6)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut readings = Vec::new();
        let mut questions = Vec::new();
        for (question_id, points, autograde, which, priority, reading, activities) in rows {
            let q = catalog::fetch_question(self.conn, &question_id)?;
            let activity_count = if reading {
                Some(catalog::count_activities(
                    self.conn,
                    q.chapter.as_deref(),
                    q.subchapter.as_deref(),
                    &course.base_course,
                )?)
            } else {
                None
            };
            let row = AssignmentRow {
                question_id,
                name: q.name,
                question_type: q.question_type.as_str(),
                points,
                autograde,
                which_to_grade: which,
                sorting_priority: priority,
                activity_count,
                activities_required: activities,
                autograde_possible_values: policy::autograde_menu(q.question_type),
                which_to_grade_possible_values: policy::which_to_grade_menu(q.question_type),
            };
            if reading {
                readings.push(row);
            } else {
                questions.push(row);
            }
        }

        Ok(AssignmentView {
            assignment: a,
            readings,
            questions,
        })
    }

    /// Copies `source_assignment_id` into the request's course, keeping the due date's offset
    /// from the start of term.
    pub fn duplicate(&self, source_assignment_id: &str) -> AssignResult<DuplicateOutcome> {
        let lock = self.locks.scope(source_assignment_id);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let source = assignment::fetch_assignment(self.conn, source_assignment_id)?;
        let source_course = catalog::fetch_course(self.conn, &source.course_id)?;
        let target_course = catalog::fetch_course(self.conn, &self.ctx.course_id)?;

        let offset = source.due - source_course.term_start.and_time(NaiveTime::MIN);
        let due = target_course.term_start.and_time(NaiveTime::MIN) + offset;

        let copy = Assignment {
            id: uuid::Uuid::new_v4().to_string(),
            course_id: target_course.id.clone(),
            due,
            released: false,
            ..source.clone()
        };

        let tx = self.conn.unchecked_transaction()?;
        assignment::insert(&tx, &copy)?;
        let questions = assignment::clone_question_rows(&tx, &source.id, &copy.id)?;
        recompute_points(&tx, &copy.id)?;
        tx.commit()?;

        info!(
            source = %source.id,
            assignment_id = %copy.id,
            course_id = %target_course.id,
            questions,
            "assignment duplicated"
        );
        Ok(DuplicateOutcome {
            source_assignment_id: source.id,
            assignment_id: copy.id,
            name: copy.name,
            due: format_datetime(due),
            questions,
        })
    }

    /// Duplicates every instructor-authored assignment of the base course. Stops at the first
    /// failure; copies made before it stay committed.
    pub fn duplicate_all(&self) -> AssignResult<Vec<DuplicateOutcome>> {
        let target = catalog::fetch_course(self.conn, &self.ctx.course_id)?;
        let Some(base) = catalog::fetch_course_by_name(self.conn, &target.base_course)? else {
            return Err(AssignError::not_found(format!("base course {}", target.base_course)));
        };

        let sources: Vec<Assignment> = assignment::list_for_course(self.conn, &base.id)?
            .into_iter()
            .filter(|a| !a.from_source)
            .collect();
        if sources.is_empty() {
            info!(course_id = %target.id, base = %base.course_name, "no assignments to copy");
        }

        let mut done = Vec::with_capacity(sources.len());
        for source in sources {
            match self.duplicate(&source.id) {
                Ok(outcome) => done.push(outcome),
                Err(cause) => {
                    warn!(
                        source = %source.id,
                        completed = done.len(),
                        error = %cause,
                        "bulk duplicate stopped"
                    );
                    return Err(AssignError::PartialBulkFailure {
                        source_assignment_id: source.id,
                        source_name: source.name,
                        completed: done.len(),
                        cause: Box::new(cause),
                    });
                }
            }
        }
        Ok(done)
    }
}
