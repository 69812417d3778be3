//! Assignment rows: the top-level fields instructors edit directly.

use chrono::{Duration, NaiveDateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row};
use serde::Serialize;
use tracing::{debug, info};

use crate::catalog::{self, format_datetime, parse_datetime};
use crate::context::RequestContext;
use crate::error::{AssignError, AssignResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AssignmentKind {
    Regular,
    Timed,
    Peer,
}

impl AssignmentKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Regular" | "regular" => Some(Self::Regular),
            "Timed" | "timed" => Some(Self::Timed),
            "Peer" | "peer" => Some(Self::Peer),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Regular => "Regular",
            Self::Timed => "Timed",
            Self::Peer => "Peer",
        }
    }

    /// Peer instruction wins over timing when both flags are set.
    pub fn from_flags(is_timed: bool, is_peer: bool) -> Self {
        if is_peer {
            Self::Peer
        } else if is_timed {
            Self::Timed
        } else {
            Self::Regular
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Assignment {
    pub id: String,
    pub course_id: String,
    pub name: String,
    pub description: Option<String>,
    pub points: i64,
    #[serde(serialize_with = "serialize_due")]
    pub due: NaiveDateTime,
    pub kind: AssignmentKind,
    pub released: bool,
    pub enforce_due: bool,
    pub visible: bool,
    pub from_source: bool,
    pub time_limit: Option<i64>,
    pub nofeedback: bool,
    pub nopause: bool,
    pub threshold_pct: Option<f64>,
}

fn serialize_due<S: serde::Serializer>(due: &NaiveDateTime, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&format_datetime(*due))
}

const ASSIGNMENT_COLUMNS: &str = "id, course_id, name, description, points, due_date, kind, released, enforce_due, visible, from_source, time_limit, nofeedback, nopause, threshold_pct";

struct RawAssignment {
    id: String,
    course_id: String,
    name: String,
    description: Option<String>,
    points: i64,
    due_date: String,
    kind: String,
    released: bool,
    enforce_due: bool,
    visible: bool,
    from_source: bool,
    time_limit: Option<i64>,
    nofeedback: bool,
    nopause: bool,
    threshold_pct: Option<f64>,
}

fn raw_from_row(row: &Row<'_>) -> rusqlite::Result<RawAssignment> {
    Ok(RawAssignment {
        id: row.get(0)?,
        course_id: row.get(1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        points: row.get(4)?,
        due_date: row.get(5)?,
        kind: row.get(6)?,
        released: row.get(7)?,
        enforce_due: row.get(8)?,
        visible: row.get(9)?,
        from_source: row.get(10)?,
        time_limit: row.get(11)?,
        nofeedback: row.get(12)?,
        nopause: row.get(13)?,
        threshold_pct: row.get(14)?,
    })
}

impl RawAssignment {
    fn into_assignment(self) -> AssignResult<Assignment> {
        let kind = AssignmentKind::parse(&self.kind).unwrap_or(AssignmentKind::Regular);
        Ok(Assignment {
            due: parse_datetime(&self.due_date)?,
            id: self.id,
            course_id: self.course_id,
            name: self.name,
            description: self.description,
            points: self.points,
            kind,
            released: self.released,
            enforce_due: self.enforce_due,
            visible: self.visible,
            from_source: self.from_source,
            time_limit: self.time_limit,
            nofeedback: self.nofeedback,
            nopause: self.nopause,
            threshold_pct: self.threshold_pct,
        })
    }
}

pub fn fetch_assignment(conn: &Connection, assignment_id: &str) -> AssignResult<Assignment> {
    let sql = format!("SELECT {ASSIGNMENT_COLUMNS} FROM assignments WHERE id = ?");
    match conn.query_row(&sql, [assignment_id], raw_from_row).optional()? {
        Some(raw) => raw.into_assignment(),
        None => Err(AssignError::not_found(format!("assignment {assignment_id}"))),
    }
}

/// Assignments outside the request's course are reported as absent.
pub fn fetch_in_course(
    conn: &Connection,
    ctx: &RequestContext,
    assignment_id: &str,
) -> AssignResult<Assignment> {
    let a = fetch_assignment(conn, assignment_id)?;
    if a.course_id != ctx.course_id {
        return Err(AssignError::not_found(format!("assignment {assignment_id}")));
    }
    Ok(a)
}

pub fn list_for_course(conn: &Connection, course_id: &str) -> AssignResult<Vec<Assignment>> {
    let sql = format!(
        "SELECT {ASSIGNMENT_COLUMNS} FROM assignments WHERE course_id = ? ORDER BY due_date, name"
    );
    let mut stmt = conn.prepare(&sql)?;
    let raws = stmt
        .query_map([course_id], raw_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    raws.into_iter().map(RawAssignment::into_assignment).collect()
}

pub fn name_exists(conn: &Connection, course_id: &str, name: &str) -> AssignResult<bool> {
    Ok(conn
        .query_row(
            "SELECT 1 FROM assignments WHERE course_id = ? AND name = ?",
            (course_id, name),
            |r| r.get::<_, i64>(0),
        )
        .optional()?
        .is_some())
}

pub fn insert(conn: &Connection, a: &Assignment) -> AssignResult<()> {
    if name_exists(conn, &a.course_id, &a.name)? {
        return Err(AssignError::DuplicateName {
            name: a.name.clone(),
        });
    }
    conn.execute(
        &format!(
            "INSERT INTO assignments({ASSIGNMENT_COLUMNS}) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ),
        rusqlite::params![
            a.id,
            a.course_id,
            a.name,
            a.description,
            a.points,
            format_datetime(a.due),
            a.kind.as_str(),
            a.released,
            a.enforce_due,
            a.visible,
            a.from_source,
            a.time_limit,
            a.nofeedback,
            a.nopause,
            a.threshold_pct
        ],
    )?;
    Ok(())
}

/// Copies every question row of `from` onto `to`, keeping settings and order.
pub fn clone_question_rows(conn: &Connection, from: &str, to: &str) -> AssignResult<usize> {
    let mut stmt = conn.prepare(
        "SELECT question_id, points, autograde, which_to_grade, sorting_priority, reading_assignment, activities_required
         FROM assignment_questions WHERE assignment_id = ?
         ORDER BY reading_assignment, sorting_priority",
    )?;
    let rows = stmt
        .query_map([from], |r| {
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

    for (question_id, points, autograde, which, priority, reading, activities) in &rows {
        conn.execute(
            "INSERT INTO assignment_questions(id, assignment_id, question_id, points, autograde, which_to_grade, sorting_priority, reading_assignment, activities_required)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
            rusqlite::params![
                uuid::Uuid::new_v4().to_string(),
                to,
                question_id,
                points,
                autograde,
                which,
                priority,
                reading,
                activities
            ],
        )?;
    }
    Ok(rows.len())
}

/// Due timestamps accepted from the builder UI and from ISO-style clients.
pub fn parse_due(raw: &str) -> AssignResult<NaiveDateTime> {
    let raw = raw.trim();
    for fmt in ["%Y/%m/%d %H:%M", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Ok(dt);
        }
    }
    Err(AssignError::validation(format!("invalid due date {raw:?}")))
}

fn default_due() -> NaiveDateTime {
    let due = Utc::now().naive_utc() + Duration::days(7);
    // Stored at second precision.
    parse_datetime(&format_datetime(due)).unwrap_or(due)
}

fn validate_name(name: &str) -> AssignResult<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(AssignError::validation("name must not be empty"));
    }
    Ok(name.to_string())
}

/// Creates an empty assignment, or a same-course copy of `duplicate_of` under a new name.
pub fn create(
    conn: &Connection,
    ctx: &RequestContext,
    name: &str,
    duplicate_of: Option<&str>,
) -> AssignResult<Assignment> {
    let name = validate_name(name)?;
    catalog::fetch_course(conn, &ctx.course_id)?;

    let tx = conn.unchecked_transaction()?;
    let created = match duplicate_of {
        None => {
            let a = Assignment {
                id: uuid::Uuid::new_v4().to_string(),
                course_id: ctx.course_id.clone(),
                name,
                description: None,
                points: 0,
                due: default_due(),
                kind: AssignmentKind::Regular,
                released: false,
                enforce_due: false,
                visible: false,
                from_source: false,
                time_limit: None,
                nofeedback: false,
                nopause: false,
                threshold_pct: None,
            };
            insert(&tx, &a)?;
            a
        }
        Some(source_id) => {
            let source = fetch_in_course(&tx, ctx, source_id)?;
            let a = Assignment {
                id: uuid::Uuid::new_v4().to_string(),
                name,
                released: false,
                from_source: false,
                ..source.clone()
            };
            insert(&tx, &a)?;
            clone_question_rows(&tx, &source.id, &a.id)?;
            a
        }
    };
    tx.commit()?;
    info!(assignment_id = %created.id, course_id = %ctx.course_id, name = %created.name, "assignment created");
    Ok(created)
}

pub fn rename(
    conn: &Connection,
    ctx: &RequestContext,
    assignment_id: &str,
    new_name: &str,
) -> AssignResult<Assignment> {
    let new_name = validate_name(new_name)?;
    let a = fetch_in_course(conn, ctx, assignment_id)?;
    if a.name == new_name {
        return Ok(a);
    }
    if name_exists(conn, &ctx.course_id, &new_name)? {
        return Err(AssignError::DuplicateName { name: new_name });
    }
    conn.execute(
        "UPDATE assignments SET name = ? WHERE id = ?",
        (&new_name, assignment_id),
    )?;
    debug!(assignment_id, from = %a.name, to = %new_name, "assignment renamed");
    Ok(Assignment { name: new_name, ..a })
}

/// Deletes the assignment and, through the foreign keys, its question rows and scores.
pub fn delete(conn: &Connection, ctx: &RequestContext, assignment_id: &str) -> AssignResult<()> {
    fetch_in_course(conn, ctx, assignment_id)?;
    conn.execute("DELETE FROM assignments WHERE id = ?", [assignment_id])?;
    info!(assignment_id, "assignment deleted");
    Ok(())
}

/// Partial update of the top-level fields. Release goes through the release state machine.
#[derive(Debug, Default, Clone)]
pub struct AssignmentPatch {
    pub description: Option<Option<String>>,
    pub due: Option<NaiveDateTime>,
    pub kind: Option<AssignmentKind>,
    pub visible: Option<bool>,
    pub enforce_due: Option<bool>,
    pub time_limit: Option<Option<i64>>,
    pub nofeedback: Option<bool>,
    pub nopause: Option<bool>,
    pub threshold_pct: Option<Option<f64>>,
}

impl AssignmentPatch {
    fn apply(self, a: &mut Assignment) {
        if let Some(v) = self.description {
            a.description = v;
        }
        if let Some(v) = self.due {
            a.due = v;
        }
        if let Some(v) = self.kind {
            a.kind = v;
        }
        if let Some(v) = self.visible {
            a.visible = v;
        }
        if let Some(v) = self.enforce_due {
            a.enforce_due = v;
        }
        if let Some(v) = self.time_limit {
            a.time_limit = v;
        }
        if let Some(v) = self.nofeedback {
            a.nofeedback = v;
        }
        if let Some(v) = self.nopause {
            a.nopause = v;
        }
        if let Some(v) = self.threshold_pct {
            a.threshold_pct = v;
        }
    }
}

pub fn save(
    conn: &Connection,
    ctx: &RequestContext,
    assignment_id: &str,
    patch: AssignmentPatch,
) -> AssignResult<Assignment> {
    if let Some(Some(limit)) = patch.time_limit {
        if limit < 0 {
            return Err(AssignError::validation("timeLimit must be >= 0"));
        }
    }
    let mut a = fetch_in_course(conn, ctx, assignment_id)?;
    patch.apply(&mut a);
    conn.execute(
        "UPDATE assignments SET description = ?, due_date = ?, kind = ?, visible = ?, enforce_due = ?,
           time_limit = ?, nofeedback = ?, nopause = ?, threshold_pct = ?
         WHERE id = ?",
        rusqlite::params![
            a.description,
            format_datetime(a.due),
            a.kind.as_str(),
            a.visible,
            a.enforce_due,
            a.time_limit,
            a.nofeedback,
            a.nopause,
            a.threshold_pct,
            a.id
        ],
    )?;
    Ok(a)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::fixtures;
    use crate::db::open_memory;

    #[test]
    fn create_rejects_duplicate_names() {
        let conn = open_memory();
        fixtures::seed(&conn);
        let ctx = RequestContext::for_course("c-fall");
        create(&conn, &ctx, "Week 1", None).expect("create");
        let e = create(&conn, &ctx, "Week 1", None).expect_err("duplicate");
        assert_eq!(e.code(), "duplicate_name");

        // Same name in another course is fine.
        create(&conn, &RequestContext::for_course("c-book"), "Week 1", None).expect("other course");
    }

    #[test]
    fn rename_collision_is_reported_distinctly() {
        let conn = open_memory();
        fixtures::seed(&conn);
        let ctx = RequestContext::for_course("c-fall");
        create(&conn, &ctx, "A", None).expect("a");
        let b = create(&conn, &ctx, "B", None).expect("b");
        let e = rename(&conn, &ctx, &b.id, "A").expect_err("collision");
        assert!(matches!(e, AssignError::DuplicateName { .. }));
        let renamed = rename(&conn, &ctx, &b.id, "C").expect("rename");
        assert_eq!(fetch_assignment(&conn, &b.id).expect("fetch").name, "C");
        assert_eq!(renamed.name, "C");
    }

    #[test]
    fn assignments_of_other_courses_are_not_found() {
        let conn = open_memory();
        fixtures::seed(&conn);
        let a = create(&conn, &RequestContext::for_course("c-fall"), "A", None).expect("a");
        let e = delete(&conn, &RequestContext::for_course("c-book"), &a.id).expect_err("scoped");
        assert_eq!(e.code(), "not_found");
    }

    #[test]
    fn parse_due_accepts_builder_and_iso_formats() {
        let a = parse_due("2024/09/05 23:59").expect("builder");
        let b = parse_due("2024-09-05T23:59:00").expect("iso");
        assert_eq!(a, b);
        assert_eq!(parse_due("next friday").expect_err("bad").code(), "bad_params");
    }

    #[test]
    fn save_applies_patch_and_keeps_other_fields() {
        let conn = open_memory();
        fixtures::seed(&conn);
        let ctx = RequestContext::for_course("c-fall");
        let a = create(&conn, &ctx, "Quiz", None).expect("create");
        let saved = save(
            &conn,
            &ctx,
            &a.id,
            AssignmentPatch {
                kind: Some(AssignmentKind::from_flags(true, false)),
                visible: Some(true),
                time_limit: Some(Some(45)),
                ..Default::default()
            },
        )
        .expect("save");
        assert_eq!(saved.kind, AssignmentKind::Timed);
        let reloaded = fetch_assignment(&conn, &a.id).expect("reload");
        assert_eq!(reloaded, saved);
        assert_eq!(reloaded.due, a.due);
    }
}
