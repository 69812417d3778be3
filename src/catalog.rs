//! Read access to the records this sidecar does not own: courses, questions, competencies,
//! LTI keys and computed scores. The host platform feeds them through `catalog.load`.

use chrono::{NaiveDate, NaiveDateTime};
use rusqlite::{Connection, OptionalExtension, Row};
use serde::Deserialize;

use crate::error::{AssignError, AssignResult};
use crate::policy::QuestionType;

pub const DATE_FORMAT: &str = "%Y-%m-%d";
pub const DATETIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

#[derive(Debug, Clone, PartialEq)]
pub struct Course {
    pub id: String,
    pub course_name: String,
    pub base_course: String,
    pub term_start: NaiveDate,
    pub lti_version: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Question {
    pub id: String,
    pub name: String,
    pub base_course: String,
    pub chapter: Option<String>,
    pub subchapter: Option<String>,
    pub question_type: QuestionType,
    pub autograde: Option<String>,
    pub optional: bool,
    pub from_source: bool,
    pub source: Option<String>,
}

impl Question {
    pub fn has_unit_test(&self) -> bool {
        self.autograde.as_deref() == Some("unittest")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Competency {
    pub tag: String,
    pub is_primary: bool,
}

#[derive(Clone)]
pub struct LtiCredential {
    pub consumer: String,
    pub secret: String,
}

impl std::fmt::Debug for LtiCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LtiCredential")
            .field("consumer", &self.consumer)
            .field("secret", &"***")
            .finish()
    }
}

fn parse_date(raw: &str) -> AssignResult<NaiveDate> {
    NaiveDate::parse_from_str(raw, DATE_FORMAT)
        .map_err(|e| AssignError::validation(format!("invalid date {raw:?}: {e}")))
}

pub fn parse_datetime(raw: &str) -> AssignResult<NaiveDateTime> {
    NaiveDateTime::parse_from_str(raw, DATETIME_FORMAT)
        .map_err(|e| AssignError::validation(format!("invalid timestamp {raw:?}: {e}")))
}

pub fn format_datetime(dt: NaiveDateTime) -> String {
    dt.format(DATETIME_FORMAT).to_string()
}

fn course_from_row(row: &Row<'_>) -> rusqlite::Result<(String, String, String, String, Option<String>)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn into_course(raw: (String, String, String, String, Option<String>)) -> AssignResult<Course> {
    let (id, course_name, base_course, term_start, lti_version) = raw;
    Ok(Course {
        id,
        course_name,
        base_course,
        term_start: parse_date(&term_start)?,
        lti_version,
    })
}

pub fn fetch_course(conn: &Connection, course_id: &str) -> AssignResult<Course> {
    let raw = conn
        .query_row(
            "SELECT id, course_name, base_course, term_start_date, lti_version FROM courses WHERE id = ?",
            [course_id],
            course_from_row,
        )
        .optional()?;
    match raw {
        Some(raw) => into_course(raw),
        None => Err(AssignError::not_found(format!("course {course_id}"))),
    }
}

pub fn fetch_course_by_name(conn: &Connection, course_name: &str) -> AssignResult<Option<Course>> {
    let raw = conn
        .query_row(
            "SELECT id, course_name, base_course, term_start_date, lti_version FROM courses WHERE course_name = ?",
            [course_name],
            course_from_row,
        )
        .optional()?;
    raw.map(into_course).transpose()
}

const QUESTION_COLUMNS: &str = "q.id, q.name, q.base_course, q.chapter, q.subchapter, q.question_type, q.autograde, q.optional, q.from_source, q.source";

type RawQuestion = (
    String,
    String,
    String,
    Option<String>,
    Option<String>,
    String,
    Option<String>,
    bool,
    bool,
    Option<String>,
);

fn question_from_row(row: &Row<'_>) -> rusqlite::Result<RawQuestion> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
    ))
}

fn into_question(raw: RawQuestion) -> AssignResult<Question> {
    let (id, name, base_course, chapter, subchapter, qtype, autograde, optional, from_source, source) =
        raw;
    let Some(question_type) = QuestionType::parse(&qtype) else {
        return Err(AssignError::validation(format!(
            "question {name} has unknown type {qtype}"
        )));
    };
    Ok(Question {
        id,
        name,
        base_course,
        chapter,
        subchapter,
        question_type,
        autograde,
        optional,
        from_source,
        source,
    })
}

pub fn fetch_question(conn: &Connection, question_id: &str) -> AssignResult<Question> {
    let sql = format!("SELECT {QUESTION_COLUMNS} FROM questions q WHERE q.id = ?");
    let raw = conn.query_row(&sql, [question_id], question_from_row).optional()?;
    match raw {
        Some(raw) => into_question(raw),
        None => Err(AssignError::not_found(format!("question {question_id}"))),
    }
}

fn questions_where(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> AssignResult<Vec<Question>> {
    let mut stmt = conn.prepare(sql)?;
    let raws = stmt
        .query_map(params, question_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    raws.into_iter().map(into_question).collect()
}

/// Resolves a question name the way the assignment builder does: a unique name wins outright;
/// with several matches the copy already linked to the assignment is preferred, then the copy
/// belonging to the course's base course.
pub fn resolve_question_name(
    conn: &Connection,
    name: &str,
    course: &Course,
    assignment_id: Option<&str>,
) -> AssignResult<Option<Question>> {
    let sql = format!("SELECT {QUESTION_COLUMNS} FROM questions q WHERE q.name = ? ORDER BY q.id");
    let mut matches = questions_where(conn, &sql, [name])?;
    if matches.len() <= 1 {
        return Ok(matches.pop());
    }

    if let Some(aid) = assignment_id {
        let sql = format!(
            "SELECT {QUESTION_COLUMNS} FROM questions q
             JOIN assignment_questions aq ON aq.question_id = q.id
             WHERE q.name = ? AND aq.assignment_id = ?"
        );
        if let Some(q) = questions_where(conn, &sql, (name, aid))?.into_iter().next() {
            return Ok(Some(q));
        }
    }

    Ok(matches
        .into_iter()
        .find(|q| q.base_course == course.base_course))
}

pub fn find_question_id_by_name(conn: &Connection, name: &str) -> AssignResult<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT id FROM questions WHERE name = ? ORDER BY id LIMIT 1",
            [name],
            |r| r.get(0),
        )
        .optional()?)
}

/// Number of required, book-sourced activities on one page of the base course.
pub fn count_activities(
    conn: &Connection,
    chapter: Option<&str>,
    subchapter: Option<&str>,
    base_course: &str,
) -> AssignResult<i64> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM questions
         WHERE chapter IS ? AND subchapter IS ? AND base_course = ?
           AND from_source = 1 AND optional = 0",
        (chapter, subchapter, base_course),
        |r| r.get(0),
    )?)
}

pub fn fetch_competencies(conn: &Connection, question_id: &str) -> AssignResult<Vec<Competency>> {
    let mut stmt = conn.prepare(
        "SELECT competency, is_primary FROM competencies WHERE question_id = ? ORDER BY competency",
    )?;
    let rows = stmt
        .query_map([question_id], |r| {
            Ok(Competency {
                tag: r.get(0)?,
                is_primary: r.get(1)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn questions_with_competency(conn: &Connection, tag: &str) -> AssignResult<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT question_id FROM competencies WHERE competency = ? ORDER BY question_id",
    )?;
    let ids = stmt
        .query_map([tag], |r| r.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(ids)
}

pub fn fetch_scores(conn: &Connection, assignment_id: &str) -> AssignResult<Vec<(String, f64)>> {
    let mut stmt = conn.prepare(
        "SELECT student_id, score FROM scores WHERE assignment_id = ? ORDER BY student_id",
    )?;
    let rows = stmt
        .query_map([assignment_id], |r| Ok((r.get(0)?, r.get(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn fetch_lti_credential(
    conn: &Connection,
    course_id: &str,
    consumer: &str,
) -> AssignResult<Option<LtiCredential>> {
    Ok(conn
        .query_row(
            "SELECT k.consumer, k.secret FROM lti_keys k
             JOIN course_lti_map m ON m.lti_id = k.id
             WHERE m.course_id = ? AND k.consumer = ?",
            (course_id, consumer),
            |r| {
                Ok(LtiCredential {
                    consumer: r.get(0)?,
                    secret: r.get(1)?,
                })
            },
        )
        .optional()?)
}

pub fn create_lti_keys(conn: &Connection, course: &Course) -> AssignResult<LtiCredential> {
    let credential = LtiCredential {
        consumer: format!("{}-{}", course.course_name, uuid::Uuid::new_v4()),
        secret: uuid::Uuid::new_v4().to_string(),
    };
    let lti_id = uuid::Uuid::new_v4().to_string();
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "INSERT INTO lti_keys(id, consumer, secret) VALUES(?, ?, ?)",
        (&lti_id, &credential.consumer, &credential.secret),
    )?;
    tx.execute(
        "INSERT INTO course_lti_map(course_id, lti_id) VALUES(?, ?)",
        (&course.id, &lti_id),
    )?;
    tx.commit()?;
    Ok(credential)
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogPayload {
    #[serde(default)]
    pub courses: Vec<CourseRecord>,
    #[serde(default)]
    pub questions: Vec<QuestionRecord>,
    #[serde(default)]
    pub competencies: Vec<CompetencyRecord>,
    #[serde(default)]
    pub lti_keys: Vec<LtiKeyRecord>,
    #[serde(default)]
    pub scores: Vec<ScoreRecord>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CourseRecord {
    pub id: String,
    pub course_name: String,
    pub base_course: Option<String>,
    pub term_start_date: String,
    #[serde(default)]
    pub lti_version: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionRecord {
    pub id: String,
    pub name: String,
    pub base_course: String,
    #[serde(default)]
    pub chapter: Option<String>,
    #[serde(default)]
    pub subchapter: Option<String>,
    pub question_type: String,
    #[serde(default)]
    pub autograde: Option<String>,
    #[serde(default)]
    pub optional: bool,
    #[serde(default)]
    pub from_source: bool,
    #[serde(default)]
    pub source: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompetencyRecord {
    pub question_id: String,
    pub competency: String,
    #[serde(default)]
    pub is_primary: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LtiKeyRecord {
    pub course_id: String,
    pub consumer: String,
    pub secret: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreRecord {
    pub assignment_id: String,
    pub student_id: String,
    pub score: f64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LoadSummary {
    pub courses: usize,
    pub questions: usize,
    pub competencies: usize,
    pub lti_keys: usize,
    pub scores: usize,
}

/// Upserts collaborator records in one transaction; any invalid record rejects the whole load.
pub fn load(conn: &Connection, payload: &CatalogPayload) -> AssignResult<LoadSummary> {
    for c in &payload.courses {
        parse_date(&c.term_start_date)?;
        if let Some(v) = c.lti_version.as_deref() {
            if v != "1.1" && v != "1.3" {
                return Err(AssignError::validation(format!(
                    "course {} has unsupported lti version {v}",
                    c.id
                )));
            }
        }
    }
    for q in &payload.questions {
        if QuestionType::parse(&q.question_type).is_none() {
            return Err(AssignError::validation(format!(
                "question {} has unknown type {}",
                q.name, q.question_type
            )));
        }
    }

    let tx = conn.unchecked_transaction()?;
    let mut summary = LoadSummary::default();
    for c in &payload.courses {
        let base = c.base_course.clone().unwrap_or_else(|| c.course_name.clone());
        tx.execute(
            "INSERT INTO courses(id, course_name, base_course, term_start_date, lti_version)
             VALUES(?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
               course_name = excluded.course_name,
               base_course = excluded.base_course,
               term_start_date = excluded.term_start_date,
               lti_version = excluded.lti_version",
            (&c.id, &c.course_name, &base, &c.term_start_date, &c.lti_version),
        )?;
        summary.courses += 1;
    }
    for q in &payload.questions {
        tx.execute(
            "INSERT INTO questions(id, name, base_course, chapter, subchapter, question_type, autograde, optional, from_source, source)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
               name = excluded.name,
               base_course = excluded.base_course,
               chapter = excluded.chapter,
               subchapter = excluded.subchapter,
               question_type = excluded.question_type,
               autograde = excluded.autograde,
               optional = excluded.optional,
               from_source = excluded.from_source,
               source = excluded.source",
            rusqlite::params![
                q.id,
                q.name,
                q.base_course,
                q.chapter,
                q.subchapter,
                q.question_type,
                q.autograde,
                q.optional,
                q.from_source,
                q.source
            ],
        )?;
        summary.questions += 1;
    }
    for c in &payload.competencies {
        tx.execute(
            "INSERT INTO competencies(question_id, competency, is_primary) VALUES(?, ?, ?)
             ON CONFLICT(question_id, competency) DO UPDATE SET is_primary = excluded.is_primary",
            (&c.question_id, &c.competency, c.is_primary),
        )?;
        summary.competencies += 1;
    }
    for k in &payload.lti_keys {
        let existing: Option<String> = tx
            .query_row(
                "SELECT id FROM lti_keys WHERE consumer = ?",
                [&k.consumer],
                |r| r.get(0),
            )
            .optional()?;
        let lti_id = match existing {
            Some(id) => {
                tx.execute("UPDATE lti_keys SET secret = ? WHERE id = ?", (&k.secret, &id))?;
                id
            }
            None => {
                let id = uuid::Uuid::new_v4().to_string();
                tx.execute(
                    "INSERT INTO lti_keys(id, consumer, secret) VALUES(?, ?, ?)",
                    (&id, &k.consumer, &k.secret),
                )?;
                id
            }
        };
        tx.execute(
            "INSERT OR IGNORE INTO course_lti_map(course_id, lti_id) VALUES(?, ?)",
            (&k.course_id, &lti_id),
        )?;
        summary.lti_keys += 1;
    }
    for s in &payload.scores {
        tx.execute(
            "INSERT INTO scores(assignment_id, student_id, score) VALUES(?, ?, ?)
             ON CONFLICT(assignment_id, student_id) DO UPDATE SET score = excluded.score",
            (&s.assignment_id, &s.student_id, s.score),
        )?;
        summary.scores += 1;
    }
    tx.commit()?;
    Ok(summary)
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use serde_json::json;

    /// Two offerings of one book plus a handful of questions on page ch1/s1.
    pub fn seed(conn: &Connection) {
        let payload: CatalogPayload = serde_json::from_value(json!({
            "courses": [
                { "id": "c-book", "courseName": "pybook", "baseCourse": "pybook", "termStartDate": "2024-01-01" },
                { "id": "c-fall", "courseName": "py-fall", "baseCourse": "pybook", "termStartDate": "2024-09-02", "ltiVersion": "1.3" },
                { "id": "c-other", "courseName": "jsbook", "baseCourse": "jsbook", "termStartDate": "2024-01-01" }
            ],
            "questions": [
                { "id": "q-page", "name": "ch1/s1", "baseCourse": "pybook", "chapter": "ch1", "subchapter": "s1", "questionType": "page" },
                { "id": "q-a1", "name": "act1", "baseCourse": "pybook", "chapter": "ch1", "subchapter": "s1", "questionType": "mchoice", "fromSource": true },
                { "id": "q-a2", "name": "act2", "baseCourse": "pybook", "chapter": "ch1", "subchapter": "s1", "questionType": "fillintheblank", "fromSource": true },
                { "id": "q-a3", "name": "act3", "baseCourse": "pybook", "chapter": "ch1", "subchapter": "s1", "questionType": "activecode", "fromSource": true },
                { "id": "q-opt", "name": "act-opt", "baseCourse": "pybook", "chapter": "ch1", "subchapter": "s1", "questionType": "mchoice", "fromSource": true, "optional": true },
                { "id": "q-mc", "name": "Q1", "baseCourse": "pybook", "questionType": "mchoice" },
                { "id": "q-code", "name": "Q2", "baseCourse": "pybook", "questionType": "activecode" },
                { "id": "q-unit", "name": "Q3", "baseCourse": "pybook", "questionType": "activecode", "autograde": "unittest" },
                { "id": "q-dup-js", "name": "shared", "baseCourse": "jsbook", "questionType": "mchoice" },
                { "id": "q-dup-py", "name": "shared", "baseCourse": "pybook", "questionType": "mchoice" }
            ]
        }))
        .expect("fixture payload");
        load(conn, &payload).expect("seed catalog");
    }
}
