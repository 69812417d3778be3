use crate::composer::{ActivitiesRequest, Composer, QuestionRef, QuestionSettings};
use crate::ipc::error::{err, respond};
use crate::ipc::helpers::{
    optional_i64, optional_str, request_context, requested, required_str, string_list,
};
use crate::ipc::types::{AppState, Request};
use crate::policy::{Autograde, WhichToGrade};
use serde_json::{json, Value};

fn bad_params(req: &Request, msg: impl Into<String>) -> Value {
    err(&req.id, "bad_params", msg, None)
}

fn parse_question_ref(params: &Value) -> Result<QuestionRef, String> {
    if let Some(id) = optional_str(params, "questionId")? {
        return Ok(QuestionRef::Id(id.to_string()));
    }
    match optional_str(params, "questionName")? {
        Some(name) if !name.trim().is_empty() => Ok(QuestionRef::Name(name.to_string())),
        _ => Err("missing params.questionId or params.questionName".into()),
    }
}

// "auto" and -1 both ask for the derived requirement.
fn parse_activities(params: &Value) -> Result<ActivitiesRequest, String> {
    match params.get("activitiesRequired") {
        None | Some(Value::Null) => Ok(ActivitiesRequest::Absent),
        Some(Value::String(s)) if s == "auto" => Ok(ActivitiesRequest::Auto),
        Some(v) => match v.as_i64() {
            Some(-1) => Ok(ActivitiesRequest::Auto),
            Some(n) if n < 0 => Err(format!("activitiesRequired must not be negative, got {n}")),
            Some(n) => Ok(ActivitiesRequest::Count(n)),
            None => Err("activitiesRequired must be an integer or \"auto\"".into()),
        },
    }
}

fn parse_settings(params: &Value) -> Result<QuestionSettings, String> {
    Ok(QuestionSettings {
        points: optional_i64(params, "points")?,
        autograde: requested(params, "autograde", Autograde::parse)?,
        which_to_grade: requested(params, "whichToGrade", WhichToGrade::parse)?,
        activities_required: parse_activities(params)?,
        sort_position: optional_i64(params, "sortPosition")?,
    })
}

fn handle_upsert(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let ctx = match request_context(&req.params) {
        Ok(v) => v,
        Err(msg) => return bad_params(req, msg),
    };
    let assignment_id = match required_str(&req.params, "assignmentId") {
        Ok(v) => v,
        Err(msg) => return bad_params(req, msg),
    };
    let question = match parse_question_ref(&req.params) {
        Ok(v) => v,
        Err(msg) => return bad_params(req, msg),
    };
    let settings = match parse_settings(&req.params) {
        Ok(v) => v,
        Err(msg) => return bad_params(req, msg),
    };
    let result = Composer::new(conn, &state.locks, &ctx)
        .add_or_update_question(assignment_id, &question, &settings)
        .map(|agg| json!(agg));
    respond(&req.id, result)
}

fn handle_remove(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let ctx = match request_context(&req.params) {
        Ok(v) => v,
        Err(msg) => return bad_params(req, msg),
    };
    let (assignment_id, name) = match (
        required_str(&req.params, "assignmentId"),
        required_str(&req.params, "questionName"),
    ) {
        (Ok(a), Ok(n)) => (a, n),
        (Err(msg), _) | (_, Err(msg)) => return bad_params(req, msg),
    };
    let result = Composer::new(conn, &state.locks, &ctx)
        .remove_question(assignment_id, name)
        .map(|total| json!({ "totalPoints": total }));
    respond(&req.id, result)
}

fn handle_reorder(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let ctx = match request_context(&req.params) {
        Ok(v) => v,
        Err(msg) => return bad_params(req, msg),
    };
    let assignment_id = match required_str(&req.params, "assignmentId") {
        Ok(v) => v,
        Err(msg) => return bad_params(req, msg),
    };
    let names = match string_list(&req.params, "names") {
        Ok(v) => v,
        Err(msg) => return bad_params(req, msg),
    };
    let result = Composer::new(conn, &state.locks, &ctx)
        .reorder(assignment_id, &names)
        .map(|out| json!(out));
    respond(&req.id, result)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "assignmentQuestions.upsert" => Some(handle_upsert(state, req)),
        "assignmentQuestions.remove" => Some(handle_remove(state, req)),
        "assignmentQuestions.reorder" => Some(handle_reorder(state, req)),
        _ => None,
    }
}
