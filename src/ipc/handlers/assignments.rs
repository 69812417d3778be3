use crate::assignment::{self, AssignmentKind, AssignmentPatch};
use crate::catalog;
use crate::composer::Composer;
use crate::error::AssignError;
use crate::ipc::error::{err, respond};
use crate::ipc::helpers::{
    nullable, optional_bool, optional_str, request_context, required_str,
};
use crate::ipc::types::{AppState, Request};
use serde_json::{json, Value};

fn bad_params(req: &Request, msg: impl Into<String>) -> Value {
    err(&req.id, "bad_params", msg, None)
}

fn handle_assignments_list(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let ctx = match request_context(&req.params) {
        Ok(v) => v,
        Err(msg) => return bad_params(req, msg),
    };
    let result = catalog::fetch_course(conn, &ctx.course_id)
        .and_then(|_| assignment::list_for_course(conn, &ctx.course_id))
        .map(|rows| json!({ "assignments": rows }));
    respond(&req.id, result)
}

fn handle_assignments_get(state: &mut AppState, req: &Request) -> Value {
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
    let result = Composer::new(conn, &state.locks, &ctx)
        .view(assignment_id)
        .map(|view| json!(view));
    respond(&req.id, result)
}

fn handle_assignments_create(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let ctx = match request_context(&req.params) {
        Ok(v) => v,
        Err(msg) => return bad_params(req, msg),
    };
    let name = match required_str(&req.params, "name") {
        Ok(v) => v,
        Err(msg) => return bad_params(req, msg),
    };
    let duplicate_of = match optional_str(&req.params, "duplicateOf") {
        Ok(v) => v,
        Err(msg) => return bad_params(req, msg),
    };
    let result = assignment::create(conn, &ctx, name, duplicate_of)
        .map(|a| json!({ "assignment": a }));
    respond(&req.id, result)
}

fn handle_assignments_rename(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let ctx = match request_context(&req.params) {
        Ok(v) => v,
        Err(msg) => return bad_params(req, msg),
    };
    let (assignment_id, name) = match (
        required_str(&req.params, "assignmentId"),
        required_str(&req.params, "name"),
    ) {
        (Ok(a), Ok(n)) => (a, n),
        (Err(msg), _) | (_, Err(msg)) => return bad_params(req, msg),
    };
    let result = assignment::rename(conn, &ctx, assignment_id, name)
        .map(|a| json!({ "assignment": a }));
    respond(&req.id, result)
}

fn parse_patch(params: &Value) -> Result<AssignmentPatch, String> {
    let mut patch = AssignmentPatch {
        description: nullable(params, "description", |v| v.as_str().map(str::to_string))?,
        visible: optional_bool(params, "visible")?,
        enforce_due: optional_bool(params, "enforceDue")?,
        time_limit: nullable(params, "timeLimit", Value::as_i64)?,
        nofeedback: optional_bool(params, "nofeedback")?,
        nopause: optional_bool(params, "nopause")?,
        threshold_pct: nullable(params, "thresholdPct", Value::as_f64)?,
        ..Default::default()
    };
    if let Some(raw) = optional_str(params, "due")? {
        patch.due = Some(assignment::parse_due(raw).map_err(|e| e.to_string())?);
    }
    if let Some(raw) = optional_str(params, "kind")? {
        patch.kind = Some(
            AssignmentKind::parse(raw).ok_or_else(|| format!("unknown assignment kind: {raw}"))?,
        );
    } else {
        let timed = optional_bool(params, "isTimed")?;
        let peer = optional_bool(params, "isPeer")?;
        if timed.is_some() || peer.is_some() {
            patch.kind = Some(AssignmentKind::from_flags(
                timed.unwrap_or(false),
                peer.unwrap_or(false),
            ));
        }
    }
    Ok(patch)
}

fn handle_assignments_save(state: &mut AppState, req: &Request) -> Value {
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
    let patch = match parse_patch(&req.params) {
        Ok(p) => p,
        Err(msg) => return bad_params(req, msg),
    };
    let result = assignment::save(conn, &ctx, assignment_id, patch)
        .map(|a| json!({ "assignment": a }));
    respond(&req.id, result)
}

fn handle_assignments_delete(state: &mut AppState, req: &Request) -> Value {
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
    let result = assignment::delete(conn, &ctx, assignment_id).map(|()| json!({ "ok": true }));
    if result.is_ok() {
        state.locks.forget(assignment_id);
    }
    respond(&req.id, result)
}

fn handle_assignments_duplicate(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let ctx = match request_context(&req.params) {
        Ok(v) => v,
        Err(msg) => return bad_params(req, msg),
    };
    let source_id = match required_str(&req.params, "sourceAssignmentId") {
        Ok(v) => v,
        Err(msg) => return bad_params(req, msg),
    };
    let result = Composer::new(conn, &state.locks, &ctx)
        .duplicate(source_id)
        .map(|out| json!(out));
    respond(&req.id, result)
}

fn handle_assignments_duplicate_all(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let ctx = match request_context(&req.params) {
        Ok(v) => v,
        Err(msg) => return bad_params(req, msg),
    };
    let result: Result<Value, AssignError> = Composer::new(conn, &state.locks, &ctx)
        .duplicate_all()
        .map(|copies| json!({ "copied": copies.len(), "assignments": copies }));
    respond(&req.id, result)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "assignments.list" => Some(handle_assignments_list(state, req)),
        "assignments.get" => Some(handle_assignments_get(state, req)),
        "assignments.create" => Some(handle_assignments_create(state, req)),
        "assignments.rename" => Some(handle_assignments_rename(state, req)),
        "assignments.save" => Some(handle_assignments_save(state, req)),
        "assignments.delete" => Some(handle_assignments_delete(state, req)),
        "assignments.duplicate" => Some(handle_assignments_duplicate(state, req)),
        "assignments.duplicateAll" => Some(handle_assignments_duplicate_all(state, req)),
        _ => None,
    }
}
