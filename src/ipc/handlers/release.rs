use crate::catalog;
use crate::ipc::error::{err, ok, respond};
use crate::ipc::helpers::{request_context, required_str};
use crate::ipc::types::{AppState, Request};
use crate::release;
use crate::sync::PushOutcome;
use serde_json::{json, Value};

fn bad_params(req: &Request, msg: impl Into<String>) -> Value {
    err(&req.id, "bad_params", msg, None)
}

fn handle_release_set(state: &mut AppState, req: &Request) -> Value {
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
    let Some(released) = req.params.get("released").and_then(|v| v.as_bool()) else {
        return bad_params(req, "params.released must be boolean");
    };
    let result = release::set_released(conn, &ctx, &state.dispatcher, assignment_id, released)
        .map(|out| json!(out));
    respond(&req.id, result)
}

fn handle_release_states(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let ctx = match request_context(&req.params) {
        Ok(v) => v,
        Err(msg) => return bad_params(req, msg),
    };
    let result = catalog::fetch_course(conn, &ctx.course_id)
        .and_then(|_| release::release_states(conn, &ctx.course_id))
        .map(|states| json!({ "states": states }));
    respond(&req.id, result)
}

fn handle_grades_push(state: &mut AppState, req: &Request) -> Value {
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
    let result = release::push_grades(conn, &ctx, &state.dispatcher, assignment_id).map(|out| {
        match out {
            Some(PushOutcome::Delivered(r)) => json!({
                "pushed": true,
                "state": "succeeded",
                "protocol": r.protocol,
                "delivered": r.delivered,
            }),
            // Still running; grades.syncStatus reports the result.
            Some(PushOutcome::Pending(protocol)) => json!({
                "pushed": true,
                "state": "pending",
                "protocol": protocol,
            }),
            None => json!({ "pushed": false, "delivered": 0 }),
        }
    });
    respond(&req.id, result)
}

fn handle_grades_sync_status(state: &mut AppState, req: &Request) -> Value {
    let assignment_id = match required_str(&req.params, "assignmentId") {
        Ok(v) => v,
        Err(msg) => return bad_params(req, msg),
    };
    match state.dispatcher.status(assignment_id) {
        Some(status) => ok(&req.id, json!(status)),
        None => ok(&req.id, json!({ "state": "idle" })),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "release.set" => Some(handle_release_set(state, req)),
        "release.states" => Some(handle_release_states(state, req)),
        "grades.push" => Some(handle_grades_push(state, req)),
        "grades.syncStatus" => Some(handle_grades_sync_status(state, req)),
        _ => None,
    }
}
