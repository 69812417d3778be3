use crate::catalog::{self, CatalogPayload};
use crate::ipc::error::{err, fail, ok};
use crate::ipc::helpers::required_str;
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use tracing::info;

fn handle_catalog_load(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let payload: CatalogPayload = match serde_json::from_value(req.params.clone()) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "bad_params", format!("invalid catalog payload: {e}"), None),
    };
    match catalog::load(conn, &payload) {
        Ok(summary) => {
            info!(
                courses = summary.courses,
                questions = summary.questions,
                competencies = summary.competencies,
                scores = summary.scores,
                "catalog loaded"
            );
            ok(
                &req.id,
                json!({
                    "courses": summary.courses,
                    "questions": summary.questions,
                    "competencies": summary.competencies,
                    "ltiKeys": summary.lti_keys,
                    "scores": summary.scores,
                }),
            )
        }
        Err(e) => fail(&req.id, &e),
    }
}

fn handle_lti_create_keys(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let course_id = match required_str(&req.params, "courseId") {
        Ok(v) => v,
        Err(msg) => return err(&req.id, "bad_params", msg, None),
    };
    let course = match catalog::fetch_course(conn, course_id) {
        Ok(c) => c,
        Err(e) => return fail(&req.id, &e),
    };
    match catalog::create_lti_keys(conn, &course) {
        Ok(credential) => {
            info!(course_id, consumer = %credential.consumer, "lti keys created");
            ok(
                &req.id,
                json!({
                    "consumer": credential.consumer,
                    "secret": credential.secret,
                }),
            )
        }
        Err(e) => fail(&req.id, &e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "catalog.load" => Some(handle_catalog_load(state, req)),
        "lti.createKeys" => Some(handle_lti_create_keys(state, req)),
        _ => None,
    }
}
