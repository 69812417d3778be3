use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::handlers::setup;
use crate::ipc::helpers::required_str;
use crate::ipc::types::{AppState, Request};
use serde_json::{json, Value};
use std::path::PathBuf;
use tracing::{info, warn};

fn handle_health(state: &mut AppState, req: &Request) -> Value {
    let sync = state.dispatcher.config();
    ok(
        &req.id,
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "workspacePath": state.workspace.as_ref().map(|p| p.to_string_lossy().to_string()),
            "scoreEndpoint": sync.endpoint,
            "ltiVersions": ["1.1", "1.3"],
        }),
    )
}

/// Opens (or creates) the workspace database, then layers its saved sync and simulation
/// overrides on top of the environment config.
fn handle_workspace_select(state: &mut AppState, req: &Request) -> Value {
    let path = match required_str(&req.params, "path") {
        Ok(p) => PathBuf::from(p),
        Err(msg) => return err(&req.id, "bad_params", msg, None),
    };

    let conn = match db::open_db(&path) {
        Ok(c) => c,
        Err(e) => {
            warn!(workspace = %path.display(), error = %e, "workspace open failed");
            return err(&req.id, "db_open_failed", format!("{e:?}"), None);
        }
    };
    if let Err(e) = setup::apply_workspace_settings(state, &conn) {
        warn!(error = %e, "saved workspace settings ignored");
    }
    if let Some(previous) = state.workspace.replace(path.clone()) {
        if previous != path {
            info!(previous = %previous.display(), "closing workspace");
        }
    }
    state.db = Some(conn);
    info!(workspace = %path.display(), "workspace selected");
    ok(&req.id, json!({ "workspacePath": path.to_string_lossy() }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "health" => Some(handle_health(state, req)),
        "workspace.select" => Some(handle_workspace_select(state, req)),
        _ => None,
    }
}
