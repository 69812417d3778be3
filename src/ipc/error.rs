use serde_json::json;

use crate::error::AssignError;

pub fn ok(id: &str, result: serde_json::Value) -> serde_json::Value {
    json!({
        "id": id,
        "ok": true,
        "result": result
    })
}

pub fn err(
    id: &str,
    code: &str,
    message: impl Into<String>,
    details: Option<serde_json::Value>,
) -> serde_json::Value {
    let mut error = json!({
        "code": code,
        "message": message.into(),
    });
    if let Some(d) = details {
        error["details"] = d;
    }
    json!({
        "id": id,
        "ok": false,
        "error": error,
    })
}

/// Envelope for a domain error, keeping its stable code and details.
pub fn fail(id: &str, e: &AssignError) -> serde_json::Value {
    if matches!(e, AssignError::Db(_)) {
        tracing::error!(error = %e, "database error");
    }
    err(id, e.code(), e.to_string(), e.details())
}

pub fn respond(id: &str, result: Result<serde_json::Value, AssignError>) -> serde_json::Value {
    match result {
        Ok(v) => ok(id, v),
        Err(e) => fail(id, &e),
    }
}
