use crate::config::Config;
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::info;

#[derive(Clone, Copy)]
enum SetupSection {
    Sync,
    Simulation,
}

impl SetupSection {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "sync" => Some(Self::Sync),
            "simulation" => Some(Self::Simulation),
            _ => None,
        }
    }

    fn key(self) -> &'static str {
        match self {
            Self::Sync => "setup.sync",
            Self::Simulation => "setup.simulation",
        }
    }
}

fn default_section(section: SetupSection, base: &Config) -> Value {
    match section {
        SetupSection::Sync => json!({
            "endpoint": base.sync.endpoint,
            "timeoutSecs": base.sync.timeout.as_secs(),
            "maxRetries": base.sync.max_retries,
            "backoffMs": u64::try_from(base.sync.backoff_base.as_millis()).unwrap_or(u64::MAX),
        }),
        SetupSection::Simulation => json!({
            "trials": base.simulation_trials,
        }),
    }
}

fn as_object_mut(value: &mut Value) -> Result<&mut Map<String, Value>, String> {
    value
        .as_object_mut()
        .ok_or_else(|| "internal setup object must be a JSON object".to_string())
}

fn parse_i64_range(v: &Value, key: &str, min: i64, max: i64) -> Result<i64, String> {
    let n = v
        .as_i64()
        .ok_or_else(|| format!("{} must be integer", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

fn parse_endpoint(v: &Value, key: &str) -> Result<Value, String> {
    if v.is_null() {
        return Ok(Value::Null);
    }
    let s = v.as_str().ok_or_else(|| format!("{} must be string or null", key))?;
    let s = s.trim().trim_end_matches('/');
    if s.is_empty() {
        return Ok(Value::Null);
    }
    if !(s.starts_with("http://") || s.starts_with("https://")) {
        return Err(format!("{} must be an http(s) URL", key));
    }
    if s.len() > 500 {
        return Err(format!("{} length must be <= 500", key));
    }
    Ok(Value::String(s.to_string()))
}

fn merge_section_patch(
    section: SetupSection,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let obj = as_object_mut(current)?;
    for (k, v) in patch {
        match section {
            SetupSection::Sync => match k.as_str() {
                "endpoint" => {
                    obj.insert(k.clone(), parse_endpoint(v, k)?);
                }
                "timeoutSecs" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 1, 120)?));
                }
                "maxRetries" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 0, 10)?));
                }
                "backoffMs" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 10, 10_000)?));
                }
                _ => return Err(format!("unknown sync field: {}", k)),
            },
            SetupSection::Simulation => match k.as_str() {
                "trials" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 1, 10_000)?));
                }
                _ => return Err(format!("unknown simulation field: {}", k)),
            },
        }
    }
    Ok(())
}

fn load_section(
    conn: &rusqlite::Connection,
    section: SetupSection,
    base: &Config,
) -> anyhow::Result<Value> {
    let mut current = default_section(section, base);
    if let Some(saved) = db::settings_get_json(conn, section.key())? {
        if let Some(saved_obj) = saved.as_object() {
            // Best-effort apply: a malformed saved value falls back to the default.
            let _ = merge_section_patch(section, &mut current, saved_obj);
        }
    }
    Ok(current)
}

fn u64_field(v: &Value, key: &str, fallback: u64) -> u64 {
    v.get(key).and_then(|x| x.as_u64()).unwrap_or(fallback)
}

/// Environment settings with the workspace's saved overrides applied.
pub fn effective_config(conn: &rusqlite::Connection, base: &Config) -> anyhow::Result<Config> {
    let sync = load_section(conn, SetupSection::Sync, base)?;
    let sim = load_section(conn, SetupSection::Simulation, base)?;

    let mut cfg = base.clone();
    cfg.sync.endpoint = sync
        .get("endpoint")
        .and_then(|v| v.as_str())
        .map(str::to_string);
    cfg.sync.timeout = Duration::from_secs(u64_field(&sync, "timeoutSecs", cfg.sync.timeout.as_secs()));
    cfg.sync.max_retries = u64_field(&sync, "maxRetries", cfg.sync.max_retries as u64) as usize;
    cfg.sync.backoff_base = Duration::from_millis(u64_field(
        &sync,
        "backoffMs",
        cfg.sync.backoff_base.as_millis() as u64,
    ));
    cfg.simulation_trials = u64_field(&sim, "trials", cfg.simulation_trials as u64) as usize;
    Ok(cfg)
}

pub fn apply_workspace_settings(
    state: &mut AppState,
    conn: &rusqlite::Connection,
) -> anyhow::Result<()> {
    let cfg = effective_config(conn, &state.base_config)?;
    if cfg.sync != *state.dispatcher.config() {
        state.dispatcher.reconfigure(cfg.sync.clone())?;
        info!(
            endpoint = ?cfg.sync.endpoint,
            timeout_secs = cfg.sync.timeout.as_secs(),
            max_retries = cfg.sync.max_retries,
            "score sync reconfigured"
        );
    }
    state.config = cfg;
    Ok(())
}

fn handle_setup_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let sync = match load_section(conn, SetupSection::Sync, &state.base_config) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let simulation = match load_section(conn, SetupSection::Simulation, &state.base_config) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    ok(
        &req.id,
        json!({
            "sync": sync,
            "simulation": simulation
        }),
    )
}

fn handle_setup_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.take() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let resp = update_section(state, &conn, req);
    state.db = Some(conn);
    resp
}

fn update_section(
    state: &mut AppState,
    conn: &rusqlite::Connection,
    req: &Request,
) -> serde_json::Value {
    let Some(section_raw) = req.params.get("section").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing section", None);
    };
    let Some(section) = SetupSection::parse(section_raw) else {
        return err(&req.id, "bad_params", "unknown section", None);
    };
    let Some(patch_obj) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "patch must be an object", None);
    };

    let mut current = match load_section(conn, section, &state.base_config) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Err(msg) = merge_section_patch(section, &mut current, patch_obj) {
        return err(&req.id, "bad_params", msg, None);
    }
    if let Err(e) = db::settings_set_json(conn, section.key(), &current) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    if let Err(e) = apply_workspace_settings(state, conn) {
        return err(&req.id, "bad_params", e.to_string(), None);
    }
    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "setup.get" => Some(handle_setup_get(state, req)),
        "setup.update" => Some(handle_setup_update(state, req)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_memory;

    #[test]
    fn saved_overrides_layer_over_environment() {
        let conn = open_memory();
        let base = Config::default();
        db::settings_set_json(
            &conn,
            "setup.sync",
            &json!({ "endpoint": "http://127.0.0.1:9/", "maxRetries": 1, "backoffMs": 50 }),
        )
        .unwrap();
        let cfg = effective_config(&conn, &base).unwrap();
        assert_eq!(cfg.sync.endpoint.as_deref(), Some("http://127.0.0.1:9"));
        assert_eq!(cfg.sync.max_retries, 1);
        assert_eq!(cfg.sync.backoff_base, Duration::from_millis(50));
        assert_eq!(cfg.sync.timeout, base.sync.timeout);
        assert_eq!(cfg.simulation_trials, 100);
    }

    #[test]
    fn patch_validation_rejects_out_of_range_and_unknown_fields() {
        let base = Config::default();
        let mut current = default_section(SetupSection::Sync, &base);
        let patch = json!({ "timeoutSecs": 0 });
        assert!(merge_section_patch(SetupSection::Sync, &mut current, patch.as_object().unwrap()).is_err());
        let patch = json!({ "colour": "red" });
        assert!(merge_section_patch(SetupSection::Sync, &mut current, patch.as_object().unwrap()).is_err());
        let patch = json!({ "endpoint": "ftp://x" });
        assert!(merge_section_patch(SetupSection::Sync, &mut current, patch.as_object().unwrap()).is_err());
    }
}
