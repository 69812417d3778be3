use serde_json::Value;

use crate::context::RequestContext;
use crate::policy::Requested;

pub fn required_str<'a>(params: &'a Value, key: &str) -> Result<&'a str, String> {
    match params.get(key).and_then(|v| v.as_str()) {
        Some(s) if !s.trim().is_empty() => Ok(s),
        Some(_) => Err(format!("params.{key} must not be empty")),
        None => Err(format!("missing params.{key}")),
    }
}

pub fn optional_str<'a>(params: &'a Value, key: &str) -> Result<Option<&'a str>, String> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.as_str())),
        Some(_) => Err(format!("params.{key} must be a string")),
    }
}

pub fn optional_bool(params: &Value, key: &str) -> Result<Option<bool>, String> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_bool()
            .map(Some)
            .ok_or_else(|| format!("params.{key} must be boolean")),
    }
}

pub fn optional_i64(params: &Value, key: &str) -> Result<Option<i64>, String> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_i64()
            .map(Some)
            .ok_or_else(|| format!("params.{key} must be an integer")),
    }
}

/// Absent stays absent, an explicit `null` clears the value.
pub fn nullable<T>(
    params: &Value,
    key: &str,
    parse: impl Fn(&Value) -> Option<T>,
) -> Result<Option<Option<T>>, String> {
    match params.get(key) {
        None => Ok(None),
        Some(Value::Null) => Ok(Some(None)),
        Some(v) => parse(v)
            .map(|t| Some(Some(t)))
            .ok_or_else(|| format!("params.{key} has the wrong type")),
    }
}

pub fn requested<T>(
    params: &Value,
    key: &str,
    parse: impl Fn(&str) -> Option<T>,
) -> Result<Requested<T>, String> {
    match params.get(key) {
        None => Ok(Requested::Absent),
        Some(Value::Null) => Ok(Requested::Null),
        Some(Value::String(s)) if s.is_empty() => Ok(Requested::Null),
        Some(Value::String(s)) => parse(s)
            .map(Requested::Value)
            .ok_or_else(|| format!("unknown {key} value: {s}")),
        Some(_) => Err(format!("params.{key} must be a string or null")),
    }
}

pub fn string_list(params: &Value, key: &str) -> Result<Vec<String>, String> {
    let Some(items) = params.get(key).and_then(|v| v.as_array()) else {
        return Err(format!("params.{key} must be an array"));
    };
    items
        .iter()
        .map(|v| {
            v.as_str()
                .map(str::to_string)
                .ok_or_else(|| format!("params.{key} must contain only strings"))
        })
        .collect()
}

pub fn request_context(params: &Value) -> Result<RequestContext, String> {
    let mut ctx = RequestContext::for_course(required_str(params, "courseId")?);
    ctx.user_id = optional_str(params, "userId")?.map(str::to_string);
    if let Some(key) = optional_str(params, "consumerKey")? {
        ctx = ctx.with_consumer_key(key);
    }
    Ok(ctx)
}
