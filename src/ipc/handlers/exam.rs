use crate::ipc::error::{err, respond};
use crate::ipc::helpers::{optional_i64, request_context, required_str};
use crate::ipc::types::{AppState, Request};
use crate::simulate;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::{json, Value};

fn bad_params(req: &Request, msg: impl Into<String>) -> Value {
    err(&req.id, "bad_params", msg, None)
}

fn handle_exam_simulate(state: &mut AppState, req: &Request) -> Value {
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
    let trials = match optional_i64(&req.params, "trials") {
        Ok(None) => state.config.simulation_trials,
        Ok(Some(n)) if (1..=10_000).contains(&n) => n as usize,
        Ok(Some(_)) => return bad_params(req, "trials must be in 1..=10000"),
        Err(msg) => return bad_params(req, msg),
    };
    let seed = match req.params.get("seed") {
        None | Some(Value::Null) => None,
        Some(v) => match v.as_u64() {
            Some(s) => Some(s),
            None => return bad_params(req, "seed must be a non-negative integer"),
        },
    };

    let result = simulate::load_input(conn, &ctx, assignment_id).map(|input| {
        let mut rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        let outcome = simulate::simulate(&input, trials, &mut rng);
        tracing::debug!(
            assignment_id,
            trials,
            slots = outcome.slots,
            "exam simulated"
        );
        json!(outcome)
    });
    respond(&req.id, result)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "exam.simulate" => Some(handle_exam_simulate(state, req)),
        _ => None,
    }
}
