use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_assignd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn assignd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    serde_json::from_str(line.trim()).expect("parse response json")
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(true),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn setup_course(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>) -> String {
    let workspace = temp_dir("assignd-points");
    request_ok(
        stdin,
        reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    request_ok(
        stdin,
        reader,
        "cat",
        "catalog.load",
        json!({
            "courses": [
                { "id": "c1", "courseName": "pybook", "baseCourse": "pybook", "termStartDate": "2024-01-08" }
            ],
            "questions": [
                { "id": "page", "name": "ch1/s1", "baseCourse": "pybook", "chapter": "ch1", "subchapter": "s1", "questionType": "page" },
                { "id": "a1", "name": "act1", "baseCourse": "pybook", "chapter": "ch1", "subchapter": "s1", "questionType": "mchoice", "fromSource": true },
                { "id": "a2", "name": "act2", "baseCourse": "pybook", "chapter": "ch1", "subchapter": "s1", "questionType": "parsonsprob", "fromSource": true },
                { "id": "a3", "name": "act3", "baseCourse": "pybook", "chapter": "ch1", "subchapter": "s1", "questionType": "activecode", "fromSource": true },
                { "id": "a4", "name": "act4", "baseCourse": "pybook", "chapter": "ch1", "subchapter": "s1", "questionType": "mchoice", "fromSource": true },
                { "id": "a5", "name": "act5", "baseCourse": "pybook", "chapter": "ch1", "subchapter": "s1", "questionType": "mchoice", "fromSource": true },
                { "id": "a6", "name": "act6", "baseCourse": "pybook", "chapter": "ch1", "subchapter": "s1", "questionType": "mchoice", "fromSource": true },
                { "id": "a7", "name": "act7", "baseCourse": "pybook", "chapter": "ch1", "subchapter": "s1", "questionType": "mchoice", "fromSource": true },
                { "id": "q1", "name": "Q1", "baseCourse": "pybook", "questionType": "mchoice" },
                { "id": "q2", "name": "Q2", "baseCourse": "pybook", "questionType": "activecode" },
                { "id": "q3", "name": "Q3", "baseCourse": "pybook", "questionType": "shortanswer" }
            ]
        }),
    );
    let created = request_ok(
        stdin,
        reader,
        "new",
        "assignments.create",
        json!({ "courseId": "c1", "name": "Week 1" }),
    );
    created["assignment"]["id"]
        .as_str()
        .expect("assignment id")
        .to_string()
}

fn stored_points(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    aid: &str,
) -> i64 {
    let view = request_ok(
        stdin,
        reader,
        "view",
        "assignments.get",
        json!({ "courseId": "c1", "assignmentId": aid }),
    );
    view["assignment"]["points"].as_i64().expect("points")
}

#[test]
fn total_points_follow_every_question_mutation() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let aid = setup_course(&mut stdin, &mut reader);

    let mut expected = 0;
    for (i, (name, pts)) in [("Q1", 3), ("Q2", 5), ("Q3", 2)].into_iter().enumerate() {
        let res = request_ok(
            &mut stdin,
            &mut reader,
            &format!("add{i}"),
            "assignmentQuestions.upsert",
            json!({ "courseId": "c1", "assignmentId": aid, "questionName": name, "points": pts }),
        );
        expected += pts;
        assert_eq!(res["status"], "success");
        assert_eq!(res["totalPoints"], expected);
        assert_eq!(stored_points(&mut stdin, &mut reader, &aid), expected);
    }

    let res = request_ok(
        &mut stdin,
        &mut reader,
        "upd",
        "assignmentQuestions.upsert",
        json!({ "courseId": "c1", "assignmentId": aid, "questionName": "Q2", "points": 1 }),
    );
    assert_eq!(res["totalPoints"], 6);

    let res = request_ok(
        &mut stdin,
        &mut reader,
        "rm",
        "assignmentQuestions.remove",
        json!({ "courseId": "c1", "assignmentId": aid, "questionName": "Q1" }),
    );
    assert_eq!(res["totalPoints"], 3);
    assert_eq!(stored_points(&mut stdin, &mut reader, &aid), 3);

    let missing = request(
        &mut stdin,
        &mut reader,
        "missing",
        "assignmentQuestions.upsert",
        json!({ "courseId": "c1", "assignmentId": aid, "questionName": "nope", "points": 40 }),
    );
    assert_eq!(missing["error"]["code"], "not_found");
    assert_eq!(stored_points(&mut stdin, &mut reader, &aid), 3);

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn reading_rows_derive_requirement_and_points() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let aid = setup_course(&mut stdin, &mut reader);

    let res = request_ok(
        &mut stdin,
        &mut reader,
        "page",
        "assignmentQuestions.upsert",
        json!({ "courseId": "c1", "assignmentId": aid, "questionId": "page", "activitiesRequired": -1 }),
    );
    assert_eq!(res["activityCount"], 7);
    assert_eq!(res["activitiesRequired"], 5);
    assert_eq!(res["points"], 7);
    assert_eq!(res["allowedAutograde"], json!(["interact"]));

    let view = request_ok(
        &mut stdin,
        &mut reader,
        "view",
        "assignments.get",
        json!({ "courseId": "c1", "assignmentId": aid }),
    );
    assert_eq!(view["readings"].as_array().map(|r| r.len()), Some(1));
    assert_eq!(view["questions"].as_array().map(|r| r.len()), Some(0));

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn grading_policy_is_resolved_per_question_type() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let aid = setup_course(&mut stdin, &mut reader);

    let code = request_ok(
        &mut stdin,
        &mut reader,
        "code",
        "assignmentQuestions.upsert",
        json!({ "courseId": "c1", "assignmentId": aid, "questionName": "Q2", "autograde": "pct_correct", "whichToGrade": "best_answer" }),
    );
    assert_eq!(code["resolvedAutograde"], "manual");
    assert_eq!(code["resolvedWhichToGrade"], "");

    let peer = request(
        &mut stdin,
        &mut reader,
        "peer",
        "assignmentQuestions.upsert",
        json!({ "courseId": "c1", "assignmentId": aid, "questionName": "Q3", "autograde": "peer" }),
    );
    assert_eq!(peer["error"]["code"], "bad_params");

    let mc = request_ok(
        &mut stdin,
        &mut reader,
        "mc",
        "assignmentQuestions.upsert",
        json!({ "courseId": "c1", "assignmentId": aid, "questionName": "Q1", "autograde": "peer", "whichToGrade": "all_answer" }),
    );
    assert_eq!(mc["resolvedAutograde"], "peer");
    assert_eq!(mc["resolvedWhichToGrade"], "all_answer");

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn reorder_ranks_names_in_order_and_skips_unknowns() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let aid = setup_course(&mut stdin, &mut reader);
    for name in ["Q1", "Q2", "Q3"] {
        request_ok(
            &mut stdin,
            &mut reader,
            name,
            "assignmentQuestions.upsert",
            json!({ "courseId": "c1", "assignmentId": aid, "questionName": name }),
        );
    }

    let out = request_ok(
        &mut stdin,
        &mut reader,
        "reorder",
        "assignmentQuestions.reorder",
        json!({ "courseId": "c1", "assignmentId": aid, "names": ["Q3", "ghost", "Q1", "Q2"] }),
    );
    assert_eq!(out["reordered"], 3);
    assert_eq!(out["skipped"], json!(["ghost"]));

    let view = request_ok(
        &mut stdin,
        &mut reader,
        "view",
        "assignments.get",
        json!({ "courseId": "c1", "assignmentId": aid }),
    );
    let order: Vec<(String, i64)> = view["questions"]
        .as_array()
        .expect("questions")
        .iter()
        .map(|q| {
            (
                q["name"].as_str().unwrap_or_default().to_string(),
                q["sortingPriority"].as_i64().unwrap_or(-1),
            )
        })
        .collect();
    assert_eq!(
        order,
        vec![
            ("Q3".to_string(), 1),
            ("Q1".to_string(), 2),
            ("Q2".to_string(), 3)
        ]
    );

    drop(stdin);
    let _ = child.wait();
}
