use agentflow::report::{RunReportError, RunReportReader};
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

fn reader() -> RunReportReader {
    RunReportReader::new().with_retry(1, Duration::ZERO)
}

fn base_payload() -> Value {
    json!({
        "schema": "run_report@v0",
        "run_id": "feed1234",
        "step_id": "build",
        "agent": "coder",
        "status": "COMPLETED",
        "started_at": "2025-01-01T00:00:00.000000Z",
        "ended_at": "2025-01-01T00:02:00.000000Z",
        "artifacts": ["out/result.md"],
        "metrics": {"files_changed": 2},
        "logs": ["wrote out/result.md"],
        "next_suggested_steps": ["review"],
        "gate_failure": false
    })
}

fn write_payload(dir: &Path, payload: &Value) -> PathBuf {
    let path = dir.join("report.json");
    fs::write(&path, serde_json::to_vec_pretty(payload).expect("encode")).expect("write");
    path
}

#[test]
fn fully_filled_report_parses_every_field() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = write_payload(temp.path(), &base_payload());
    let report = reader().read(&path).expect("read");

    assert_eq!(report.schema, "run_report@v0");
    assert_eq!(report.run_id, "feed1234");
    assert_eq!(report.step_id, "build");
    assert_eq!(report.status, "COMPLETED");
    assert_eq!(report.artifacts, vec!["out/result.md"]);
    assert_eq!(report.metrics["files_changed"], json!(2));
    assert_eq!(report.logs, vec!["wrote out/result.md"]);
    assert_eq!(report.next_suggested_steps, vec![json!("review")]);
    assert!(!report.gate_failure);
    assert_eq!(report.raw["schema"], json!("run_report@v0"));
}

#[test]
fn missing_report_file_is_not_found() {
    let err = reader()
        .read(Path::new("/nonexistent/report.json"))
        .expect_err("missing");
    assert!(matches!(err, RunReportError::NotFound { .. }));
}

#[test]
fn non_object_payload_is_rejected() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = write_payload(temp.path(), &json!(["not", "an", "object"]));
    let err = reader().read(&path).expect_err("list payload");
    assert!(matches!(err, RunReportError::NotAnObject { .. }));
}

#[test]
fn lowercase_status_is_normalized() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut payload = base_payload();
    payload["status"] = json!("completed");
    let path = write_payload(temp.path(), &payload);
    assert_eq!(reader().read(&path).expect("read").status, "COMPLETED");
}

#[test]
fn each_placeholder_class_rejects_independently() {
    let temp = tempfile::tempdir().expect("tempdir");

    let mut with_artifact_placeholder = base_payload();
    with_artifact_placeholder["artifacts"] =
        json!(["<replace with relative path for each artifact>"]);
    let path = write_payload(temp.path(), &with_artifact_placeholder);
    assert!(matches!(
        reader().read(&path).expect_err("artifact placeholder"),
        RunReportError::Placeholder { .. }
    ));

    let mut with_log_placeholder = base_payload();
    with_log_placeholder["logs"] = json!(["Summary of what you accomplished"]);
    let path = write_payload(temp.path(), &with_log_placeholder);
    assert!(matches!(
        reader().read(&path).expect_err("log placeholder"),
        RunReportError::Placeholder { .. }
    ));

    let mut with_ended_placeholder = base_payload();
    with_ended_placeholder["ended_at"] = json!("<REPLACE WITH UTC TIMESTAMP WHEN YOU FINISH>");
    let path = write_payload(temp.path(), &with_ended_placeholder);
    assert!(matches!(
        reader().read(&path).expect_err("ended_at placeholder"),
        RunReportError::Placeholder { .. }
    ));

    let mut with_empty_ended = base_payload();
    with_empty_ended["ended_at"] = json!("   ");
    let path = write_payload(temp.path(), &with_empty_ended);
    assert!(matches!(
        reader().read(&path).expect_err("empty ended_at"),
        RunReportError::Placeholder { .. }
    ));
}

#[test]
fn schema_required_keys_are_enforced() {
    let temp = tempfile::tempdir().expect("tempdir");
    let schema_path = temp.path().join("schema.json");
    fs::write(
        &schema_path,
        serde_json::to_vec(&json!({
            "type": "object",
            "required": ["schema", "run_id", "cost_usd"]
        }))
        .expect("encode schema"),
    )
    .expect("write schema");

    let schema_reader = RunReportReader::new()
        .with_schema(&schema_path)
        .expect("load schema")
        .with_retry(1, Duration::ZERO);

    let path = write_payload(temp.path(), &base_payload());
    let err = schema_reader.read(&path).expect_err("schema miss");
    match err {
        RunReportError::SchemaValidation { reason, .. } => {
            assert!(reason.contains("cost_usd"));
        }
        other => panic!("unexpected error: {other}"),
    }

    let mut payload = base_payload();
    payload["cost_usd"] = json!(1.25);
    let path = write_payload(temp.path(), &payload);
    let report = schema_reader.read(&path).expect("read");
    assert_eq!(report.raw["cost_usd"], json!(1.25));
}

#[test]
fn unreadable_schema_file_is_an_error() {
    let err = RunReportReader::new()
        .with_schema(Path::new("/nonexistent/schema.json"))
        .expect_err("missing schema");
    assert!(matches!(err, RunReportError::SchemaLoad { .. }));
}
