#![allow(dead_code)]

use agentflow::notify::{NotificationService, RunContext, StepNotification};
use agentflow::orchestrator::{Orchestrator, OrchestratorOptions};
use agentflow::report::RunReportReader;
use agentflow::runner::{LaunchRequest, RunnerError, StepLaunch, StepLauncher};
use agentflow::state::RunStateStore;
use agentflow::workflow::{load_workflow, Workflow};
use serde_json::json;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const RUN_ID: &str = "feed1234";

/// One recorded call into the scripted runner.
#[derive(Debug, Clone)]
pub struct RecordedLaunch {
    pub step_id: String,
    pub attempt: u32,
    pub extra_env: BTreeMap<String, String>,
}

pub type LaunchLog = Arc<Mutex<Vec<RecordedLaunch>>>;

/// What the scripted runner should do for one launch.
pub enum LaunchPlan {
    /// Write the given report JSON, spawn a child that exits immediately.
    Report(serde_json::Value),
    /// Spawn a child that exits immediately without writing any report.
    NoReport,
    /// Write raw bytes to the report path and keep the child alive for a
    /// while, to exercise partial-write handling.
    RawReport { body: String, child_sleep: f64 },
}

/// Test double for the step runner: spawns real (trivial) children but
/// scripts the reports they would produce.
pub struct ScriptedRunner {
    pub launches: LaunchLog,
    script: Box<dyn FnMut(&LaunchRequest) -> LaunchPlan + Send>,
}

impl ScriptedRunner {
    pub fn new(script: impl FnMut(&LaunchRequest) -> LaunchPlan + Send + 'static) -> Self {
        Self {
            launches: Arc::new(Mutex::new(Vec::new())),
            script: Box::new(script),
        }
    }

    pub fn launch_log(&self) -> LaunchLog {
        Arc::clone(&self.launches)
    }
}

impl StepLauncher for ScriptedRunner {
    fn launch(&mut self, request: LaunchRequest<'_>) -> Result<StepLaunch, RunnerError> {
        self.launches.lock().expect("launch log").push(RecordedLaunch {
            step_id: request.step.id.clone(),
            attempt: request.attempt,
            extra_env: request.extra_env.clone(),
        });

        let plan = (self.script)(&request);
        let mut child_command = "true".to_string();
        match plan {
            LaunchPlan::Report(value) => {
                fs::write(
                    &request.report_path,
                    serde_json::to_vec_pretty(&value).expect("encode report"),
                )
                .expect("write report");
            }
            LaunchPlan::NoReport => {}
            LaunchPlan::RawReport { body, child_sleep } => {
                fs::write(&request.report_path, body).expect("write raw report");
                if child_sleep > 0.0 {
                    child_command = format!("sleep {child_sleep}");
                }
            }
        }

        let logs_dir = request
            .logs_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir);
        fs::create_dir_all(&logs_dir).expect("create logs dir");
        let log_path = logs_dir.join(format!(
            "{}__{}__attempt{}.log",
            request.run_id, request.step.id, request.attempt
        ));
        let log_file = fs::File::create(&log_path).expect("create log file");

        let child = Command::new("/bin/sh")
            .arg("-c")
            .arg(child_command)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("spawn scripted child");

        Ok(StepLaunch::new(
            request.step.id.clone(),
            request.attempt,
            child,
            request.report_path,
            log_path,
            Some(log_file),
        ))
    }
}

#[derive(Debug, Default)]
pub struct NotifierEvents {
    pub started: u32,
    pub stopped: u32,
    pub failures: Vec<StepNotification>,
    pub human_inputs: Vec<StepNotification>,
}

/// Notification sink that records every call for assertions.
pub struct RecordingNotifier {
    pub events: Arc<Mutex<NotifierEvents>>,
}

impl RecordingNotifier {
    pub fn new() -> (Self, Arc<Mutex<NotifierEvents>>) {
        let events = Arc::new(Mutex::new(NotifierEvents::default()));
        (
            Self {
                events: Arc::clone(&events),
            },
            events,
        )
    }
}

impl NotificationService for RecordingNotifier {
    fn start(&mut self, _context: &RunContext) -> Result<(), String> {
        self.events.lock().expect("events").started += 1;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), String> {
        self.events.lock().expect("events").stopped += 1;
        Ok(())
    }

    fn notify_failure(&mut self, notification: &StepNotification) -> Result<(), String> {
        self.events
            .lock()
            .expect("events")
            .failures
            .push(notification.clone());
        Ok(())
    }

    fn notify_human_input(&mut self, notification: &StepNotification) -> Result<(), String> {
        self.events
            .lock()
            .expect("events")
            .human_inputs
            .push(notification.clone());
        Ok(())
    }
}

pub fn completed_report(step_id: &str, agent: &str) -> serde_json::Value {
    json!({
        "schema": "run_report@v0",
        "run_id": RUN_ID,
        "step_id": step_id,
        "agent": agent,
        "status": "COMPLETED",
        "started_at": "2025-01-01T00:00:00.000000Z",
        "ended_at": "2025-01-01T00:01:00.000000Z",
        "artifacts": [],
        "metrics": {},
        "logs": [format!("{step_id} finished")],
        "next_suggested_steps": [],
        "gate_failure": false
    })
}

pub fn completed_report_with_artifacts(
    step_id: &str,
    agent: &str,
    artifacts: &[&str],
) -> serde_json::Value {
    let mut report = completed_report(step_id, agent);
    report["artifacts"] = json!(artifacts);
    report
}

pub fn gate_failure_report(step_id: &str, agent: &str) -> serde_json::Value {
    let mut report = completed_report(step_id, agent);
    report["gate_failure"] = json!(true);
    report
}

pub fn failed_report(step_id: &str, agent: &str, logs: &[&str]) -> serde_json::Value {
    let mut report = completed_report(step_id, agent);
    report["status"] = json!("FAILED");
    report["logs"] = json!(logs);
    report
}

/// Temp repo with a `prompts/` directory holding stub prompt files.
pub fn setup_repo(prompts: &[&str]) -> (tempfile::TempDir, PathBuf) {
    let temp = tempfile::tempdir().expect("tempdir");
    let repo = temp.path().join("repo");
    fs::create_dir_all(repo.join("prompts")).expect("create prompts dir");
    for name in prompts {
        fs::write(repo.join("prompts").join(name), "stub").expect("write prompt");
    }
    (temp, repo)
}

pub fn write_workflow(repo: &Path, yaml: &str) -> PathBuf {
    let path = repo.join("workflow.yaml");
    fs::write(&path, yaml).expect("write workflow");
    path
}

pub fn load_test_workflow(repo: &Path, yaml: &str) -> (Workflow, PathBuf) {
    let path = write_workflow(repo, yaml);
    let workflow = load_workflow(&path).expect("load workflow");
    let root = path.parent().expect("workflow root").to_path_buf();
    (workflow, root)
}

pub fn fast_options() -> OrchestratorOptions {
    OrchestratorOptions {
        poll_interval: Duration::from_millis(10),
        run_id: Some(RUN_ID.to_string()),
        ..OrchestratorOptions::default()
    }
}

pub fn build_orchestrator(
    repo: &Path,
    workflow: Workflow,
    workflow_root: &Path,
    runner: ScriptedRunner,
    options: OrchestratorOptions,
) -> Orchestrator {
    let reader = RunReportReader::new().with_retry(2, Duration::from_millis(10));
    let store = RunStateStore::new(repo.join(".agents/run_state.json"));
    Orchestrator::new(
        workflow,
        workflow_root,
        repo,
        reader,
        store,
        Box::new(runner),
        options,
    )
    .expect("construct orchestrator")
}

pub fn run_dir(repo: &Path) -> PathBuf {
    repo.join(".agents/runs").join(RUN_ID)
}
