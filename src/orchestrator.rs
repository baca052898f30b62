use crate::gating::{AlwaysOpenGate, GateEvaluator};
use crate::notify::{NotificationService, NullNotificationService, RunContext, StepNotification};
use crate::report::{RunReport, RunReportReader};
use crate::runner::{LaunchRequest, StepLaunch, StepLauncher};
use crate::shared::ids::new_run_id;
use crate::shared::run_log::append_engine_log_line;
use crate::shared::time::utc_now;
use crate::state::{RunState, RunStateStore, StateError, StepRuntime, StepStatus};
use crate::workflow::{LoopConfig, Step, Workflow};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("failed to create run directory {path}: {source}")]
    CreateRunDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("step '{step_id}' is not part of workflow '{workflow}'")]
    UnknownStep { step_id: String, workflow: String },
    #[error(transparent)]
    State(#[from] StateError),
}

/// How `run()` ended. Internal errors (state persistence, run directory
/// setup) surface as `Err` instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Failed { failed_steps: Vec<String> },
}

/// Optional knobs for the orchestrator; `Default` matches the CLI
/// defaults.
pub struct OrchestratorOptions {
    pub gate_evaluator: Option<Box<dyn GateEvaluator>>,
    pub notifications: Option<Box<dyn NotificationService>>,
    pub poll_interval: Duration,
    pub max_attempts: u32,
    pub max_iterations: u32,
    pub pause_for_human_input: bool,
    pub run_id: Option<String>,
    pub start_at_step: Option<String>,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            gate_evaluator: None,
            notifications: None,
            poll_interval: Duration::from_secs(1),
            max_attempts: 2,
            max_iterations: 4,
            pause_for_human_input: false,
            run_id: None,
            start_at_step: None,
        }
    }
}

enum LoopReadiness {
    Ready,
    NotReady,
    Failed(String),
}

/// The DAG scheduler. Single-threaded and cooperative: one blocking loop
/// that launches ready steps, collects run reports, releases
/// human-waiting steps, and persists state after every tick. Concurrency
/// comes only from the spawned agent processes.
pub struct Orchestrator {
    workflow: Workflow,
    workflow_root: PathBuf,
    repo_dir: PathBuf,
    report_reader: RunReportReader,
    state_store: RunStateStore,
    runner: Box<dyn StepLauncher>,
    gate_evaluator: Box<dyn GateEvaluator>,
    notifications: Box<dyn NotificationService>,
    poll_interval: Duration,
    max_attempts: u32,
    max_iterations: u32,
    pause_for_human: bool,
    run_dir: PathBuf,
    reports_dir: PathBuf,
    logs_dir: PathBuf,
    artifacts_dir: PathBuf,
    manual_inputs_dir: PathBuf,
    state: RunState,
    active: BTreeMap<String, StepLaunch>,
}

impl Orchestrator {
    pub fn new(
        workflow: Workflow,
        workflow_root: impl Into<PathBuf>,
        repo_dir: impl Into<PathBuf>,
        report_reader: RunReportReader,
        mut state_store: RunStateStore,
        runner: Box<dyn StepLauncher>,
        options: OrchestratorOptions,
    ) -> Result<Self, OrchestratorError> {
        let workflow_root = workflow_root.into();
        let repo_dir = repo_dir.into();

        if let Some(start) = &options.start_at_step {
            if !workflow.contains(start) {
                return Err(OrchestratorError::UnknownStep {
                    step_id: start.clone(),
                    workflow: workflow.name.clone(),
                });
            }
        }

        // Resuming reads the prior state from wherever the store was
        // pointed before construction.
        let persisted = if options.start_at_step.is_some() {
            state_store.load()?
        } else {
            None
        };

        let run_id = persisted
            .as_ref()
            .map(|state| state.run_id.clone())
            .or(options.run_id)
            .unwrap_or_else(new_run_id);

        let run_dir = repo_dir.join(".agents/runs").join(&run_id);
        let reports_dir = run_dir.join("reports");
        let logs_dir = run_dir.join("logs");
        let artifacts_dir = run_dir.join("artifacts");
        let manual_inputs_dir = run_dir.join("manual_inputs");

        for dir in [&reports_dir, &logs_dir, &artifacts_dir] {
            fs::create_dir_all(dir).map_err(|source| OrchestratorError::CreateRunDir {
                path: dir.display().to_string(),
                source,
            })?;
        }
        if options.pause_for_human_input {
            fs::create_dir_all(&manual_inputs_dir).map_err(|source| {
                OrchestratorError::CreateRunDir {
                    path: manual_inputs_dir.display().to_string(),
                    source,
                }
            })?;
        }

        state_store.set_path(run_dir.join("run_state.json"));

        let mut steps: BTreeMap<String, StepRuntime> = BTreeMap::new();
        for step_id in workflow.step_ids() {
            let runtime = persisted
                .as_ref()
                .and_then(|state| state.steps.get(step_id).cloned())
                .unwrap_or_default();
            steps.insert(step_id.to_string(), runtime);
        }

        let created_at = persisted
            .as_ref()
            .map(|state| state.created_at.clone())
            .unwrap_or_else(utc_now);
        let resuming = persisted.is_some();

        let state = RunState {
            run_id,
            workflow_name: workflow.name.clone(),
            repo_dir: repo_dir.clone(),
            reports_dir: reports_dir.clone(),
            manual_inputs_dir: manual_inputs_dir.clone(),
            created_at,
            updated_at: None,
            steps,
        };

        let mut orchestrator = Self {
            workflow,
            workflow_root,
            repo_dir,
            report_reader,
            state_store,
            runner,
            gate_evaluator: options
                .gate_evaluator
                .unwrap_or_else(|| Box::new(AlwaysOpenGate)),
            notifications: options
                .notifications
                .unwrap_or_else(|| Box::new(NullNotificationService)),
            poll_interval: options.poll_interval,
            max_attempts: options.max_attempts.max(1),
            max_iterations: options.max_iterations,
            pause_for_human: options.pause_for_human_input,
            run_dir,
            reports_dir,
            logs_dir,
            artifacts_dir,
            manual_inputs_dir,
            state,
            active: BTreeMap::new(),
        };

        if resuming {
            let start = options
                .start_at_step
                .expect("resume implies start_at_step");
            orchestrator.reset_steps_from(&start);
            info!(
                run_id = %orchestrator.state.run_id,
                step = %start,
                "resuming run"
            );
        }

        Ok(orchestrator)
    }

    pub fn run_id(&self) -> &str {
        &self.state.run_id
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Blocking scheduler loop. Returns when every step is
    /// terminal-successful or some step has exhausted its attempts.
    pub fn run(&mut self) -> Result<RunOutcome, OrchestratorError> {
        info!(
            workflow = %self.workflow.name,
            run_id = %self.state.run_id,
            repo = %self.repo_dir.display(),
            "starting workflow run"
        );
        self.notify_start();
        let outcome = self.run_loop();
        self.cleanup_processes();
        if let Err(err) = self.persist_state() {
            warn!(error = %err, "failed to persist state during shutdown");
        }
        self.notify_stop();
        outcome
    }

    fn run_loop(&mut self) -> Result<RunOutcome, OrchestratorError> {
        loop {
            let mut progress = false;
            progress |= self.launch_ready_steps();
            progress |= self.collect_reports();
            progress |= self.check_manual_steps();

            self.persist_state()?;

            if self.all_steps_finished() {
                info!(run_id = %self.state.run_id, "workflow complete");
                return Ok(RunOutcome::Completed);
            }
            let failed = self.terminal_failures();
            if !failed.is_empty() {
                error!(run_id = %self.state.run_id, steps = ?failed, "workflow failed");
                return Ok(RunOutcome::Failed {
                    failed_steps: failed,
                });
            }
            if !progress {
                thread::sleep(self.poll_interval);
            }
        }
    }

    fn launch_ready_steps(&mut self) -> bool {
        let mut progressed = false;
        let step_ids: Vec<String> = self.workflow.step_ids().map(ToString::to_string).collect();
        for step_id in step_ids {
            let step = self
                .workflow
                .step(&step_id)
                .cloned()
                .expect("workflow step exists");
            if self.state.steps[&step_id].status != StepStatus::Pending {
                continue;
            }
            if self.active.contains_key(&step_id) {
                continue;
            }
            if !self.dependencies_satisfied(&step) {
                continue;
            }
            if let Some(blocker) = self.state.steps[&step_id].blocked_by_loop.clone() {
                let blocker_done = self
                    .state
                    .steps
                    .get(&blocker)
                    .map(|runtime| runtime.status.is_terminal_success())
                    .unwrap_or(false);
                if !blocker_done {
                    continue;
                }
                self.runtime_mut(&step_id).blocked_by_loop = None;
            }
            if !self.gates_open(&step) {
                continue;
            }

            if let Some(loop_config) = step.loop_config.clone() {
                match self.ensure_loop_items(&step, &loop_config) {
                    LoopReadiness::Ready => {}
                    LoopReadiness::NotReady => continue,
                    LoopReadiness::Failed(message) => {
                        self.fail_step_terminal(&step_id, message);
                        progressed = true;
                        continue;
                    }
                }
                if self.loop_exhausted(&step_id, &loop_config) {
                    let runtime = self.runtime_mut(&step_id);
                    runtime.status = StepStatus::Completed;
                    runtime.loop_completed = true;
                    info!(step = %step_id, "loop exhausted before launch, step complete");
                    self.log_engine(&format!("step={step_id} loop complete without launch"));
                    progressed = true;
                    continue;
                }
            }

            let prompt_path = match self.resolve_prompt_path(&step.prompt) {
                Ok(path) => path,
                Err(message) => {
                    self.fail_step_terminal(&step_id, message);
                    progressed = true;
                    continue;
                }
            };
            let extra_env = match self.build_step_env(&step) {
                Ok(env) => env,
                Err(message) => {
                    self.fail_step_terminal(&step_id, message);
                    progressed = true;
                    continue;
                }
            };

            let run_id = self.state.run_id.clone();
            let report_path = self
                .reports_dir
                .join(format!("{run_id}__{step_id}.json"));
            // The path is stable across attempts and iterations; a stale
            // report from an earlier launch must not be ingested as fresh.
            if report_path.exists() {
                if let Err(err) = fs::remove_file(&report_path) {
                    warn!(step = %step_id, error = %err, "failed to clear stale report");
                }
            }
            let manual_input_path = (step.human_in_the_loop && self.pause_for_human)
                .then(|| self.manual_inputs_dir.join(format!("{run_id}__{step_id}.json")));

            let attempt = {
                let runtime = self.runtime_mut(&step_id);
                runtime.status = StepStatus::Running;
                runtime.attempts += 1;
                runtime.started_at = Some(utc_now());
                runtime.report_path = Some(report_path.clone());
                runtime.manual_input_path = manual_input_path.clone();
                runtime.notified_failure = false;
                runtime.notified_human_input = false;
                runtime.attempts
            };

            let request = LaunchRequest {
                step: &step,
                run_id: &run_id,
                report_path,
                prompt_path,
                manual_input_path,
                attempt,
                artifacts_dir: self.artifacts_dir.clone(),
                logs_dir: Some(self.logs_dir.clone()),
                extra_env,
            };
            match self.runner.launch(request) {
                Ok(launch) => {
                    info!(
                        step = %step_id,
                        agent = %step.agent,
                        attempt,
                        "launched step"
                    );
                    self.log_engine(&format!(
                        "step={step_id} agent={} attempt={attempt} launched",
                        step.agent
                    ));
                    self.active.insert(step_id.clone(), launch);
                }
                Err(err) => {
                    error!(step = %step_id, error = %err, "failed to launch step");
                    let runtime = self.runtime_mut(&step_id);
                    runtime.status = StepStatus::Failed;
                    runtime.last_error = Some(err.to_string());
                    runtime.ended_at = Some(utc_now());
                    self.log_engine(&format!("step={step_id} launch failed: {err}"));
                    self.dispatch_failure_notification(&step_id);
                }
            }
            progressed = true;
        }
        progressed
    }

    fn collect_reports(&mut self) -> bool {
        let mut progressed = false;
        let mut to_remove: Vec<String> = Vec::new();
        let active_ids: Vec<String> = self.active.keys().cloned().collect();

        for step_id in active_ids {
            let (process_finished, exit_code) = {
                let launch = self.active.get_mut(&step_id).expect("active launch");
                match launch.child.try_wait() {
                    Ok(Some(status)) => (true, status.code().unwrap_or(-1)),
                    Ok(None) => (false, 0),
                    Err(err) => {
                        warn!(step = %step_id, error = %err, "failed to poll agent process");
                        (true, -1)
                    }
                }
            };
            let report_path = self.active[&step_id].report_path.clone();

            if report_path.exists() {
                match self.report_reader.read(&report_path) {
                    Err(err) => {
                        // A partial write looks like bad JSON while the
                        // agent is still running; wait for the next tick.
                        if !process_finished {
                            continue;
                        }
                        error!(step = %step_id, error = %err, "invalid run report");
                        self.fail_step(&step_id, err.to_string());
                        to_remove.push(step_id);
                        progressed = true;
                    }
                    Ok(report) => {
                        self.ingest_report(&step_id, report);
                        to_remove.push(step_id);
                        progressed = true;
                    }
                }
            } else if process_finished {
                error!(step = %step_id, exit_code, "agent exited without writing a run report");
                self.fail_step(
                    &step_id,
                    format!(
                        "Agent process exited with code {exit_code} without writing a run report"
                    ),
                );
                to_remove.push(step_id);
                progressed = true;
            }
        }

        for step_id in to_remove {
            if let Some(mut launch) = self.active.remove(&step_id) {
                launch.close_log();
            }
        }

        self.requeue_retryable_failures();
        progressed
    }

    /// Failed steps with attempts left and no live process go back to
    /// pending so the next tick can relaunch them.
    fn requeue_retryable_failures(&mut self) {
        let retryable: Vec<String> = self
            .state
            .steps
            .iter()
            .filter(|(step_id, runtime)| {
                runtime.status == StepStatus::Failed
                    && runtime.attempts < self.max_attempts
                    && !self.active.contains_key(*step_id)
            })
            .map(|(step_id, _)| step_id.clone())
            .collect();
        for step_id in retryable {
            let next_attempt = self.state.steps[&step_id].attempts + 1;
            info!(step = %step_id, next_attempt, "retry scheduled");
            self.log_engine(&format!("step={step_id} retry scheduled attempt={next_attempt}"));
            self.runtime_mut(&step_id).reset_for_retry();
        }
    }

    fn ingest_report(&mut self, step_id: &str, report: RunReport) {
        let step = self
            .workflow
            .step(step_id)
            .cloned()
            .expect("workflow step exists");
        {
            let runtime = self.runtime_mut(step_id);
            runtime.ended_at = Some(report.ended_at.clone());
            runtime.artifacts = report.artifacts.clone();
            runtime.metrics = report.metrics.clone();
            runtime.logs = report.logs.clone();
        }

        if report.gate_failure {
            if let Some(target) = step.loop_back_to.clone() {
                let iterations = self.state.steps[step_id].iteration_count;
                if iterations < self.max_iterations {
                    self.handle_loop_back(&step, &target);
                } else {
                    warn!(step = %step_id, iterations, "loop-back budget exhausted");
                    self.fail_step_terminal(
                        step_id,
                        format!(
                            "Gate failure: max iterations reached ({})",
                            self.max_iterations
                        ),
                    );
                }
                return;
            }
        }

        if report.status == "COMPLETED" {
            if let Some(loop_config) = &step.loop_config {
                if self.loop_has_more_iterations(step_id, loop_config) {
                    let runtime = self.runtime_mut(step_id);
                    runtime.reset_for_loop_iteration();
                    let index = runtime.loop_index;
                    info!(step = %step_id, index, "loop advanced to next item");
                    self.log_engine(&format!("step={step_id} loop advanced index={index}"));
                    return;
                }
            }
            let waiting = self.state.steps[step_id].manual_input_path.is_some()
                && self.pause_for_human;
            if waiting {
                self.runtime_mut(step_id).status = StepStatus::WaitingOnHuman;
                info!(step = %step_id, "awaiting human input");
                self.log_engine(&format!("step={step_id} awaiting human input"));
                self.dispatch_human_input_notification(step_id);
            } else {
                let has_loop = step.loop_config.is_some();
                let runtime = self.runtime_mut(step_id);
                runtime.status = StepStatus::Completed;
                if has_loop && runtime.loop_items.is_some() {
                    runtime.loop_index += 1;
                    runtime.loop_completed = true;
                }
                info!(step = %step_id, "step completed");
                self.log_engine(&format!("step={step_id} completed"));
            }
        } else {
            let message = if report.logs.is_empty() {
                "Agent reported failure".to_string()
            } else {
                let tail_start = report.logs.len().saturating_sub(3);
                report.logs[tail_start..].join(", ")
            };
            warn!(step = %step_id, error = %message, "agent reported failure");
            self.fail_step(step_id, message);
        }
    }

    /// Gate-failure rewind: requeue the reporting step for another
    /// iteration and reset the loop-back target plus its downstream so
    /// the target runs again first.
    fn handle_loop_back(&mut self, source: &Step, target: &str) {
        let iterations = {
            let runtime = self.runtime_mut(&source.id);
            runtime.iteration_count += 1;
            runtime.status = StepStatus::Pending;
            runtime.attempts = 0;
            runtime.report_path = None;
            runtime.started_at = None;
            runtime.ended_at = None;
            runtime.last_error = None;
            runtime.notified_failure = false;
            runtime.notified_human_input = false;
            if source.id != target {
                runtime.blocked_by_loop = Some(target.to_string());
            }
            runtime.iteration_count
        };
        info!(
            step = %source.id,
            target = %target,
            iteration = iterations,
            "gate failure, looping back"
        );
        self.log_engine(&format!(
            "step={} loop_back target={target} iteration={iterations}",
            source.id
        ));

        let mut roots = BTreeSet::new();
        roots.insert(target.to_string());
        let mut to_reset = self.downstream_of(&roots);
        to_reset.remove(&source.id);
        for step_id in to_reset {
            let preserved_iterations = if step_id == target {
                self.state.steps[&step_id].iteration_count
            } else {
                0
            };
            let runtime = StepRuntime {
                iteration_count: preserved_iterations,
                ..StepRuntime::default()
            };
            self.state.steps.insert(step_id.clone(), runtime);
            debug!(step = %step_id, "reset for loop-back");
        }
    }

    fn check_manual_steps(&mut self) -> bool {
        if !self.pause_for_human {
            return false;
        }
        let mut progressed = false;
        let step_ids: Vec<String> = self.state.steps.keys().cloned().collect();
        for step_id in step_ids {
            let manual_path = {
                let runtime = &self.state.steps[&step_id];
                if runtime.status != StepStatus::WaitingOnHuman {
                    continue;
                }
                match &runtime.manual_input_path {
                    Some(path) => path.clone(),
                    None => continue,
                }
            };
            if manual_path.exists() {
                let runtime = self.runtime_mut(&step_id);
                runtime.status = StepStatus::Completed;
                if runtime.ended_at.is_none() {
                    runtime.ended_at = Some(utc_now());
                }
                runtime.notified_human_input = false;
                info!(step = %step_id, "manual input received");
                self.log_engine(&format!("step={step_id} manual input received"));
                progressed = true;
            }
        }
        progressed
    }

    fn dependencies_satisfied(&self, step: &Step) -> bool {
        step.needs.iter().all(|dep| {
            self.state
                .steps
                .get(dep)
                .map(|runtime| runtime.status.is_terminal_success())
                .unwrap_or(false)
        })
    }

    fn gates_open(&self, step: &Step) -> bool {
        for gate in &step.gates {
            if !self.gate_evaluator.evaluate(step, gate) {
                info!(step = %step.id, gate = %gate, "gate closed");
                return false;
            }
        }
        true
    }

    /// Prompt lookup order: absolute path, the repository's local
    /// override under `.agents/prompts/`, workflow-directory relative,
    /// repository relative.
    fn resolve_prompt_path(&self, prompt: &str) -> Result<PathBuf, String> {
        let candidate = Path::new(prompt);
        if candidate.is_absolute() && candidate.exists() {
            return Ok(candidate.to_path_buf());
        }
        if let Some(name) = candidate.file_name() {
            let local_override = self.repo_dir.join(".agents/prompts").join(name);
            if local_override.exists() {
                info!(path = %local_override.display(), "using local prompt override");
                return Ok(local_override);
            }
        }
        let relative_to_workflow = self.workflow_root.join(prompt);
        if relative_to_workflow.exists() {
            return Ok(relative_to_workflow);
        }
        let relative_to_repo = self.repo_dir.join(prompt);
        if relative_to_repo.exists() {
            return Ok(relative_to_repo);
        }
        Err(format!("Prompt file not found for '{prompt}'"))
    }

    fn ensure_loop_items(&mut self, step: &Step, loop_config: &LoopConfig) -> LoopReadiness {
        if self.state.steps[&step.id].loop_items.is_some() {
            return LoopReadiness::Ready;
        }

        if let Some(items) = &loop_config.items {
            let runtime = self.runtime_mut(&step.id);
            runtime.loop_items = Some(items.clone());
            runtime.loop_index = 0;
            return LoopReadiness::Ready;
        }

        if let Some(dep) = &loop_config.items_from_step {
            let Some(dep_runtime) = self.state.steps.get(dep) else {
                return LoopReadiness::Failed(format!("loop source step '{dep}' is unknown"));
            };
            if !dep_runtime.status.is_terminal_success() {
                return LoopReadiness::NotReady;
            }
            let Some(artifact) = dep_runtime.artifacts.first().cloned() else {
                return LoopReadiness::Failed(format!(
                    "loop source step '{dep}' produced no artifacts"
                ));
            };
            let path = self.resolve_artifact_path(&artifact);
            return match self.read_loop_items(&path) {
                Ok(items) => {
                    let runtime = self.runtime_mut(&step.id);
                    runtime.loop_items = Some(items);
                    runtime.loop_index = 0;
                    LoopReadiness::Ready
                }
                Err(message) => LoopReadiness::Failed(message),
            };
        }

        if let Some(artifact) = &loop_config.items_from_artifact {
            let path = self.resolve_artifact_path(artifact);
            if !path.exists() {
                // The producing step may simply not have run yet.
                return LoopReadiness::NotReady;
            }
            return match self.read_loop_items(&path) {
                Ok(items) => {
                    let runtime = self.runtime_mut(&step.id);
                    runtime.loop_items = Some(items);
                    runtime.loop_index = 0;
                    LoopReadiness::Ready
                }
                Err(message) => LoopReadiness::Failed(message),
            };
        }

        LoopReadiness::Failed("loop has no item source".to_string())
    }

    fn read_loop_items(&self, path: &Path) -> Result<Vec<Value>, String> {
        let raw = fs::read_to_string(path)
            .map_err(|err| format!("failed to read loop items {}: {err}", path.display()))?;
        let payload: Value = serde_json::from_str(&raw)
            .map_err(|err| format!("loop items {} is not valid JSON: {err}", path.display()))?;
        match payload {
            Value::Array(items) => Ok(items),
            Value::Object(map) => match map.get("items") {
                Some(Value::Array(items)) => Ok(items.clone()),
                _ => Err(format!(
                    "loop items {} must be a JSON list or an object with an 'items' list",
                    path.display()
                )),
            },
            _ => Err(format!(
                "loop items {} must be a JSON list or an object with an 'items' list",
                path.display()
            )),
        }
    }

    fn loop_exhausted(&self, step_id: &str, loop_config: &LoopConfig) -> bool {
        let runtime = &self.state.steps[step_id];
        let Some(items) = &runtime.loop_items else {
            return false;
        };
        let cap = loop_config
            .max_iterations
            .map(|max| max as usize)
            .unwrap_or(usize::MAX);
        runtime.loop_index >= items.len() || runtime.loop_index >= cap
    }

    fn loop_has_more_iterations(&self, step_id: &str, loop_config: &LoopConfig) -> bool {
        let runtime = &self.state.steps[step_id];
        let Some(items) = &runtime.loop_items else {
            return false;
        };
        let cap = loop_config
            .max_iterations
            .map(|max| max as usize)
            .unwrap_or(usize::MAX);
        let next = runtime.loop_index + 1;
        next < items.len() && next < cap
    }

    /// Environment a step's agent inherits from its dependencies: one
    /// variable per artifact, a joined list per dependency, and the
    /// issue-markdown conveniences when a `gh_issue_*.md` artifact shows
    /// up. Loop steps additionally get the current item and index.
    fn build_step_env(&self, step: &Step) -> Result<BTreeMap<String, String>, String> {
        let mut env: BTreeMap<String, String> = BTreeMap::new();

        for dep in &step.needs {
            let Some(dep_runtime) = self.state.steps.get(dep) else {
                continue;
            };
            let dep_upper = dep.to_uppercase();
            let mut joined: Vec<String> = Vec::new();
            for (index, artifact) in dep_runtime.artifacts.iter().enumerate() {
                let path = self.resolve_artifact_path(artifact);
                let rendered = path.display().to_string();
                env.insert(format!("DEP_{dep_upper}_ARTIFACT_{index}"), rendered.clone());
                if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                    if name.starts_with("gh_issue_") && name.ends_with(".md") {
                        let parent = path
                            .parent()
                            .map(|p| p.display().to_string())
                            .unwrap_or_default();
                        env.entry("ISSUE_MARKDOWN_PATH".to_string())
                            .or_insert_with(|| rendered.clone());
                        env.entry("ISSUE_MARKDOWN_DIR".to_string()).or_insert(parent);
                        env.entry("ISSUE_MARKDOWN_FILENAME".to_string())
                            .or_insert_with(|| name.to_string());
                    }
                }
                joined.push(rendered);
            }
            env.insert(format!("DEP_{dep_upper}_ARTIFACTS"), joined.join(","));
        }

        if let Some(loop_config) = &step.loop_config {
            let runtime = &self.state.steps[&step.id];
            if let Some(items) = &runtime.loop_items {
                if let Some(item) = items.get(runtime.loop_index) {
                    let encoded = serde_json::to_string(item)
                        .map_err(|err| format!("failed to encode loop item: {err}"))?;
                    env.insert(
                        format!("LOOP_{}", loop_config.index_var.to_uppercase()),
                        runtime.loop_index.to_string(),
                    );
                    env.insert(
                        format!("LOOP_{}", loop_config.item_var.to_uppercase()),
                        encoded,
                    );
                }
            }
        }

        Ok(env)
    }

    fn resolve_artifact_path(&self, artifact: &str) -> PathBuf {
        let candidate = Path::new(artifact);
        if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.repo_dir.join(candidate)
        }
    }

    /// Reset `start` and every step that transitively depends on it back
    /// to a fresh pending runtime. Used by `--start-at-step` resume.
    fn reset_steps_from(&mut self, start: &str) {
        let mut roots = BTreeSet::new();
        roots.insert(start.to_string());
        let to_reset = self.downstream_of(&roots);
        for step_id in to_reset {
            self.state
                .steps
                .insert(step_id.clone(), StepRuntime::default());
            info!(step = %step_id, "reset to pending");
        }
    }

    /// `roots` plus every step reachable from them along `needs` edges.
    fn downstream_of(&self, roots: &BTreeSet<String>) -> BTreeSet<String> {
        let mut reached: BTreeSet<String> = roots.clone();
        let mut changed = true;
        while changed {
            changed = false;
            for step in self.workflow.steps.values() {
                if reached.contains(&step.id) {
                    continue;
                }
                if step.needs.iter().any(|dep| reached.contains(dep)) {
                    reached.insert(step.id.clone());
                    changed = true;
                }
            }
        }
        reached
    }

    fn all_steps_finished(&self) -> bool {
        self.state
            .steps
            .values()
            .all(|runtime| runtime.status.is_terminal_success())
    }

    fn terminal_failures(&self) -> Vec<String> {
        self.state
            .steps
            .iter()
            .filter(|(_, runtime)| {
                runtime.status == StepStatus::Failed && runtime.attempts >= self.max_attempts
            })
            .map(|(step_id, _)| step_id.clone())
            .collect()
    }

    fn fail_step(&mut self, step_id: &str, error: String) {
        {
            let runtime = self.runtime_mut(step_id);
            runtime.status = StepStatus::Failed;
            runtime.last_error = Some(error.clone());
            if runtime.ended_at.is_none() {
                runtime.ended_at = Some(utc_now());
            }
        }
        self.log_engine(&format!("step={step_id} failed: {error}"));
        self.dispatch_failure_notification(step_id);
    }

    /// A failure no retry can fix: consume the whole attempts budget so
    /// the run loop treats the step as terminal.
    fn fail_step_terminal(&mut self, step_id: &str, error: String) {
        self.fail_step(step_id, error);
        let max_attempts = self.max_attempts;
        let runtime = self.runtime_mut(step_id);
        runtime.attempts = runtime.attempts.max(max_attempts);
    }

    fn cleanup_processes(&mut self) {
        for launch in self.active.values_mut() {
            let still_running = matches!(launch.child.try_wait(), Ok(None));
            if still_running {
                if let Err(err) = launch.child.kill() {
                    warn!(step = %launch.step_id, error = %err, "failed to kill agent process");
                }
                let _ = launch.child.wait();
            }
            launch.close_log();
        }
        self.active.clear();
    }

    fn persist_state(&mut self) -> Result<(), StateError> {
        self.state_store.save(&mut self.state)
    }

    fn runtime_mut(&mut self, step_id: &str) -> &mut StepRuntime {
        self.state
            .steps
            .get_mut(step_id)
            .expect("runtime exists for workflow step")
    }

    fn log_engine(&self, message: &str) {
        let line = format!("ts={} run_id={} {message}", utc_now(), self.state.run_id);
        if let Err(err) = append_engine_log_line(&self.run_dir, &line) {
            warn!(error = %err, "failed to append engine log");
        }
    }

    fn step_notification(&self, step_id: &str, trigger: &str) -> StepNotification {
        let runtime = &self.state.steps[step_id];
        StepNotification {
            run_id: self.state.run_id.clone(),
            workflow_name: self.workflow.name.clone(),
            step_id: step_id.to_string(),
            attempt: runtime.attempts,
            status: runtime.status,
            trigger: trigger.to_string(),
            manual_input_path: runtime.manual_input_path.clone(),
            report_path: runtime.report_path.clone(),
            logs: runtime.logs.clone(),
            last_error: runtime.last_error.clone(),
        }
    }

    fn notify_start(&mut self) {
        let context = RunContext {
            run_id: self.state.run_id.clone(),
            workflow_name: self.workflow.name.clone(),
            repo_dir: self.repo_dir.clone(),
        };
        if let Err(err) = self.notifications.start(&context) {
            warn!(error = %err, "notification start failed");
        }
    }

    fn notify_stop(&mut self) {
        if let Err(err) = self.notifications.stop() {
            warn!(error = %err, "notification stop failed");
        }
    }

    fn dispatch_failure_notification(&mut self, step_id: &str) {
        if self.state.steps[step_id].notified_failure {
            return;
        }
        let notification = self.step_notification(step_id, "step_failed");
        match self.notifications.notify_failure(&notification) {
            Ok(()) => self.runtime_mut(step_id).notified_failure = true,
            Err(err) => warn!(step = %step_id, error = %err, "failure notification failed"),
        }
    }

    fn dispatch_human_input_notification(&mut self, step_id: &str) {
        if self.state.steps[step_id].notified_human_input {
            return;
        }
        let notification = self.step_notification(step_id, "human_input_requested");
        match self.notifications.notify_human_input(&notification) {
            Ok(()) => self.runtime_mut(step_id).notified_human_input = true,
            Err(err) => {
                warn!(step = %step_id, error = %err, "human input notification failed");
            }
        }
    }
}
