use crate::shared::fs_atomic::atomic_write_file;
use crate::shared::time::utc_now;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("failed to write run state {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read run state {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse run state {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Pending,
    Running,
    WaitingOnHuman,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    /// Terminal for scheduling purposes: dependents may proceed.
    pub fn is_terminal_success(self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Skipped)
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StepStatus::Pending => "PENDING",
            StepStatus::Running => "RUNNING",
            StepStatus::WaitingOnHuman => "WAITING_ON_HUMAN",
            StepStatus::Completed => "COMPLETED",
            StepStatus::Failed => "FAILED",
            StepStatus::Skipped => "SKIPPED",
        };
        write!(f, "{name}")
    }
}

/// Mutable per-step record. One per workflow step, owned by the
/// orchestrator for the lifetime of the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepRuntime {
    pub status: StepStatus,
    pub attempts: u32,
    pub iteration_count: u32,
    pub report_path: Option<PathBuf>,
    pub started_at: Option<String>,
    pub ended_at: Option<String>,
    pub last_error: Option<String>,
    pub artifacts: Vec<String>,
    pub metrics: Map<String, Value>,
    pub logs: Vec<String>,
    pub manual_input_path: Option<PathBuf>,
    pub blocked_by_loop: Option<String>,
    pub notified_failure: bool,
    pub notified_human_input: bool,
    pub loop_items: Option<Vec<Value>>,
    pub loop_index: usize,
    pub loop_completed: bool,
}

impl Default for StepRuntime {
    fn default() -> Self {
        Self {
            status: StepStatus::Pending,
            attempts: 0,
            iteration_count: 0,
            report_path: None,
            started_at: None,
            ended_at: None,
            last_error: None,
            artifacts: Vec::new(),
            metrics: Map::new(),
            logs: Vec::new(),
            manual_input_path: None,
            blocked_by_loop: None,
            notified_failure: false,
            notified_human_input: false,
            loop_items: None,
            loop_index: 0,
            loop_completed: false,
        }
    }
}

impl StepRuntime {
    /// Requeue after a failed attempt. Attempts and loop bookkeeping
    /// survive; timing, report, error and notification flags are cleared.
    pub fn reset_for_retry(&mut self) {
        self.status = StepStatus::Pending;
        self.report_path = None;
        self.started_at = None;
        self.ended_at = None;
        self.last_error = None;
        self.notified_failure = false;
        self.notified_human_input = false;
    }

    /// Advance a per-step loop to its next item. Each iteration gets a
    /// fresh attempts budget.
    pub fn reset_for_loop_iteration(&mut self) {
        self.loop_index += 1;
        self.status = StepStatus::Pending;
        self.attempts = 0;
        self.report_path = None;
        self.started_at = None;
        self.ended_at = None;
        self.last_error = None;
        self.notified_failure = false;
        self.notified_human_input = false;
    }
}

/// Durable record for one run: the step map plus the directory layout the
/// run was created with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: String,
    pub workflow_name: String,
    pub repo_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub manual_inputs_dir: PathBuf,
    pub created_at: String,
    #[serde(default)]
    pub updated_at: Option<String>,
    pub steps: BTreeMap<String, StepRuntime>,
}

impl RunState {
    pub fn step(&self, step_id: &str) -> Option<&StepRuntime> {
        self.steps.get(step_id)
    }
}

/// Persists the full run state as one JSON document. Writes go through a
/// temp sibling and rename so a crash never leaves a torn file.
#[derive(Debug, Clone)]
pub struct RunStateStore {
    path: PathBuf,
}

impl RunStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Retarget the store once the true run id (and so the run directory)
    /// is known.
    pub fn set_path(&mut self, path: impl Into<PathBuf>) {
        self.path = path.into();
    }

    pub fn save(&self, state: &mut RunState) -> Result<(), StateError> {
        state.updated_at = Some(utc_now());
        let body = serde_json::to_vec_pretty(state).map_err(|source| StateError::Parse {
            path: self.path.display().to_string(),
            source,
        })?;
        atomic_write_file(&self.path, &body).map_err(|source| StateError::Write {
            path: self.path.display().to_string(),
            source,
        })
    }

    pub fn load(&self) -> Result<Option<RunState>, StateError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(source) if source.kind() == ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StateError::Read {
                    path: self.path.display().to_string(),
                    source,
                })
            }
        };
        let state = serde_json::from_str(&raw).map_err(|source| StateError::Parse {
            path: self.path.display().to_string(),
            source,
        })?;
        Ok(Some(state))
    }
}
