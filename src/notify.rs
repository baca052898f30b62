use crate::state::StepStatus;
use std::path::PathBuf;

/// Context handed to a sink when a run begins.
#[derive(Debug, Clone, PartialEq)]
pub struct RunContext {
    pub run_id: String,
    pub workflow_name: String,
    pub repo_dir: PathBuf,
}

/// Step-level event payload for failure and human-input notifications.
#[derive(Debug, Clone, PartialEq)]
pub struct StepNotification {
    pub run_id: String,
    pub workflow_name: String,
    pub step_id: String,
    pub attempt: u32,
    pub status: StepStatus,
    pub trigger: String,
    pub manual_input_path: Option<PathBuf>,
    pub report_path: Option<PathBuf>,
    pub logs: Vec<String>,
    pub last_error: Option<String>,
}

/// Fire-and-forget sink. Implementations must not assume they are called
/// more than once per step event; the orchestrator enforces idempotence
/// through the runtime flags and swallows every error a sink raises.
pub trait NotificationService: Send {
    fn start(&mut self, context: &RunContext) -> Result<(), String>;
    fn stop(&mut self) -> Result<(), String>;
    fn notify_failure(&mut self, notification: &StepNotification) -> Result<(), String>;
    fn notify_human_input(&mut self, notification: &StepNotification) -> Result<(), String>;
}

/// Default sink: does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullNotificationService;

impl NotificationService for NullNotificationService {
    fn start(&mut self, _context: &RunContext) -> Result<(), String> {
        Ok(())
    }

    fn stop(&mut self) -> Result<(), String> {
        Ok(())
    }

    fn notify_failure(&mut self, _notification: &StepNotification) -> Result<(), String> {
        Ok(())
    }

    fn notify_human_input(&mut self, _notification: &StepNotification) -> Result<(), String> {
        Ok(())
    }
}
