pub mod cli;

use crate::gating::{AlwaysOpenGate, CompositeGate, FileBackedGate, GateEvaluator};
use crate::orchestrator::{Orchestrator, OrchestratorError, OrchestratorOptions, RunOutcome};
use crate::report::RunReportReader;
use crate::runner::{ExecutionTemplate, StepRunner};
use crate::state::RunStateStore;
use crate::workflow::{load_workflow, Workflow, WorkflowLoadError};
use crate::worktree::{
    persist_worktree_outputs, GitWorktreeHandle, GitWorktreeManager, WorktreeError,
};
use cli::RunArgs;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Default command shape for `--wrapper` mode; the wrapper binary is bound
/// into the template context.
const DEFAULT_WRAPPER_TEMPLATE: &str = "{wrapper} --run-id {run_id} --step-id {step_id} \
     --agent {agent} --prompt {prompt} --repo {repo} --report {report}";

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowLoadError),
    #[error("Git worktree error: {0}")]
    Worktree(#[from] WorktreeError),
    #[error("Failed to load run report schema: {0}")]
    Schema(String),
    #[error("Invalid env override '{0}', expected KEY=VALUE")]
    InvalidEnvOverride(String),
    #[error("Wrapper script not found: {0}")]
    WrapperNotFound(String),
    #[error("Invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },
    #[error("{0}")]
    Orchestrator(#[from] OrchestratorError),
    #[error("Failed to remove git worktree: {0}")]
    WorktreeTeardown(String),
}

pub fn parse_env(pairs: &[String]) -> Result<BTreeMap<String, String>, AppError> {
    let mut env = BTreeMap::new();
    for pair in pairs {
        let Some((key, value)) = pair.split_once('=') else {
            return Err(AppError::InvalidEnvOverride(pair.clone()));
        };
        env.insert(key.to_string(), value.to_string());
    }
    Ok(env)
}

fn resolve_existing(path: &Path) -> Result<PathBuf, AppError> {
    std::fs::canonicalize(path).map_err(|err| AppError::InvalidPath {
        path: path.display().to_string(),
        reason: err.to_string(),
    })
}

/// Translate `run` flags into a constructed orchestrator and drive it to
/// completion, including worktree setup and teardown.
pub fn execute_run(args: &RunArgs) -> Result<RunOutcome, AppError> {
    let repo_dir = resolve_existing(&args.repo)?;
    let workflow_path = resolve_existing(&args.workflow)?;
    let workflow_root = workflow_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| repo_dir.clone());
    let workflow = load_workflow(&workflow_path)?;

    let mut worktree: Option<(GitWorktreeManager, GitWorktreeHandle)> = None;
    let mut run_repo_dir = repo_dir.clone();
    let mut run_id_override = None;
    if args.git_worktree {
        let manager = GitWorktreeManager::new(&repo_dir)?;
        let worktree_root = args.git_worktree_root.as_ref().map(|root| {
            if root.is_absolute() {
                root.clone()
            } else {
                manager.repo_root().join(root)
            }
        });
        let handle = manager.create(
            worktree_root.as_deref(),
            args.git_worktree_ref.as_deref(),
            args.git_worktree_branch.as_deref(),
        )?;
        info!(
            path = %handle.path.display(),
            branch = %handle.branch,
            "created git worktree"
        );
        run_repo_dir = handle.path.clone();
        run_id_override = Some(handle.run_id.clone());
        worktree = Some((manager, handle));
    }

    let result = run_in_repo(args, workflow, &workflow_root, &run_repo_dir, run_id_override);

    let result = match worktree {
        None => result,
        Some((manager, handle)) => {
            if args.git_worktree_keep {
                info!(
                    path = %handle.path.display(),
                    branch = %handle.branch,
                    "git worktree preserved"
                );
                result
            } else {
                let run_id = result
                    .as_ref()
                    .map(|(_, run_id)| run_id.clone())
                    .unwrap_or_else(|_| handle.run_id.clone());
                match persist_worktree_outputs(&handle.path, &handle.root_repo, &run_id) {
                    Ok(destination) => {
                        info!(path = %destination.display(), "copied worktree outputs");
                    }
                    Err(err) => warn!(error = %err, "failed to persist worktree outputs"),
                }
                match manager.remove(&handle, true, true) {
                    Ok(()) => result,
                    Err(err) => match &result {
                        // A failed removal must not mask a failed run.
                        Ok((RunOutcome::Completed, _)) => {
                            Err(AppError::WorktreeTeardown(err.to_string()))
                        }
                        _ => {
                            warn!(error = %err, "failed to remove git worktree");
                            result
                        }
                    },
                }
            }
        }
    };

    result.map(|(outcome, _)| outcome)
}

fn run_in_repo(
    args: &RunArgs,
    workflow: Workflow,
    workflow_root: &Path,
    run_repo_dir: &Path,
    run_id_override: Option<String>,
) -> Result<(RunOutcome, String), AppError> {
    let gate_evaluator: Box<dyn GateEvaluator> = match &args.gate_state_file {
        Some(path) => Box::new(CompositeGate::new(vec![
            Box::new(AlwaysOpenGate),
            Box::new(FileBackedGate::new(path.clone())),
        ])),
        None => Box::new(CompositeGate::new(vec![Box::new(AlwaysOpenGate)])),
    };

    let report_reader = match &args.schema {
        Some(schema) => RunReportReader::new()
            .with_schema(schema)
            .map_err(|err| AppError::Schema(err.to_string()))?,
        None => RunReportReader::new(),
    };

    let state_file = if args.state_file.is_absolute() {
        args.state_file.clone()
    } else {
        run_repo_dir.join(&args.state_file)
    };
    let state_store = RunStateStore::new(state_file);

    let mut base_env = parse_env(&args.env)?;
    if let Some(issue_number) = &args.issue_number {
        base_env.insert("ISSUE_NUMBER".to_string(), issue_number.clone());
    }

    let logs_dir = args
        .logs_dir
        .clone()
        .unwrap_or_else(|| run_repo_dir.join(".agents/logs"));
    let runner = build_runner(args, run_repo_dir, &logs_dir, base_env)?;

    let mut orchestrator = Orchestrator::new(
        workflow,
        workflow_root,
        run_repo_dir,
        report_reader,
        state_store,
        Box::new(runner),
        OrchestratorOptions {
            gate_evaluator: Some(gate_evaluator),
            notifications: None,
            poll_interval: Duration::from_secs_f64(args.poll_interval.max(0.0)),
            max_attempts: args.max_attempts,
            max_iterations: args.max_iterations,
            pause_for_human_input: args.pause_for_human_input,
            run_id: run_id_override,
            start_at_step: args.start_at_step.clone(),
        },
    )?;
    let run_id = orchestrator.run_id().to_string();
    let outcome = orchestrator.run()?;
    Ok((outcome, run_id))
}

fn build_runner(
    args: &RunArgs,
    run_repo_dir: &Path,
    logs_dir: &Path,
    base_env: BTreeMap<String, String>,
) -> Result<StepRunner, AppError> {
    let workdir = args
        .workdir
        .clone()
        .unwrap_or_else(|| run_repo_dir.to_path_buf());

    if let Some(template) = &args.command_template {
        return Ok(
            StepRunner::new(ExecutionTemplate::new(template.clone()), run_repo_dir, logs_dir)
                .with_workdir(workdir)
                .with_default_env(base_env)
                .with_default_args(args.wrapper_arg.clone()),
        );
    }

    let wrapper = args
        .wrapper
        .as_ref()
        .expect("clap enforces wrapper or command template");
    let wrapper_path = std::fs::canonicalize(wrapper)
        .map_err(|_| AppError::WrapperNotFound(wrapper.display().to_string()))?;
    let mut context = BTreeMap::new();
    context.insert(
        "wrapper".to_string(),
        wrapper_path.display().to_string(),
    );
    Ok(
        StepRunner::new(ExecutionTemplate::new(DEFAULT_WRAPPER_TEMPLATE), run_repo_dir, logs_dir)
            .with_workdir(workdir)
            .with_template_context(context)
            .with_default_env(base_env)
            .with_default_args(args.wrapper_arg.clone()),
    )
}
