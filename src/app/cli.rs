use clap::{ArgGroup, Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "agentflow",
    about = "File-driven workflow orchestrator for long-running coding agents"
)]
pub struct Cli {
    /// Logging level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run a workflow against a target repository
    Run(RunArgs),
}

#[derive(Debug, Args)]
#[command(group(
    ArgGroup::new("launcher")
        .required(true)
        .args(["wrapper", "command_template"])
))]
pub struct RunArgs {
    /// Path to the target repository
    #[arg(long)]
    pub repo: PathBuf,

    /// Workflow YAML definition
    #[arg(long)]
    pub workflow: PathBuf,

    /// Path to a run report JSON schema for validation
    #[arg(long)]
    pub schema: Option<PathBuf>,

    /// Path to an agent wrapper script
    #[arg(long)]
    pub wrapper: Option<PathBuf>,

    /// Custom command template for launching agents (placeholders:
    /// {run_id}, {step_id}, {agent}, {prompt}, {repo}, {report},
    /// {attempt}, {manual_input})
    #[arg(long)]
    pub command_template: Option<String>,

    /// Run report poll interval in seconds
    #[arg(long, default_value_t = 1.0)]
    pub poll_interval: f64,

    /// Max attempts per step before marking it failed
    #[arg(long, default_value_t = 2)]
    pub max_attempts: u32,

    /// Max loop-back iterations before a gate-failing step goes terminal
    #[arg(long, default_value_t = 4)]
    pub max_iterations: u32,

    /// JSON file mapping gate names to booleans
    #[arg(long)]
    pub gate_state_file: Option<PathBuf>,

    /// Where to persist run state (relative paths resolve against the repo)
    #[arg(long, default_value = ".agents/run_state.json")]
    pub state_file: PathBuf,

    /// Hold human-in-the-loop steps until a manual input file appears
    #[arg(long)]
    pub pause_for_human_input: bool,

    /// Directory for agent stdout/stderr logs
    #[arg(long)]
    pub logs_dir: Option<PathBuf>,

    /// Additional arguments appended to the agent command
    #[arg(long = "wrapper-arg")]
    pub wrapper_arg: Vec<String>,

    /// Working directory for agent processes (default: repo path)
    #[arg(long, conflicts_with = "git_worktree")]
    pub workdir: Option<PathBuf>,

    /// Environment overrides injected into agent runs (KEY=VALUE)
    #[arg(long = "env")]
    pub env: Vec<String>,

    /// GitHub issue number to process (sets ISSUE_NUMBER for agents)
    #[arg(long)]
    pub issue_number: Option<String>,

    /// Resume a previous run, resetting this step and its downstream
    #[arg(long)]
    pub start_at_step: Option<String>,

    /// Create an isolated git worktree for this run
    #[arg(long)]
    pub git_worktree: bool,

    /// Git ref to base the worktree on (default: HEAD)
    #[arg(long, requires = "git_worktree")]
    pub git_worktree_ref: Option<String>,

    /// Branch name for the worktree (default: agents/run-<id>)
    #[arg(long, requires = "git_worktree")]
    pub git_worktree_branch: Option<String>,

    /// Directory to place worktrees (default: <repo>/.agents/worktrees)
    #[arg(long, requires = "git_worktree")]
    pub git_worktree_root: Option<PathBuf>,

    /// Keep the worktree after the workflow finishes
    #[arg(long, requires = "git_worktree")]
    pub git_worktree_keep: bool,
}
