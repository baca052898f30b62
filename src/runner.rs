use crate::workflow::Step;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("command template references unknown placeholder '{{{name}}}'")]
    UnknownPlaceholder { name: String },
    #[error("command template has an unbalanced brace")]
    UnbalancedBrace,
    #[error("failed to split command '{command}': {reason}")]
    Split { command: String, reason: String },
    #[error("command template rendered to an empty command")]
    EmptyCommand,
    #[error("failed to create logs directory {path}: {source}")]
    CreateLogsDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to open step log {path}: {source}")]
    OpenLog {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to spawn agent command '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

/// Builds a subprocess argv from a `{placeholder}` format string.
/// Substitution happens first, then shell-quoting rules split the
/// rendered line into tokens.
#[derive(Debug, Clone)]
pub struct ExecutionTemplate {
    template: String,
}

impl ExecutionTemplate {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    pub fn build(&self, context: &BTreeMap<String, String>) -> Result<Vec<String>, RunnerError> {
        let rendered = render_placeholders(&self.template, context)?;
        shell_words::split(&rendered).map_err(|err| RunnerError::Split {
            command: rendered.clone(),
            reason: err.to_string(),
        })
    }
}

fn render_placeholders(
    template: &str,
    context: &BTreeMap<String, String>,
) -> Result<String, RunnerError> {
    let mut rendered = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '{' => {
                if chars.peek() == Some(&'{') {
                    chars.next();
                    rendered.push('{');
                    continue;
                }
                let mut name = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(inner) => name.push(inner),
                        None => return Err(RunnerError::UnbalancedBrace),
                    }
                }
                let value = context
                    .get(&name)
                    .ok_or(RunnerError::UnknownPlaceholder { name })?;
                rendered.push_str(value);
            }
            '}' => {
                if chars.peek() == Some(&'}') {
                    chars.next();
                }
                rendered.push('}');
            }
            other => rendered.push(other),
        }
    }
    Ok(rendered)
}

/// Handle for one launched agent process: the child, the report path it
/// is expected to write, and the open log sink. `close_log` is idempotent
/// and must be called once the child has terminated.
#[derive(Debug)]
pub struct StepLaunch {
    pub step_id: String,
    pub attempt: u32,
    pub child: Child,
    pub report_path: PathBuf,
    pub log_path: PathBuf,
    log_file: Option<File>,
}

impl StepLaunch {
    pub fn new(
        step_id: String,
        attempt: u32,
        child: Child,
        report_path: PathBuf,
        log_path: PathBuf,
        log_file: Option<File>,
    ) -> Self {
        Self {
            step_id,
            attempt,
            child,
            report_path,
            log_path,
            log_file,
        }
    }

    pub fn close_log(&mut self) {
        self.log_file.take();
    }

    pub fn log_is_open(&self) -> bool {
        self.log_file.is_some()
    }
}

/// Everything the scheduler knows when it asks for a launch.
#[derive(Debug)]
pub struct LaunchRequest<'a> {
    pub step: &'a Step,
    pub run_id: &'a str,
    pub report_path: PathBuf,
    pub prompt_path: PathBuf,
    pub manual_input_path: Option<PathBuf>,
    pub attempt: u32,
    pub artifacts_dir: PathBuf,
    pub logs_dir: Option<PathBuf>,
    pub extra_env: BTreeMap<String, String>,
}

/// Turns a step plus run context into a child process. The production
/// implementation is [`StepRunner`]; tests substitute scripted fakes.
pub trait StepLauncher: Send {
    fn launch(&mut self, request: LaunchRequest<'_>) -> Result<StepLaunch, RunnerError>;
}

pub struct StepRunner {
    template: ExecutionTemplate,
    repo_dir: PathBuf,
    logs_dir: PathBuf,
    workdir: PathBuf,
    base_context: BTreeMap<String, String>,
    default_env: BTreeMap<String, String>,
    default_args: Vec<String>,
}

impl StepRunner {
    pub fn new(
        template: ExecutionTemplate,
        repo_dir: impl Into<PathBuf>,
        logs_dir: impl Into<PathBuf>,
    ) -> Self {
        let repo_dir = repo_dir.into();
        Self {
            template,
            workdir: repo_dir.clone(),
            repo_dir,
            logs_dir: logs_dir.into(),
            base_context: BTreeMap::new(),
            default_env: BTreeMap::new(),
            default_args: Vec::new(),
        }
    }

    pub fn with_workdir(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.workdir = workdir.into();
        self
    }

    pub fn with_template_context(mut self, context: BTreeMap<String, String>) -> Self {
        self.base_context = context;
        self
    }

    pub fn with_default_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.default_env = env;
        self
    }

    pub fn with_default_args(mut self, args: Vec<String>) -> Self {
        self.default_args = args;
        self
    }
}

impl StepLauncher for StepRunner {
    fn launch(&mut self, request: LaunchRequest<'_>) -> Result<StepLaunch, RunnerError> {
        let mut context = self.base_context.clone();
        context.insert("repo".to_string(), self.repo_dir.display().to_string());
        context.insert("step_id".to_string(), request.step.id.clone());
        context.insert("agent".to_string(), request.step.agent.clone());
        context.insert(
            "prompt".to_string(),
            request.prompt_path.display().to_string(),
        );
        context.insert(
            "report".to_string(),
            request.report_path.display().to_string(),
        );
        context.insert("run_id".to_string(), request.run_id.to_string());
        context.insert("attempt".to_string(), request.attempt.to_string());
        context.insert(
            "manual_input".to_string(),
            request
                .manual_input_path
                .as_ref()
                .map(|path| path.display().to_string())
                .unwrap_or_default(),
        );

        let mut command = self.template.build(&context)?;
        command.extend(self.default_args.iter().cloned());
        if command.is_empty() {
            return Err(RunnerError::EmptyCommand);
        }

        let logs_dir = request.logs_dir.as_deref().unwrap_or(&self.logs_dir);
        fs::create_dir_all(logs_dir).map_err(|source| RunnerError::CreateLogsDir {
            path: logs_dir.display().to_string(),
            source,
        })?;
        let log_path = logs_dir.join(format!(
            "{}__{}__attempt{}.log",
            request.run_id, request.step.id, request.attempt
        ));
        let log_file = File::create(&log_path).map_err(|source| RunnerError::OpenLog {
            path: log_path.display().to_string(),
            source,
        })?;

        let mut env: BTreeMap<String, String> = std::env::vars().collect();
        env.extend(self.default_env.clone());
        env.insert("RUN_ID".to_string(), request.run_id.to_string());
        env.insert("STEP_ID".to_string(), request.step.id.clone());
        env.insert("AGENT_ID".to_string(), request.step.agent.clone());
        env.insert("REPO_DIR".to_string(), self.repo_dir.display().to_string());
        env.insert(
            "PROMPT_PATH".to_string(),
            request.prompt_path.display().to_string(),
        );
        env.insert(
            "REPORT_PATH".to_string(),
            request.report_path.display().to_string(),
        );
        env.insert(
            "MANUAL_RESULT_PATH".to_string(),
            request
                .manual_input_path
                .as_ref()
                .map(|path| path.display().to_string())
                .unwrap_or_default(),
        );
        env.insert("STEP_ATTEMPT".to_string(), request.attempt.to_string());
        env.insert(
            "ARTIFACTS_DIR".to_string(),
            request.artifacts_dir.display().to_string(),
        );
        if let Some(model) = &request.step.model {
            env.insert("STEP_MODEL".to_string(), model.clone());
        }
        env.extend(request.extra_env.clone());
        apply_issue_markdown_defaults(&mut env);

        let stdout = log_file.try_clone().map_err(|source| RunnerError::OpenLog {
            path: log_path.display().to_string(),
            source,
        })?;
        let stderr = log_file.try_clone().map_err(|source| RunnerError::OpenLog {
            path: log_path.display().to_string(),
            source,
        })?;

        let command_line = command.join(" ");
        let mut child_command = Command::new(&command[0]);
        child_command
            .args(&command[1..])
            .current_dir(&self.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .env_clear()
            .envs(&env);

        let child = child_command.spawn().map_err(|source| RunnerError::Spawn {
            command: command_line,
            source,
        })?;

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

/// When `ISSUE_NUMBER` reaches the child, derive the well-known issue
/// markdown locations under the artifacts directory unless the caller
/// already provided them.
fn apply_issue_markdown_defaults(env: &mut BTreeMap<String, String>) {
    let issue = match env.get("ISSUE_NUMBER") {
        Some(value) if !value.is_empty() => value.clone(),
        _ => return,
    };
    let artifacts_dir = match env.get("ARTIFACTS_DIR") {
        Some(value) if !value.is_empty() => value.clone(),
        _ => return,
    };
    let filename = format!("gh_issue_{issue}.md");
    let path = Path::new(&artifacts_dir).join(&filename);
    env.entry("ISSUE_MARKDOWN_FILENAME".to_string())
        .or_insert_with(|| filename.clone());
    env.entry("ISSUE_MARKDOWN_DIR".to_string())
        .or_insert_with(|| artifacts_dir.clone());
    env.entry("ISSUE_MARKDOWN_PATH".to_string())
        .or_insert_with(|| path.display().to_string());
}
