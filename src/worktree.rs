use crate::shared::ids::new_run_id;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum WorktreeError {
    #[error("{path} is not a git repository: {reason}")]
    NotARepository { path: String, reason: String },
    #[error("invalid worktree branch name '{branch}': {reason}")]
    InvalidBranchName { branch: String, reason: String },
    #[error("worktree destination {path} escapes the repository parent {parent}")]
    DestinationOutsideRepo { path: String, parent: String },
    #[error("worktree path already exists: {path}")]
    PathAlreadyExists { path: String },
    #[error("git branch '{branch}' already exists")]
    BranchAlreadyExists { branch: String },
    #[error("git {args} failed: {details}")]
    GitCommand { args: String, details: String },
    #[error("failed to copy worktree outputs from {from} to {to}: {source}")]
    PersistOutputs {
        from: String,
        to: String,
        #[source]
        source: std::io::Error,
    },
}

/// Metadata about a managed worktree, returned by `create` and consumed
/// by `remove`.
#[derive(Debug, Clone, PartialEq)]
pub struct GitWorktreeHandle {
    pub root_repo: PathBuf,
    pub path: PathBuf,
    pub branch: String,
    pub base_ref: String,
    pub run_id: String,
    pub created_branch: bool,
}

/// Creates and tears down git worktrees so parallel runs on one
/// repository stay isolated. No locking; concurrent orchestrators must
/// pick distinct branch names.
#[derive(Debug, Clone)]
pub struct GitWorktreeManager {
    git: String,
    repo_dir: PathBuf,
}

impl GitWorktreeManager {
    pub fn new(repo_dir: &Path) -> Result<Self, WorktreeError> {
        Self::with_git_executable(repo_dir, "git")
    }

    pub fn with_git_executable(repo_dir: &Path, git: &str) -> Result<Self, WorktreeError> {
        let output = Command::new(git)
            .arg("-C")
            .arg(repo_dir)
            .args(["rev-parse", "--show-toplevel"])
            .output()
            .map_err(|err| WorktreeError::NotARepository {
                path: repo_dir.display().to_string(),
                reason: err.to_string(),
            })?;
        if !output.status.success() {
            return Err(WorktreeError::NotARepository {
                path: repo_dir.display().to_string(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        let toplevel = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(Self {
            git: git.to_string(),
            repo_dir: PathBuf::from(toplevel),
        })
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_dir
    }

    pub fn create(
        &self,
        root: Option<&Path>,
        base_ref: Option<&str>,
        branch: Option<&str>,
    ) -> Result<GitWorktreeHandle, WorktreeError> {
        let run_id = new_run_id();
        let branch_name = match branch {
            Some(name) => name.to_string(),
            None => format!("agents/run-{run_id}"),
        };
        validate_branch_name(&branch_name)?;

        let worktree_root = self.resolve_root_directory(root);
        let worktree_path = worktree_root.join(branch_name.replace('/', "__"));
        self.assert_within_repo_parent(&worktree_path)?;

        if worktree_path.exists() {
            return Err(WorktreeError::PathAlreadyExists {
                path: worktree_path.display().to_string(),
            });
        }
        if self.branch_exists(&branch_name) {
            return Err(WorktreeError::BranchAlreadyExists {
                branch: branch_name,
            });
        }

        let base_ref = base_ref.unwrap_or("HEAD").to_string();
        self.run_git(&[
            "worktree",
            "add",
            "-b",
            &branch_name,
            &worktree_path.display().to_string(),
            &base_ref,
        ])
        .map_err(|err| match err {
            WorktreeError::GitCommand { ref details, .. } if details.contains("already exists") => {
                WorktreeError::BranchAlreadyExists {
                    branch: branch_name.clone(),
                }
            }
            other => other,
        })?;

        Ok(GitWorktreeHandle {
            root_repo: self.repo_dir.clone(),
            path: worktree_path,
            branch: branch_name,
            base_ref,
            run_id,
            created_branch: true,
        })
    }

    pub fn remove(
        &self,
        handle: &GitWorktreeHandle,
        force: bool,
        delete_branch: bool,
    ) -> Result<(), WorktreeError> {
        let path = handle.path.display().to_string();
        let mut args = vec!["worktree", "remove"];
        if force {
            args.push("--force");
        }
        args.push(&path);
        self.run_git(&args)?;

        if delete_branch && handle.created_branch {
            let flag = if force { "-D" } else { "-d" };
            if let Err(err) = self.run_git(&["branch", flag, &handle.branch]) {
                warn!(branch = %handle.branch, error = %err, "failed to delete worktree branch");
            }
        }
        Ok(())
    }

    fn branch_exists(&self, branch: &str) -> bool {
        Command::new(&self.git)
            .arg("-C")
            .arg(&self.repo_dir)
            .args(["rev-parse", "--verify", "--quiet", branch])
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false)
    }

    fn resolve_root_directory(&self, root: Option<&Path>) -> PathBuf {
        match root {
            None => self.repo_dir.join(".agents/worktrees"),
            Some(candidate) if candidate.is_absolute() => candidate.to_path_buf(),
            Some(candidate) => self.repo_dir.join(candidate),
        }
    }

    fn assert_within_repo_parent(&self, candidate: &Path) -> Result<(), WorktreeError> {
        let enclosing = self.repo_dir.parent().unwrap_or(&self.repo_dir);
        let normalized = normalize_path(candidate);
        if normalized.starts_with(normalize_path(enclosing)) {
            Ok(())
        } else {
            Err(WorktreeError::DestinationOutsideRepo {
                path: candidate.display().to_string(),
                parent: enclosing.display().to_string(),
            })
        }
    }

    fn run_git(&self, args: &[&str]) -> Result<String, WorktreeError> {
        let output = Command::new(&self.git)
            .arg("-C")
            .arg(&self.repo_dir)
            .args(args)
            .output()
            .map_err(|err| WorktreeError::GitCommand {
                args: args.join(" "),
                details: err.to_string(),
            })?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
            let details = if stderr.is_empty() { stdout } else { stderr };
            Err(WorktreeError::GitCommand {
                args: args.join(" "),
                details,
            })
        }
    }
}

fn validate_branch_name(branch: &str) -> Result<(), WorktreeError> {
    let invalid = |reason: &str| WorktreeError::InvalidBranchName {
        branch: branch.to_string(),
        reason: reason.to_string(),
    };
    if branch.is_empty() {
        return Err(invalid("branch name must be non-empty"));
    }
    if branch.starts_with('-') {
        return Err(invalid("branch name must not start with '-'"));
    }
    if branch.contains("..") {
        return Err(invalid("branch name must not contain '..'"));
    }
    if !branch
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '/' | '_' | '-'))
    {
        return Err(invalid(
            "branch name must use only ASCII letters, digits, '/', '_' or '-'",
        ));
    }
    Ok(())
}

/// Lexically resolve `.` and `..` components; the target may not exist
/// yet, so `fs::canonicalize` is not an option.
fn normalize_path(path: &Path) -> PathBuf {
    use std::path::Component;
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                normalized.pop();
            }
            Component::CurDir => {}
            other => normalized.push(other),
        }
    }
    normalized
}

/// Copy the worktree's `.agents/runs/<run_id>` tree back into the primary
/// repository so run artifacts survive teardown.
pub fn persist_worktree_outputs(
    worktree_path: &Path,
    repo_root: &Path,
    run_id: &str,
) -> Result<PathBuf, WorktreeError> {
    let source = worktree_path.join(".agents/runs").join(run_id);
    let destination = repo_root.join(".agents/runs").join(run_id);
    if !source.exists() {
        return Ok(destination);
    }
    copy_tree(&source, &destination).map_err(|source_err| WorktreeError::PersistOutputs {
        from: source.display().to_string(),
        to: destination.display().to_string(),
        source: source_err,
    })?;
    Ok(destination)
}

fn copy_tree(source: &Path, destination: &Path) -> std::io::Result<()> {
    fs::create_dir_all(destination)?;
    for entry in fs::read_dir(source)? {
        let entry = entry?;
        let target = destination.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branch_names_are_validated() {
        assert!(validate_branch_name("agents/run-12ab34cd").is_ok());
        assert!(validate_branch_name("feature_x-1").is_ok());
        assert!(validate_branch_name("").is_err());
        assert!(validate_branch_name("-leading-dash").is_err());
        assert!(validate_branch_name("a..b").is_err());
        assert!(validate_branch_name("spaces are bad").is_err());
        assert!(validate_branch_name("semi;colon").is_err());
    }

    #[test]
    fn normalize_path_strips_traversal() {
        let normalized = normalize_path(Path::new("/repo/.agents/../../outside"));
        assert_eq!(normalized, PathBuf::from("/outside"));
    }
}
