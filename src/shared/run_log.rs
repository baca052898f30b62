use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

pub fn engine_log_path(run_dir: &Path) -> PathBuf {
    run_dir.join("engine.log")
}

/// Append one line to the per-run engine log. Scheduling decisions land
/// here so a run directory is self-describing after the fact.
pub fn append_engine_log_line(run_dir: &Path, line: &str) -> std::io::Result<()> {
    let path = engine_log_path(run_dir);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)?;
    writeln!(file, "{line}")
}
