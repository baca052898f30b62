use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-local sequence number for swap-file names. Uniqueness across
/// processes comes from the pid component.
static WRITE_SEQ: AtomicU64 = AtomicU64::new(0);

/// Replace `path` with `content` without readers ever observing a torn
/// file: write a swap sibling, fsync it, rename over the target, then
/// fsync the directory. Parent directories are created as needed, and a
/// swap file left by a failed write is removed before returning.
pub fn atomic_write_file(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| std::io::Error::other("path has no parent"))?;
    fs::create_dir_all(parent)?;

    let swap_path = swap_sibling(path, parent);
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&swap_path)?;
    if let Err(err) = file.write_all(content).and_then(|()| file.sync_all()) {
        drop(file);
        let _ = fs::remove_file(&swap_path);
        return Err(err);
    }
    drop(file);

    fs::rename(&swap_path, path)?;
    sync_dir(parent)
}

fn swap_sibling(path: &Path, parent: &Path) -> PathBuf {
    let seq = WRITE_SEQ.fetch_add(1, Ordering::Relaxed);
    let mut name = path
        .file_name()
        .map(|base| base.to_os_string())
        .unwrap_or_default();
    name.push(format!(".swap.{}.{seq}", std::process::id()));
    parent.join(name)
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> std::io::Result<()> {
    fs::File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}
