//! Result finalizer - post-run checks, kept outputs and the display list
//!
//! Every CHECKS and KEEP item is evaluated on its own; one failure never
//! stops the others.

use std::io::ErrorKind;
use std::path::Path;

use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

use crate::error::Diagnostics;

const SUCCESS_MARKER: &str = "D 0 DONE";

/// One CHECKS assertion
#[derive(Debug, Clone, PartialEq)]
pub enum Check {
    /// File exists and is empty
    Empty(String),
    /// File exists, is small, and ends with the success marker line
    Success(String),
}

impl Check {
    pub fn parse(raw: &str) -> Option<Self> {
        let mut parts = raw.split_whitespace();
        let kind = parts.next()?;
        let file = parts.next()?.to_string();
        if parts.next().is_some() {
            return None;
        }
        match kind {
            "EMPTY" => Some(Check::Empty(file)),
            "SUCCESS" => Some(Check::Success(file)),
            _ => None,
        }
    }

    async fn evaluate(&self, work_dir: &Path, max_bytes: u64) -> Result<(), String> {
        match self {
            Check::Empty(file) => {
                let meta = tokio::fs::metadata(work_dir.join(file))
                    .await
                    .map_err(|_| format!("check EMPTY {}: file does not exist", file))?;
                if meta.len() != 0 {
                    return Err(format!("check EMPTY {}: file is not empty ({} bytes)", file, meta.len()));
                }
                Ok(())
            }
            Check::Success(file) => {
                let path = work_dir.join(file);
                let meta = tokio::fs::metadata(&path)
                    .await
                    .map_err(|_| format!("check SUCCESS {}: file does not exist", file))?;
                if meta.len() >= max_bytes {
                    return Err(format!("check SUCCESS {}: file is too large ({} bytes)", file, meta.len()));
                }
                let text = tokio::fs::read_to_string(&path)
                    .await
                    .map_err(|_| format!("check SUCCESS {}: file is unreadable", file))?;
                match text.lines().last() {
                    Some(line) if line == SUCCESS_MARKER => Ok(()),
                    _ => Err(format!("check SUCCESS {}: last line is not {:?}", file, SUCCESS_MARKER)),
                }
            }
        }
    }
}

/// Evaluate all CHECKS, collecting one error per failed assertion
pub async fn run_checks(checks: &[String], work_dir: &Path, max_bytes: u64) -> Diagnostics {
    let mut diag = Diagnostics::new();
    for raw in checks {
        let Some(check) = Check::parse(raw) else {
            diag.error(format!("check {:?}: unknown assertion", raw));
            continue;
        };
        if let Err(message) = check.evaluate(work_dir, max_bytes).await {
            warn!("{}", message);
            diag.error(message);
        }
    }
    diag
}

async fn move_file(from: &Path, to: &Path) -> std::io::Result<()> {
    match tokio::fs::rename(from, to).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Err(e),
        Err(_) => {
            // Different filesystems
            tokio::fs::copy(from, to).await?;
            tokio::fs::remove_file(from).await
        }
    }
}

/// Move KEEP outputs from the work directory into the problem directory
pub async fn keep_outputs(keep: &[String], work_dir: &Path, problem_dir: &Path) -> (Vec<String>, Diagnostics) {
    let mut kept = Vec::new();
    let mut diag = Diagnostics::new();

    for name in keep {
        let from = work_dir.join(name);
        if tokio::fs::symlink_metadata(&from).await.is_err() {
            diag.error(format!("keep {}: expected output was not produced", name));
            continue;
        }
        match move_file(&from, &problem_dir.join(name)).await {
            Ok(()) => {
                debug!("Kept {}", name);
                kept.push(name.clone());
            }
            Err(e) => diag.error(format!("keep {}: cannot move output: {}", name, e.kind())),
        }
    }
    (kept, diag)
}

async fn readable(path: &Path) -> bool {
    let Ok(mut file) = tokio::fs::File::open(path).await else {
        return false;
    };
    let mut probe = [0u8; 1];
    file.read(&mut probe).await.is_ok()
}

/// Display list for SHOW files, relative to the problem directory.
///
/// Files in `kept` are shown from the problem directory, anything else from
/// the work directory. Unreadable files are left out.
pub async fn show_files(
    show: &[String],
    kept: &[String],
    work_dir: &Path,
    work_dir_name: &str,
    problem_dir: &Path,
) -> Vec<String> {
    let mut shown = Vec::new();
    for name in show {
        let (path, display) = if kept.contains(name) {
            (problem_dir.join(name), name.clone())
        } else {
            (work_dir.join(name), format!("{}/{}", work_dir_name, name))
        };
        if readable(&path).await {
            shown.push(display);
        } else {
            debug!("Not showing unreadable {}", name);
        }
    }
    shown
}

/// Best-effort removal of staged requirement links
pub async fn remove_staged(work_dir: &Path, staged: &[String]) {
    for name in staged {
        let path = work_dir.join(name);
        match tokio::fs::symlink_metadata(&path).await {
            Ok(meta) if meta.file_type().is_symlink() => {
                let _ = tokio::fs::remove_file(&path).await;
            }
            _ => {}
        }
    }
    if !staged.is_empty() {
        info!("Removed {} staged links", staged.len());
    }
}
