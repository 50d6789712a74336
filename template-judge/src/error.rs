//! Engine error taxonomy and collected diagnostics

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

/// Fatal errors raised by the build engine
#[derive(Error, Debug)]
pub enum EngineError {
    /// Bad template or option file, no feasible or ambiguous control
    #[error("{0}")]
    Config(String),

    /// A file required by the only feasible plan is absent
    #[error("{0}")]
    Requirement(String),

    /// One or more CHECKS assertions failed
    #[error("{0}")]
    Check(String),

    /// One or more KEEP outputs could not be moved
    #[error("{0}")]
    Keep(String),

    /// Storage collaborator failure
    #[error("storage error: {0}")]
    Storage(String),

    /// Operation not valid in the current run state
    #[error("{0}")]
    State(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Non-fatal warnings and independent errors collected during an operation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Diagnostics {
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    pub fn extend(&mut self, other: Diagnostics) {
        self.warnings.extend(other.warnings);
        self.errors.extend(other.errors);
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Remove absolute root prefixes from every collected message
    pub fn scrub(mut self, roots: &[PathBuf]) -> Self {
        for message in self.warnings.iter_mut().chain(self.errors.iter_mut()) {
            *message = scrub(message, roots);
        }
        self
    }
}

/// Replace every occurrence of a data root directory in `message`.
///
/// `<root>/template/x.tmpl` becomes `template/x.tmpl`.
pub fn scrub(message: &str, roots: &[PathBuf]) -> String {
    let mut out = message.to_string();
    for root in roots {
        let root = root.to_string_lossy();
        if root.is_empty() || root == "/" {
            continue;
        }
        let with_slash = format!("{}/", root.trim_end_matches('/'));
        out = out.replace(&with_slash, "");
        out = out.replace(root.as_ref(), ".");
    }
    out
}

/// Render `path` relative to `base` when possible, for user-facing messages
pub fn relative(path: &Path, base: &Path) -> String {
    path.strip_prefix(base)
        .unwrap_or(path)
        .to_string_lossy()
        .into_owned()
}
