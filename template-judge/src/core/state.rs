//! Run state of a build and of each tracked subprocess

use std::fmt;

use serde::{Deserialize, Serialize};

/// State of a whole script run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunState {
    NotStarted,
    Running,
    Succeeded,
    Failed {
        line: u32,
        exit_code: i32,
        message: String,
    },
    /// The script vanished without reporting completion
    Died,
    /// The run exceeded its wall-clock limit and was killed
    TimedOut,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunState::NotStarted | RunState::Running)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RunState::Succeeded)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::NotStarted => write!(f, "not started"),
            RunState::Running => write!(f, "running"),
            RunState::Succeeded => write!(f, "succeeded"),
            RunState::Failed { line, message, .. } => write!(f, "line {}: {}", line, message),
            RunState::Died => write!(f, "died unexpectedly"),
            RunState::TimedOut => write!(f, "timed out"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileState {
    /// No readable status record yet
    Unavailable,
    Running,
    Exited,
}

/// Progress of one status-file-tracked subprocess
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileStatus {
    pub state: FileState,
    /// user + system CPU seconds, 3 decimals
    pub cpu_time: String,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub message: Option<String>,
}

impl FileStatus {
    pub fn unavailable() -> Self {
        Self {
            state: FileState::Unavailable,
            cpu_time: "0.000".to_string(),
            exit_code: None,
            signal: None,
            message: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state == FileState::Exited
    }

    pub fn is_success(&self) -> bool {
        self.state == FileState::Exited && self.exit_code == Some(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(!RunState::NotStarted.is_terminal());
        assert!(!RunState::Running.is_terminal());
        assert!(RunState::Succeeded.is_terminal());
        assert!(RunState::Died.is_terminal());
        assert!(RunState::TimedOut.is_terminal());
    }

    #[test]
    fn test_serialized_form() {
        let state = RunState::Failed {
            line: 2,
            exit_code: 1,
            message: "failed with exit code 1".into(),
        };
        let json = serde_json::to_string(&state).unwrap();
        assert_eq!(
            json,
            r#"{"state":"failed","line":2,"exit_code":1,"message":"failed with exit code 1"}"#
        );
        assert_eq!(state.to_string(), "line 2: failed with exit code 1");
    }
}
