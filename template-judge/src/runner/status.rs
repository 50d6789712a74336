//! Status record parser
//!
//! The sandboxed-execution helper writes one line of 17 whitespace-separated
//! fields per tracked subprocess. Field 0 and field 16 carry the same token;
//! a mismatch means the record was caught mid-write.

use std::path::Path;
use std::time::Duration;

use tracing::debug;

use crate::core::utils::poll_until;
use crate::core::{FileState, FileStatus};

pub const FIELD_COUNT: usize = 17;

const STATE: usize = 1;
const MEMORY: usize = 4;
const OUTPUT_SIZE: usize = 7;
const EXIT_CODE: usize = 11;
const SIGNAL: usize = 12;
const USER_TIME: usize = 13;
const SYS_TIME: usize = 14;

/// Parsed status record
#[derive(Debug, Clone, PartialEq)]
pub struct StatusRecord {
    pub running: bool,
    /// user + system CPU seconds
    pub cpu_time: f64,
    pub memory: u64,
    pub output_size: u64,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
}

/// Parse a status record, `None` if it is malformed or torn
pub fn parse_status_record(content: &str) -> Option<StatusRecord> {
    let fields: Vec<&str> = content.split_whitespace().collect();
    if fields.len() != FIELD_COUNT || fields[0] != fields[FIELD_COUNT - 1] {
        return None;
    }

    let num = |idx: usize| fields[idx].parse::<f64>().unwrap_or(0.0);
    let int = |idx: usize| fields[idx].parse::<i32>().ok();

    let mut record = StatusRecord {
        running: fields[STATE] == "R",
        cpu_time: num(USER_TIME) + num(SYS_TIME),
        memory: fields[MEMORY].parse().unwrap_or(0),
        output_size: fields[OUTPUT_SIZE].parse().unwrap_or(0),
        exit_code: int(EXIT_CODE),
        signal: int(SIGNAL).filter(|&s| s > 0),
    };

    // A signal-terminated process reads as exited with 128 + signal
    if !record.running {
        if let Some(sig) = record.signal {
            record.exit_code = Some(128 + sig);
        }
    }
    Some(record)
}

/// Resource use measured by a status record
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Usage {
    pub cpu_time: f64,
    pub output_size: u64,
}

/// Human-readable reason for a non-zero exit code, `None` on success.
///
/// Limit messages quote `usage` only when a record measured it.
pub fn exit_message(exit_code: i32, usage: Option<Usage>) -> Option<String> {
    let msg = match (exit_code, usage) {
        (0, _) => return None,
        (126, _) => "command found but could not be executed".to_string(),
        (127, _) => "command not found".to_string(),
        (128, _) => "invalid argument to exit".to_string(),
        (152, Some(u)) => format!("exceeded CPU time limit ({:.3} seconds used)", u.cpu_time),
        (152, None) => "exceeded CPU time limit".to_string(),
        (153, Some(u)) => format!("exceeded output size limit ({} bytes written)", u.output_size),
        (153, None) => "exceeded output size limit".to_string(),
        (129, _) => "terminated by hangup signal".to_string(),
        (130, _) => "terminated by interrupt signal".to_string(),
        (131, _) => "terminated by quit signal".to_string(),
        (134, _) => "terminated by abort signal".to_string(),
        (136, _) => "terminated by floating point exception".to_string(),
        (137, _) => "terminated by kill signal".to_string(),
        (135 | 138 | 139, _) => "terminated by memory access violation".to_string(),
        (141, _) => "terminated by write to a broken pipe".to_string(),
        (142, _) => "terminated by alarm signal".to_string(),
        (143, _) => "terminated by terminate signal".to_string(),
        (code, _) => format!("failed with exit code {}", code),
    };
    Some(msg)
}

impl From<&StatusRecord> for FileStatus {
    fn from(record: &StatusRecord) -> Self {
        let cpu_time = format!("{:.3}", record.cpu_time);
        if record.running {
            return FileStatus {
                state: FileState::Running,
                cpu_time,
                exit_code: None,
                signal: None,
                message: None,
            };
        }
        let code = record.exit_code.unwrap_or(0);
        FileStatus {
            state: FileState::Exited,
            cpu_time,
            exit_code: Some(code),
            signal: record.signal,
            message: exit_message(
                code,
                Some(Usage {
                    cpu_time: record.cpu_time,
                    output_size: record.output_size,
                }),
            ),
        }
    }
}

/// Read a status file, retrying torn records.
///
/// A missing file is reported as unavailable at once; a malformed one is
/// retried every `retry` until `window` runs out.
pub async fn read_status(path: &Path, retry: Duration, window: Duration) -> Option<StatusRecord> {
    enum Probe {
        Missing,
        Record(StatusRecord),
    }

    let outcome = poll_until(window, retry, || async move {
        match tokio::fs::read_to_string(path).await {
            Ok(content) => parse_status_record(&content).map(Probe::Record),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Some(Probe::Missing),
            Err(_) => None,
        }
    })
    .await;

    match outcome {
        Some(Probe::Record(record)) => Some(record),
        Some(Probe::Missing) => None,
        None => {
            debug!("Status record {:?} unavailable after retries", path.file_name());
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(token: &str, state: &str, exit: &str, sig: &str, user: &str, sys: &str) -> String {
        format!(
            "{} {} 10.0 0.5 2048 0 0 300 0 0 0 {} {} {} {} 0 {}\n",
            token, state, exit, sig, user, sys, token
        )
    }

    #[test]
    fn test_parse_exited() {
        let r = parse_status_record(&record("T1", "E", "0", "0", "0.120", "0.030")).unwrap();
        assert!(!r.running);
        assert_eq!(r.exit_code, Some(0));
        assert_eq!(r.signal, None);
        assert!((r.cpu_time - 0.150).abs() < 1e-9);
        assert_eq!(r.output_size, 300);
        assert_eq!(r.memory, 2048);
    }

    #[test]
    fn test_signal_remapped() {
        let r = parse_status_record(&record("T1", "S", "0", "9", "0", "0")).unwrap();
        assert_eq!(r.exit_code, Some(137));
        let status = FileStatus::from(&r);
        assert_eq!(status.state, FileState::Exited);
        assert_eq!(status.message.as_deref(), Some("terminated by kill signal"));
    }

    #[test]
    fn test_torn_record_rejected() {
        let mut torn = record("T1", "R", "0", "0", "0", "0");
        torn = torn.replacen("T1\n", "T2\n", 1);
        assert!(parse_status_record(&torn).is_none());
        assert!(parse_status_record("T1 R 0").is_none());
    }

    #[test]
    fn test_exit_messages() {
        let used = Some(Usage {
            cpu_time: 1.5,
            output_size: 4096,
        });
        assert_eq!(exit_message(0, used), None);
        assert!(exit_message(152, used).unwrap().contains("CPU time limit"));
        assert!(exit_message(152, used).unwrap().contains("1.500"));
        assert!(exit_message(153, used).unwrap().contains("4096"));
        assert_eq!(exit_message(137, None).unwrap(), "terminated by kill signal");
        assert_eq!(exit_message(139, None).unwrap(), "terminated by memory access violation");
        assert_eq!(exit_message(3, None).unwrap(), "failed with exit code 3");
    }

    #[test]
    fn test_limit_messages_without_measurement() {
        assert_eq!(exit_message(152, None).unwrap(), "exceeded CPU time limit");
        assert_eq!(exit_message(153, None).unwrap(), "exceeded output size limit");
    }

    #[tokio::test]
    async fn test_read_missing_is_immediate() {
        let dir = tempfile::tempdir().unwrap();
        let start = std::time::Instant::now();
        let got = read_status(
            &dir.path().join("nope.stat"),
            Duration::from_millis(10),
            Duration::from_secs(2),
        )
        .await;
        assert!(got.is_none());
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_read_torn_retries_then_gives_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.stat");
        std::fs::write(&path, "A R 1 2 3").unwrap();
        let start = std::time::Instant::now();
        let got = read_status(&path, Duration::from_millis(10), Duration::from_millis(100)).await;
        assert!(got.is_none());
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_read_valid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.stat");
        std::fs::write(&path, record("Q", "E", "1", "0", "0.5", "0.25")).unwrap();
        let got = read_status(&path, Duration::from_millis(10), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(got.exit_code, Some(1));
    }
}
