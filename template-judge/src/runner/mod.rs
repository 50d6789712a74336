//! Runner module - launches compiled scripts and follows their progress
//!
//! A run is observed by cooperative polling: every call reads the script's
//! stdout banner lines and the status files of tracked subprocesses, then
//! returns. Nothing waits on the process except the bounded startup check and
//! the caller-supplied completion wait.
//!
//! - `launch`: detached spawn and signalling
//! - `status`: status record parsing and exit-message taxonomy

pub mod launch;
pub mod status;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Child;
use std::sync::OnceLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::compiler::{RunMap, RunScript};
use crate::config::EngineConfig;
use crate::core::utils::{poll_until, Deadline};
use crate::core::{FileStatus, RunState};
use crate::error::Result;

/// Everything needed to pick a run back up in a later request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunHandle {
    pub work_dir: PathBuf,
    pub script_base: String,
    pub run_map: RunMap,
    pub pid: Option<i32>,
    /// Unix seconds at launch
    pub started_at: u64,
    /// Set once the run reached a terminal state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_state: Option<RunState>,
    /// Last known status per tracked line; exited entries are never re-read
    #[serde(default)]
    pub files: BTreeMap<u32, FileStatus>,
}

impl RunHandle {
    pub fn script_path(&self) -> PathBuf {
        self.work_dir.join(format!("{}.sh", self.script_base))
    }

    pub fn stdout_path(&self) -> PathBuf {
        self.work_dir.join(format!("{}.out", self.script_base))
    }

    pub fn stderr_path(&self) -> PathBuf {
        self.work_dir.join(format!("{}.err", self.script_base))
    }

    fn elapsed(&self) -> Duration {
        Duration::from_secs(unix_now().saturating_sub(self.started_at))
    }
}

/// Polling parameters, taken from the engine configuration
#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub shell: String,
    pub shell_timeout: Duration,
    pub startup_poll: Duration,
    pub completion_step: Duration,
    pub status_retry: Duration,
    pub status_retry_window: Duration,
    pub run_timeout: Option<Duration>,
}

impl From<&EngineConfig> for MonitorSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            shell: config.shell.clone(),
            shell_timeout: config.shell_timeout(),
            startup_poll: config.startup_poll(),
            completion_step: config.completion_step(),
            status_retry: config.status_retry(),
            status_retry_window: config.status_retry_window(),
            run_timeout: config.run_timeout(),
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn pid_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d+) PID$").expect("static regex"))
}

fn done_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"::(\d+) (-?\d+) DONE$").expect("static regex"))
}

/// Pid from the `<pid> PID` banner on the first stdout line
pub fn parse_pid_line(stdout: &str) -> Option<i32> {
    let first = stdout.lines().next()?;
    pid_re().captures(first.trim_end())?[1].parse().ok()
}

/// `(line, exit code)` from the trailing `::<n> <code> DONE` marker
pub fn parse_done_line(stdout: &str) -> Option<(u32, i32)> {
    let last = stdout.lines().rev().find(|l| !l.trim().is_empty())?;
    let caps = done_re().captures(last.trim_end())?;
    Some((caps[1].parse().ok()?, caps[2].parse().ok()?))
}

/// Read the pid from a leftover stdout file of an earlier run
pub async fn leftover_pid(stdout: &Path) -> Option<i32> {
    let text = tokio::fs::read_to_string(stdout).await.ok()?;
    parse_pid_line(&text)
}

/// State machine for one script run
#[derive(Debug)]
pub struct Monitor {
    handle: RunHandle,
    settings: MonitorSettings,
    child: Option<Child>,
    state: RunState,
}

impl Monitor {
    /// Write and launch `script` in `work_dir`, then wait for its PID banner
    pub async fn start(
        settings: MonitorSettings,
        work_dir: &Path,
        script_base: &str,
        script: &RunScript,
    ) -> Result<Self> {
        let mut handle = RunHandle {
            work_dir: work_dir.to_path_buf(),
            script_base: script_base.to_string(),
            run_map: script.run_map.clone(),
            pid: None,
            started_at: unix_now(),
            final_state: None,
            files: BTreeMap::new(),
        };
        tokio::fs::write(handle.script_path(), &script.text).await?;

        let mut child = launch::spawn_detached(
            &settings.shell,
            &handle.script_path(),
            work_dir,
            &handle.stdout_path(),
            &handle.stderr_path(),
        )?;

        let stdout = handle.stdout_path();
        let pid = poll_until(settings.shell_timeout, settings.startup_poll, || {
            let stdout = stdout.clone();
            async move {
                let text = tokio::fs::read_to_string(&stdout).await.ok()?;
                parse_pid_line(&text)
            }
        })
        .await;

        let state = match pid {
            Some(pid) => {
                info!("Script {} started with pid {}", script_base, pid);
                handle.pid = Some(pid);
                RunState::Running
            }
            None => {
                warn!("Script {} did not report its pid within {:?}", script_base, settings.shell_timeout);
                let _ = child.kill();
                let _ = child.try_wait();
                handle.final_state = Some(RunState::Died);
                RunState::Died
            }
        };

        Ok(Self {
            handle,
            settings,
            child: Some(child),
            state,
        })
    }

    /// Rebuild a monitor from a persisted handle
    pub fn resume(settings: MonitorSettings, handle: RunHandle) -> Self {
        let state = match (&handle.final_state, handle.pid) {
            (Some(done), _) => done.clone(),
            (None, Some(_)) => RunState::Running,
            (None, None) => RunState::Died,
        };
        Self {
            handle,
            settings,
            child: None,
            state,
        }
    }

    pub fn handle(&self) -> &RunHandle {
        &self.handle
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    /// Per-line status of tracked subprocesses
    pub fn files(&self) -> &BTreeMap<u32, FileStatus> {
        &self.handle.files
    }

    /// Number of tracked lines already recorded as exited
    pub fn terminal_files(&self) -> usize {
        self.handle.files.values().filter(|f| f.is_terminal()).count()
    }

    /// Observe the run, waiting up to `wait` for it to finish
    pub async fn poll(&mut self, wait: Duration) -> RunState {
        if self.state.is_terminal() {
            return self.state.clone();
        }

        let deadline = Deadline::after(wait);
        loop {
            self.observe().await;
            if self.state.is_terminal() || !deadline.tick(self.settings.completion_step).await {
                break;
            }
        }

        if self.state.is_terminal() {
            info!("Script {} finished: {}", self.handle.script_base, self.state);
            self.handle.final_state = Some(self.state.clone());
        }
        self.state.clone()
    }

    /// Best-effort kill, followed by one non-blocking poll
    pub async fn cancel(&mut self) -> RunState {
        if self.state.is_terminal() {
            return self.state.clone();
        }
        if let Some(pid) = self.handle.pid {
            info!("Killing script {} (pid {})", self.handle.script_base, pid);
            launch::kill_process(pid);
        }
        if let Some(child) = self.child.as_mut() {
            let _ = child.kill();
        }
        self.poll(Duration::ZERO).await
    }

    async fn observe(&mut self) {
        self.poll_files().await;

        let stdout_path = self.handle.stdout_path();
        let stdout = tokio::fs::read_to_string(&stdout_path).await.unwrap_or_default();
        if let Some((line, code)) = parse_done_line(&stdout) {
            // Records finished before the script exited; pick up late writes
            self.poll_files().await;
            self.complete(line, code);
            return;
        }

        if let Some(limit) = self.settings.run_timeout {
            if self.handle.elapsed() > limit {
                warn!("Script {} exceeded run timeout {:?}", self.handle.script_base, limit);
                if let Some(pid) = self.handle.pid {
                    launch::kill_process(pid);
                }
                self.state = RunState::TimedOut;
                return;
            }
        }

        if !self.alive() {
            // The marker may have landed between the first read and exit
            let stdout = tokio::fs::read_to_string(&stdout_path).await.unwrap_or_default();
            match parse_done_line(&stdout) {
                Some((line, code)) => {
                    self.poll_files().await;
                    self.complete(line, code);
                }
                None => self.state = RunState::Died,
            }
        }
    }

    fn alive(&mut self) -> bool {
        if let Some(child) = self.child.as_mut() {
            match child.try_wait() {
                Ok(Some(_)) => {
                    self.child = None;
                    return false;
                }
                Ok(None) => return true,
                Err(e) => debug!("try_wait failed: {}", e),
            }
        }
        self.handle.pid.is_some_and(launch::process_alive)
    }

    fn complete(&mut self, line: u32, exit_code: i32) {
        if exit_code == 0 {
            self.state = RunState::Succeeded;
            return;
        }
        let message = self
            .handle
            .files
            .get(&line)
            .filter(|f| f.is_terminal())
            .and_then(|f| f.message.clone())
            .or_else(|| status::exit_message(exit_code, None))
            .unwrap_or_else(|| format!("failed with exit code {}", exit_code));
        self.state = RunState::Failed {
            line,
            exit_code,
            message,
        };
    }

    /// Poll tracked status files, highest line first; terminal entries stay cached
    async fn poll_files(&mut self) {
        let entries: Vec<(u32, String)> = self
            .handle
            .run_map
            .iter()
            .rev()
            .map(|(line, file)| (*line, file.clone()))
            .collect();

        for (line, file) in entries {
            if self.handle.files.get(&line).is_some_and(FileStatus::is_terminal) {
                continue;
            }
            let path = self.handle.work_dir.join(&file);
            match status::read_status(&path, self.settings.status_retry, self.settings.status_retry_window).await {
                Some(record) => {
                    let status = FileStatus::from(&record);
                    if status.is_terminal() {
                        debug!("Line {} ({}) exited: {:?}", line, file, status.exit_code);
                    }
                    self.handle.files.insert(line, status);
                }
                None => {
                    self.handle.files.entry(line).or_insert_with(FileStatus::unavailable);
                }
            }
        }
    }
}
