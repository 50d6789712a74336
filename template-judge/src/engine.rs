//! Build engine - start, poll and finish template-driven builds
//!
//! The engine owns the lazily loaded template catalog and option schema plus
//! at most one active build. A build outlives the process that started it:
//! its session is written next to the script and can be resumed later.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::compiler::compile;
use crate::config::EngineConfig;
use crate::core::{FileStatus, RunState};
use crate::error::{relative, Diagnostics, EngineError, Result};
use crate::finalizer;
use crate::options::{load_overrides, OptionSchema};
use crate::runner::{launch, leftover_pid, Monitor, MonitorSettings, RunHandle};
use crate::selector::{select_control, Candidate, Control, FileCaches};
use crate::storage::Storage;
use crate::template::{split_name, TemplateCatalog, TemplatePattern};

/// Base name of the generated script and its monitor files
pub const SCRIPT_BASE: &str = "+run+";

/// Everything needed to start a build
#[derive(Debug, Clone, Default)]
pub struct BuildRequest {
    pub src: String,
    pub des: String,
    pub condition: Option<String>,
    /// Apply `<problem_dir>/<problem>.options` overrides
    pub allow_local_options: bool,
    pub problem_dir: PathBuf,
    /// Uploaded `(file name, contents)`, placed in the work directory
    pub uploaded: Option<(String, Vec<u8>)>,
    pub caches: FileCaches,
}

/// Outcome of finishing a build
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FinishReport {
    pub kept: Vec<String>,
    pub shown: Vec<String>,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

/// Persisted build session, `<work>/+run+.run`
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Session {
    problem_dir: PathBuf,
    control: Control,
    staged: Vec<String>,
    handle: RunHandle,
}

#[derive(Debug)]
struct ActiveBuild {
    problem_dir: PathBuf,
    control: Control,
    staged: Vec<String>,
    monitor: Monitor,
}

impl ActiveBuild {
    fn session(&self) -> Session {
        Session {
            problem_dir: self.problem_dir.clone(),
            control: self.control.clone(),
            staged: self.staged.clone(),
            handle: self.monitor.handle().clone(),
        }
    }
}

pub struct Engine {
    config: EngineConfig,
    storage: Arc<dyn Storage>,
    catalog: Option<TemplateCatalog>,
    schema: Option<OptionSchema>,
    build: Option<ActiveBuild>,
}

impl Engine {
    pub fn new(config: EngineConfig, storage: Arc<dyn Storage>) -> Self {
        Self {
            config,
            storage,
            catalog: None,
            schema: None,
            build: None,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Drop cached templates and option schema; they reload on next use
    pub fn invalidate(&mut self) {
        info!("Invalidating template and option caches");
        self.catalog = None;
        self.schema = None;
    }

    fn work_dir(&self, problem_dir: &Path) -> PathBuf {
        problem_dir.join(&self.config.work_dir_name)
    }

    fn session_path(work_dir: &Path) -> PathBuf {
        work_dir.join(format!("{}.run", SCRIPT_BASE))
    }

    async fn catalog(&mut self) -> Result<&mut TemplateCatalog> {
        if self.catalog.is_none() {
            let catalog = TemplateCatalog::load(self.storage.as_ref(), &self.config.roots).await?;
            self.catalog = Some(catalog);
        }
        self.catalog
            .as_mut()
            .ok_or_else(|| EngineError::State("template catalog unavailable".to_string()))
    }

    async fn schema(&mut self) -> Result<&OptionSchema> {
        if self.schema.is_none() {
            let schema = OptionSchema::load(self.storage.as_ref(), &self.config.roots).await?;
            self.schema = Some(schema);
        }
        self.schema
            .as_ref()
            .ok_or_else(|| EngineError::State("option schema unavailable".to_string()))
    }

    /// Start a build. Fatal problems come back as errors, never as a panic.
    pub async fn start_build(&mut self, request: BuildRequest) -> Diagnostics {
        let mut diag = Diagnostics::new();
        if let Err(e) = self.try_start(request, &mut diag).await {
            error!("Build start failed: {}", crate::error::scrub(&e.to_string(), &self.config.roots));
            diag.error(e.to_string());
        }
        diag.scrub(&self.config.roots)
    }

    async fn try_start(&mut self, request: BuildRequest, diag: &mut Diagnostics) -> Result<()> {
        let problem = request
            .problem_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| EngineError::Config("problem directory has no name".to_string()))?;
        let names = format!("{}:{}", request.src, request.des);
        let condition = request.condition.clone().unwrap_or_default();
        let work_dir = self.work_dir(&request.problem_dir);

        let candidates = self.candidates(&names, &condition, &problem).await?;

        let mut caches = request.caches.clone();
        if let Some((name, _)) = &request.uploaded {
            validate_upload_name(name)?;
            caches.local.insert(name.clone(), work_dir.clone());
        }
        let control = select_control(candidates, &caches, &names)?;

        let overrides = if request.allow_local_options {
            let rel = format!("{}.options", problem);
            load_overrides(self.storage.as_ref(), &request.problem_dir.join(&rel), &rel).await?
        } else {
            BTreeMap::new()
        };
        // Options without a usable value are reported and left out
        let (substitutions, option_diag) = self.schema().await?.resolve(&overrides);
        diag.extend(option_diag);

        let script = compile(&control.body.commands, &substitutions);
        debug!("Compiled {} command lines, {} tracked status files", script.lines, script.run_map.len());

        self.reset_work_dir(&work_dir).await?;

        if let Some((name, bytes)) = &request.uploaded {
            tokio::fs::write(work_dir.join(name), bytes).await?;
        }
        let staged = stage_requirements(&control, &work_dir, &request.problem_dir).await?;

        let monitor = Monitor::start(MonitorSettings::from(&self.config), &work_dir, SCRIPT_BASE, &script).await?;
        let build = ActiveBuild {
            problem_dir: request.problem_dir.clone(),
            control,
            staged,
            monitor,
        };
        self.persist(&build).await?;
        self.build = Some(build);
        Ok(())
    }

    /// Matched and substituted candidates for `names` under `condition`
    async fn candidates(&mut self, names: &str, condition: &str, problem: &str) -> Result<Vec<Candidate>> {
        let storage = self.storage.clone();
        let catalog = self.catalog().await?;
        let template_names: Vec<String> = catalog.names().map(str::to_string).collect();

        let mut candidates = Vec::new();
        for name in template_names {
            let Some((src, des, cond)) = split_name(&name) else {
                continue;
            };
            if cond != condition {
                continue;
            }
            let pattern = TemplatePattern::new(&format!("{}:{}", src, des), problem)
                .map_err(|e| EngineError::Config(format!("template {}: bad pattern: {}", name, e)))?;
            let Some(bindings) = pattern.matches(names) else {
                continue;
            };
            let template = catalog.get(storage.as_ref(), &name).await?;
            let body = template.substitute(&bindings).map_err(EngineError::Config)?;
            debug!("Template {} matches {} with {:?}", name, names, bindings);
            candidates.push(Candidate {
                template,
                bindings,
                body,
            });
        }
        Ok(candidates)
    }

    /// Kill whatever a previous run left behind, then recreate the work directory
    async fn reset_work_dir(&mut self, work_dir: &Path) -> Result<()> {
        if let Some(mut previous) = self.build.take() {
            if previous.monitor.handle().work_dir == work_dir {
                previous.monitor.cancel().await;
            }
        }
        let stdout = work_dir.join(format!("{}.out", SCRIPT_BASE));
        if let Some(pid) = leftover_pid(&stdout).await {
            info!("Killing leftover run (pid {})", pid);
            launch::kill_process(pid);
        }

        match tokio::fs::remove_dir_all(work_dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        tokio::fs::create_dir_all(work_dir).await?;
        Ok(())
    }

    async fn persist(&self, build: &ActiveBuild) -> Result<()> {
        let data = serde_json::to_vec_pretty(&build.session())
            .map_err(|e| EngineError::Storage(format!("encode session: {}", e)))?;
        self.storage
            .write(&Self::session_path(&build.monitor.handle().work_dir), &data)
            .await
    }

    /// Reattach to a build started by an earlier invocation
    pub async fn resume(&mut self, problem_dir: &Path) -> Result<RunState> {
        let path = Self::session_path(&self.work_dir(problem_dir));
        let data = self
            .storage
            .read(&path)
            .await?
            .ok_or_else(|| EngineError::State("no build session to resume".to_string()))?;
        let session: Session = serde_json::from_slice(&data)
            .map_err(|e| EngineError::State(format!("corrupt build session: {}", e)))?;

        let monitor = Monitor::resume(MonitorSettings::from(&self.config), session.handle);
        let state = monitor.state().clone();
        info!("Resumed build of {} ({})", session.control.template, state);
        self.build = Some(ActiveBuild {
            problem_dir: session.problem_dir,
            control: session.control,
            staged: session.staged,
            monitor,
        });
        Ok(state)
    }

    /// Observe the active build, waiting up to `wait` for it to finish
    pub async fn poll_build(&mut self, wait: Duration) -> RunState {
        let Some(build) = self.build.as_mut() else {
            return RunState::NotStarted;
        };
        let was_terminal = build.monitor.state().is_terminal();
        let exited_before = build.monitor.terminal_files();
        let state = build.monitor.poll(wait).await;
        let exited_now = build.monitor.terminal_files();

        if (state.is_terminal() && !was_terminal) || exited_now > exited_before {
            if let Some(build) = self.build.as_ref() {
                if let Err(e) = self.persist(build).await {
                    warn!("Could not record build progress: {}", e);
                }
            }
        }
        state
    }

    /// Best-effort kill of the active build; poll again to see it end
    pub async fn cancel_build(&mut self) -> RunState {
        match self.build.as_mut() {
            Some(build) => build.monitor.cancel().await,
            None => RunState::NotStarted,
        }
    }

    /// Status of tracked subprocesses of the active build, by line
    pub fn file_statuses(&self) -> Option<&BTreeMap<u32, FileStatus>> {
        self.build.as_ref().map(|b| b.monitor.files())
    }

    /// Run CHECKS, move KEEP outputs and list SHOW files of a finished build
    pub async fn finish_build(&mut self) -> FinishReport {
        let mut diag = Diagnostics::new();
        let current = self.build.as_ref().map(|b| b.monitor.state().clone());
        let report = match current {
            None => {
                diag.error(EngineError::State("no build to finish".to_string()).to_string());
                FinishReport::default()
            }
            Some(state) if !state.is_terminal() => {
                diag.error(EngineError::State("build is still running".to_string()).to_string());
                FinishReport::default()
            }
            Some(state) => match self.build.take() {
                Some(build) => self.finalize(build, &state, &mut diag).await,
                None => FinishReport::default(),
            },
        };

        let diag = diag.scrub(&self.config.roots);
        FinishReport {
            warnings: diag.warnings,
            errors: diag.errors,
            ..report
        }
    }

    async fn finalize(&self, build: ActiveBuild, state: &RunState, diag: &mut Diagnostics) -> FinishReport {
        let work_dir = build.monitor.handle().work_dir.clone();
        let body = &build.control.body;
        let mut kept = Vec::new();

        if state.is_success() {
            let checks = finalizer::run_checks(&body.checks, &work_dir, self.config.max_success_file_bytes).await;
            let checks_failed = checks.has_errors();
            diag.extend(checks);
            if checks_failed {
                diag.error(EngineError::Check(format!("{}: checks failed, outputs not kept", build.control.template)).to_string());
            } else {
                let (moved, keep_diag) = finalizer::keep_outputs(&body.keep, &work_dir, &build.problem_dir).await;
                kept = moved;
                diag.extend(keep_diag);
            }
        } else {
            diag.error(format!("{}: build {}", build.control.template, state));
        }

        let shown = finalizer::show_files(&body.show, &kept, &work_dir, &self.config.work_dir_name, &build.problem_dir).await;
        finalizer::remove_staged(&work_dir, &build.staged).await;

        info!(
            "Finished build with {}: kept {:?}, {} errors",
            build.control.template,
            kept,
            diag.errors.len()
        );
        FinishReport {
            kept,
            shown,
            ..FinishReport::default()
        }
    }
}

fn validate_upload_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains('/') || name == "." || name == ".." || name.starts_with(SCRIPT_BASE) {
        return Err(EngineError::Requirement(format!("invalid uploaded file name {:?}", name)));
    }
    Ok(())
}

/// Link every located requirement into the work directory
async fn stage_requirements(control: &Control, work_dir: &Path, problem_dir: &Path) -> Result<Vec<String>> {
    let mut staged = Vec::new();
    for file in control.local_required.iter().chain(&control.remote_required) {
        if file.dir == work_dir {
            continue;
        }
        let target = file.dir.join(&file.name);
        if tokio::fs::metadata(&target).await.is_err() {
            return Err(EngineError::Requirement(format!(
                "required file {} is missing from {}",
                file.name,
                relative(&file.dir, problem_dir)
            )));
        }
        tokio::fs::symlink(&target, work_dir.join(&file.name)).await?;
        staged.push(file.name.clone());
    }
    Ok(staged)
}
