use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde::Serialize;
use tokio::time::Duration;
use tracing::{info, warn};

use template_judge::core::{FileStatus, RunState};
use template_judge::selector::FileCaches;
use template_judge::{BuildRequest, Engine, EngineConfig, FinishReport, LocalStorage};

/// Poll interval between progress reports while waiting for the run
const POLL_WAIT_SECS: u64 = 5;

/// Report printed on stdout when the worker exits
#[derive(Debug, Serialize)]
struct WorkerReport {
    warnings: Vec<String>,
    errors: Vec<String>,
    state: RunState,
    files: BTreeMap<u32, FileStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    finish: Option<FinishReport>,
}

struct Args {
    problem_dir: PathBuf,
    src: String,
    des: String,
    condition: Option<String>,
}

fn parse_args() -> Result<Args> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let (problem_dir, src, des, condition) = match args.as_slice() {
        [p, s, d] => (p, s, d, None),
        [p, s, d, c] => (p, s, d, Some(c.clone())),
        _ => bail!("usage: template-judge <problem_dir> <src> <des> [condition]"),
    };
    let problem_dir = std::fs::canonicalize(problem_dir)
        .with_context(|| format!("Problem directory {} not found", problem_dir))?;
    Ok(Args {
        problem_dir,
        src: src.clone(),
        des: des.clone(),
        condition,
    })
}

/// Every regular file in the problem directory is a local requirement candidate
fn local_caches(problem_dir: &Path) -> Result<FileCaches> {
    let mut caches = FileCaches::new();
    for entry in std::fs::read_dir(problem_dir).context("Failed to list problem directory")? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            caches = caches.with_local(entry.file_name().to_string_lossy().into_owned(), problem_dir);
        }
    }
    Ok(caches)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("template_judge=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    dotenvy::dotenv().ok();

    let config = EngineConfig::from_env().context("Failed to load engine configuration")?;
    if config.roots.is_empty() {
        bail!("TEMPLATE_ROOTS is not set");
    }
    info!("Template roots: {:?}", config.roots);

    let args = parse_args()?;
    let allow_local_options = std::env::var("ALLOW_LOCAL_OPTIONS")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    let mut engine = Engine::new(config, Arc::new(LocalStorage::new()));
    let request = BuildRequest {
        src: args.src,
        des: args.des,
        condition: args.condition,
        allow_local_options,
        caches: local_caches(&args.problem_dir)?,
        problem_dir: args.problem_dir,
        uploaded: None,
    };

    let started = engine.start_build(request).await;
    for w in &started.warnings {
        warn!("{}", w);
    }

    let mut report = WorkerReport {
        warnings: started.warnings,
        errors: started.errors,
        state: RunState::NotStarted,
        files: BTreeMap::new(),
        finish: None,
    };

    if report.errors.is_empty() {
        let mut state = engine.poll_build(Duration::from_secs(POLL_WAIT_SECS)).await;
        while state == RunState::Running {
            info!("Build still {}", state);
            state = engine.poll_build(Duration::from_secs(POLL_WAIT_SECS)).await;
        }
        report.files = engine.file_statuses().cloned().unwrap_or_default();
        report.state = state;
        report.finish = Some(engine.finish_build().await);
    }

    println!("{}", serde_json::to_string_pretty(&report)?);

    let failed = !report.errors.is_empty()
        || !report.state.is_success()
        || report.finish.as_ref().is_some_and(|f| !f.errors.is_empty());
    if failed {
        std::process::exit(1);
    }
    Ok(())
}
