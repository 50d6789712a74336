//! Template-driven build/run orchestration for judged submissions
//!
//! A (source, destination, condition) request is matched against template
//! files, the single feasible template is compiled into a shell script, and
//! the script runs detached while callers poll its progress.

pub mod compiler;
pub mod config;
pub mod core;
pub mod engine;
pub mod error;
pub mod finalizer;
pub mod options;
pub mod runner;
pub mod selector;
pub mod storage;
pub mod template;

pub use config::EngineConfig;
pub use engine::{BuildRequest, Engine, FinishReport};
pub use error::{Diagnostics, EngineError, Result};
pub use storage::{LocalStorage, Storage};
