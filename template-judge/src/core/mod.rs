pub mod state;
pub mod utils;

pub use state::{FileState, FileStatus, RunState};
pub use utils::Deadline;
