//! Detached script launch and signalling
//!
//! The script runs in its own session so it outlives the request that
//! started it. Its stdin is empty, stdout/stderr go to files, and no other
//! descriptor of ours survives the exec.

use std::fs::File;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Child, Command, Stdio};

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::sys::resource::{getrlimit, Resource};
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::{setsid, Pid};
use tracing::debug;

use crate::error::Result;

/// Highest descriptor we bother marking close-on-exec
const FD_SCAN_CAP: i32 = 4096;

/// Start `shell script` detached in `work_dir`
pub fn spawn_detached(shell: &str, script: &Path, work_dir: &Path, stdout: &Path, stderr: &Path) -> Result<Child> {
    let out = File::create(stdout)?;
    let err = File::create(stderr)?;

    let max_fd = getrlimit(Resource::RLIMIT_NOFILE)
        .map(|(soft, _)| soft.min(FD_SCAN_CAP as u64) as i32)
        .unwrap_or(1024);

    let mut cmd = Command::new(shell);
    cmd.arg(script)
        .current_dir(work_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::from(out))
        .stderr(Stdio::from(err));

    // SAFETY: only async-signal-safe calls (setsid, fcntl) run between fork and exec.
    unsafe {
        cmd.pre_exec(move || {
            let _ = setsid();
            for fd in 3..max_fd {
                if let Ok(flags) = fcntl(fd, FcntlArg::F_GETFD) {
                    let flags = FdFlag::from_bits_truncate(flags) | FdFlag::FD_CLOEXEC;
                    let _ = fcntl(fd, FcntlArg::F_SETFD(flags));
                }
            }
            Ok(())
        });
    }

    let child = cmd.spawn()?;
    debug!("Spawned script {:?} as pid {}", script.file_name(), child.id());
    Ok(child)
}

/// Best-effort SIGKILL to a process and its session group
pub fn kill_process(pid: i32) {
    if pid <= 1 {
        return;
    }
    let pid = Pid::from_raw(pid);
    let _ = killpg(pid, Signal::SIGKILL);
    let _ = kill(pid, Signal::SIGKILL);
}

/// Whether a process with this pid still exists
pub fn process_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}
