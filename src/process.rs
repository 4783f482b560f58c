use std::env;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::{Child, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::config;

const POLL_STEP: Duration = Duration::from_millis(20);

/// Resolve a program name the way a shell would. Names containing a slash
/// are taken as paths.
pub fn find_program(name: &str) -> Option<PathBuf> {
    if name.contains('/') {
        let path = PathBuf::from(name);
        return is_executable(&path).then_some(path);
    }
    let paths = env::var_os("PATH")?;
    env::split_paths(&paths)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Stderr for a child process: appended to `<data>/logs/<name>.log`, or
/// discarded when the log cannot be opened.
pub fn log_stdio(name: &str) -> Stdio {
    let dir = config::log_dir();
    let _ = fs::create_dir_all(&dir);
    let path = dir.join(format!("{}.log", name));
    match File::options().create(true).append(true).open(&path) {
        Ok(file) => Stdio::from(file),
        Err(e) => {
            debug!("cannot open {}: {}", path.display(), e);
            Stdio::null()
        }
    }
}

pub fn wait_timeout(child: &mut Child, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(_)) => return true,
            Ok(None) => {}
            Err(e) => {
                debug!("try_wait failed for pid {}: {}", child.id(), e);
                return true;
            }
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        thread::sleep(POLL_STEP.min(deadline - now));
    }
}

pub fn send_sigterm(child: &Child) {
    // SAFETY: plain kill(2) on the pid of a child we have not reaped yet.
    let rc = unsafe { libc::kill(child.id() as libc::pid_t, libc::SIGTERM) };
    if rc != 0 {
        debug!("SIGTERM to {} failed: {}", child.id(), std::io::Error::last_os_error());
    }
}

/// Escalating shutdown: SIGTERM, wait `term_grace`, SIGKILL, wait
/// `kill_grace`. The caller closes the child's stdin first when it has one.
pub fn terminate(child: &mut Child, term_grace: Duration, kill_grace: Duration) {
    if wait_timeout(child, Duration::ZERO) {
        return;
    }
    send_sigterm(child);
    if wait_timeout(child, term_grace) {
        return;
    }
    warn!("pid {} ignored SIGTERM, killing", child.id());
    let _ = child.kill();
    if !wait_timeout(child, kill_grace) {
        warn!("pid {} still running after SIGKILL", child.id());
    }
}
