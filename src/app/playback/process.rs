use std::process::{Child, Command};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

#[cfg(unix)]
use std::os::unix::process::CommandExt;

/// Starts the player in its own process group with default signal handling,
/// so terminal signals aimed at us never reach it and it can be terminated
/// as a group.
#[cfg(unix)]
pub(crate) fn detach_process_group(cmd: &mut Command) {
    unsafe {
        cmd.pre_exec(|| {
            libc::signal(libc::SIGINT, libc::SIG_DFL);
            libc::signal(libc::SIGQUIT, libc::SIG_DFL);
            libc::signal(libc::SIGTERM, libc::SIG_DFL);
            if libc::setpgid(0, 0) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

#[cfg(not(unix))]
pub(crate) fn detach_process_group(_cmd: &mut Command) {}

/// Asks the child's process group to exit.
#[cfg(unix)]
pub(crate) fn request_terminate(child: &mut Child) -> Result<()> {
    let pgid = child.id() as libc::pid_t;
    let rc = unsafe { libc::kill(-pgid, libc::SIGTERM) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        // Group already gone.
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Ok(());
        }
        return Err(err).context("failed to signal player process group");
    }
    Ok(())
}

#[cfg(not(unix))]
pub(crate) fn request_terminate(child: &mut Child) -> Result<()> {
    child.kill().context("failed to terminate player")
}

/// Waits for the child to exit; `false` if it is still running at `deadline`.
pub(crate) fn wait_until(child: &mut Child, deadline: Duration) -> Result<bool> {
    let started = Instant::now();
    loop {
        if child
            .try_wait()
            .context("failed to poll player process")?
            .is_some()
        {
            return Ok(true);
        }
        if started.elapsed() >= deadline {
            return Ok(false);
        }
        thread::sleep(Duration::from_millis(25));
    }
}

/// Terminates and reaps the child, escalating to a hard kill.
pub(crate) fn shutdown(child: &mut Child, grace: Duration) -> Result<()> {
    if wait_until(child, grace)? {
        return Ok(());
    }
    if let Err(err) = request_terminate(child) {
        log::debug!("{err:#}");
    }
    if wait_until(child, grace)? {
        return Ok(());
    }
    log::warn!("player ignored termination request; killing it");
    let _ = child.kill();
    child.wait().context("failed waiting on player")?;
    Ok(())
}

/// Moves the child onto a worker thread that runs `farewell`, then shuts the
/// child down and reaps it. Returns at once; join the handle to wait.
pub(crate) fn reap_in_background<F>(
    mut child: Child,
    grace: Duration,
    farewell: F,
) -> JoinHandle<()>
where
    F: FnOnce() + Send + 'static,
{
    thread::spawn(move || {
        farewell();
        if let Err(err) = shutdown(&mut child, grace) {
            log::warn!("failed to stop player: {err:#}");
        }
    })
}

#[cfg(all(test, unix))]
mod tests {
    use std::process::Stdio;

    use super::*;

    #[test]
    fn exited_child_is_reaped_without_signals() {
        let mut child = Command::new("true").spawn().expect("spawn true");
        shutdown(&mut child, Duration::from_secs(2)).expect("shutdown");
        assert!(child.try_wait().expect("try_wait").is_some());
    }

    #[test]
    fn running_child_group_is_terminated() {
        let mut cmd = Command::new("sleep");
        cmd.arg("30").stdout(Stdio::null());
        detach_process_group(&mut cmd);
        let mut child = cmd.spawn().expect("spawn sleep");

        assert!(!wait_until(&mut child, Duration::from_millis(50)).expect("wait"));
        shutdown(&mut child, Duration::from_millis(200)).expect("shutdown");
        assert!(child.try_wait().expect("try_wait").is_some());
    }

    #[test]
    fn background_reap_returns_before_child_exits() {
        let mut cmd = Command::new("sleep");
        cmd.arg("30").stdout(Stdio::null());
        detach_process_group(&mut cmd);
        let child = cmd.spawn().expect("spawn sleep");
        let pid = child.id() as libc::pid_t;

        let started = Instant::now();
        let handle = reap_in_background(child, Duration::from_millis(300), || {});
        assert!(started.elapsed() < Duration::from_millis(100));

        handle.join().expect("reaper");
        let alive = unsafe { libc::kill(pid, 0) } == 0;
        assert!(!alive);
    }
}
