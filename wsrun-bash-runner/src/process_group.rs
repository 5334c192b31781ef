//! Process-group plumbing for spawned commands.
//!
//! Every background command is started in a fresh session (`setsid`) from a
//! `pre_exec` hook, which makes its pid double as the process-group id. All
//! signals are then delivered with `killpg` so grandchildren spawned by the
//! script are reached too.

use std::io;

/// Signal sent to a process group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillSignal {
    /// SIGTERM, the polite request.
    Term,
    /// SIGKILL, sent once the grace window has elapsed.
    Kill,
}

impl KillSignal {
    pub fn name(self) -> &'static str {
        match self {
            Self::Term => "TERM",
            Self::Kill => "KILL",
        }
    }

    #[cfg(unix)]
    fn as_nix(self) -> nix::sys::signal::Signal {
        match self {
            Self::Term => nix::sys::signal::Signal::SIGTERM,
            Self::Kill => nix::sys::signal::Signal::SIGKILL,
        }
    }
}

/// Start a new session so the child owns its process group and has no
/// controlling terminal.
///
/// Only async-signal-safe calls are made; meant for `pre_exec`.
#[cfg(unix)]
pub fn detach_from_tty() -> io::Result<()> {
    if unsafe { libc::setsid() } == -1 {
        let err = io::Error::last_os_error();
        // Already a session leader: a plain process group is enough.
        if err.raw_os_error() == Some(libc::EPERM) {
            if unsafe { libc::setpgid(0, 0) } == -1 {
                return Err(io::Error::last_os_error());
            }
            return Ok(());
        }
        return Err(err);
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn detach_from_tty() -> io::Result<()> {
    Ok(())
}

/// Ask the kernel to SIGTERM the child when the spawning process dies.
///
/// `parent_pid` is captured before fork; if the parent already went away
/// between fork and exec the child terminates itself.
#[cfg(target_os = "linux")]
pub fn set_parent_death_signal(parent_pid: libc::pid_t) -> io::Result<()> {
    if unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) } == -1 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::getppid() } != parent_pid {
        unsafe {
            libc::raise(libc::SIGTERM);
        }
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn set_parent_death_signal(_parent_pid: i32) -> io::Result<()> {
    Ok(())
}

/// Deliver `signal` to every process in `process_group_id`.
///
/// A group that no longer exists (ESRCH) is not an error.
#[cfg(unix)]
pub fn signal_process_group(process_group_id: u32, signal: KillSignal) -> io::Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    let pgid = i32::try_from(process_group_id)
        .map_err(|_| io::Error::other(format!("invalid process group id {process_group_id}")))?;
    match killpg(Pid::from_raw(pgid), signal.as_nix()) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(errno) => Err(io::Error::from_raw_os_error(errno as i32)),
    }
}

#[cfg(not(unix))]
pub fn signal_process_group(_process_group_id: u32, _signal: KillSignal) -> io::Result<()> {
    Ok(())
}
