// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! Spawning and supervising the mount/umount helper processes.

use std::ffi::OsString;
use std::io::{BufRead, BufReader};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::Context as _;
use nix::sys::wait::{waitid, Id, WaitPidFlag, WaitStatus};
use rustix::process::{Pid, PidfdFlags, Signal};
use tracing::{debug, trace};

const HELPER_PATH_ENV: &str = "/usr/sbin:/usr/bin:/sbin:/bin";

/// How a helper process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildExit {
    Exited { status: i32 },
    Signaled { signal: i32, core_dumped: bool },
}

impl ChildExit {
    pub fn is_clean(&self) -> bool {
        matches!(self, ChildExit::Exited { status: 0 })
    }
}

/// A helper process being watched through its pidfd.
///
/// The helper stays in the manager's process group; the kernel autofs layer
/// will not submit a second request while a process of the triggering group
/// still has the first one open.
pub struct ChildHandle {
    pid: Pid,
    pidfd: OwnedFd,
    outputs: Vec<BufReader<mio::unix::pipe::Receiver>>,
}

impl ChildHandle {
    pub fn pid_raw(&self) -> i32 {
        self.pid.as_raw_nonzero().get()
    }

    pub fn pidfd(&self) -> BorrowedFd<'_> {
        self.pidfd.as_fd()
    }

    /// Re-attaches to a pid we spawned before an exec, for coldplug. Fails
    /// if the process is gone already.
    pub fn watch_existing(pid: i32) -> anyhow::Result<Self> {
        let pid = Pid::from_raw(pid).context("invalid pid")?;
        let pidfd = rustix::process::pidfd_open(pid, PidfdFlags::empty())
            .context("pidfd_open")?;

        Ok(Self { pid, pidfd, outputs: Vec::new() })
    }

    pub fn register(
        &mut self,
        registry: &mio::Registry,
        token: mio::Token,
    ) -> anyhow::Result<()> {
        registry.register(
            &mut mio::unix::SourceFd(&self.pidfd.as_raw_fd()),
            token,
            mio::Interest::READABLE,
        )?;

        for output in &mut self.outputs {
            registry.register(output.get_mut(), token, mio::Interest::READABLE)?;
        }

        Ok(())
    }

    pub fn deregister(&mut self, registry: &mio::Registry) {
        let _ = registry.deregister(&mut mio::unix::SourceFd(&self.pidfd.as_raw_fd()));
        for output in &mut self.outputs {
            let _ = registry.deregister(output.get_mut());
        }
    }

    pub fn signal(&self, signal: Signal) -> anyhow::Result<()> {
        debug!(?signal, pid = self.pid_raw(), "signaling helper");

        rustix::process::pidfd_send_signal(&self.pidfd, signal).context("pidfd_send_signal")?;
        Ok(())
    }

    /// Non-blocking reap. Returns None while the helper is still running.
    pub fn try_reap(&self) -> anyhow::Result<Option<ChildExit>> {
        let status = waitid(
            Id::PIDFd(self.pidfd.as_fd()),
            WaitPidFlag::WEXITED | WaitPidFlag::WNOHANG,
        )
        .context("waitid")?;

        match status {
            WaitStatus::StillAlive => Ok(None),
            WaitStatus::Exited(_, status) => Ok(Some(ChildExit::Exited { status })),
            WaitStatus::Signaled(_, signal, core_dumped) => Ok(Some(ChildExit::Signaled {
                signal: signal as i32,
                core_dumped,
            })),
            other => unreachable!("unexpected wait status for helper: {:?}", other),
        }
    }

    /// Forwards any buffered helper output to the trace log.
    pub fn drain_output(&mut self, unit: &str) {
        for output in &mut self.outputs {
            let mut buf = String::new();
            loop {
                buf.clear();
                match output.read_line(&mut buf) {
                    Ok(0) => break,
                    Ok(_) => {
                        let line = buf.trim();
                        if !line.is_empty() {
                            trace!(target: "mountd::helper", unit, "{}", line);
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        debug!(unit, "helper output error: {:?}", e);
                        break;
                    }
                }
            }
        }
    }
}

/// Spawns a helper binary with a clean environment. The child inherits our
/// process group (no setsid): see the note on [`ChildHandle`].
pub fn spawn_helper(
    exe: &Path,
    args: &[OsString],
    stdio_null: bool,
) -> anyhow::Result<ChildHandle> {
    debug!(exe = %exe.display(), ?args, "spawning helper");

    let mut command = std::process::Command::new(exe);
    command
        .args(args)
        .env_clear()
        .env("PATH", HELPER_PATH_ENV)
        .stdin(Stdio::null());

    if stdio_null {
        command.stdout(Stdio::null()).stderr(Stdio::null());
    } else {
        command.stdout(Stdio::piped()).stderr(Stdio::piped());
    }

    let mut child = command
        .spawn()
        .with_context(|| format!("spawning {}", exe.display()))?;

    let mut outputs = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        outputs.push(BufReader::new(mio::unix::pipe::Receiver::from(stdout)));
    }
    if let Some(stderr) = child.stderr.take() {
        outputs.push(BufReader::new(mio::unix::pipe::Receiver::from(stderr)));
    }

    let pid = Pid::from_raw(child.id() as i32).context("invalid child pid")?;
    let pidfd = rustix::process::pidfd_open(pid, PidfdFlags::empty()).context("pidfd_open")?;

    trace!(pid = pid.as_raw_nonzero().get(), "helper started");

    // The pidfd owns the relationship from here; the std handle must not
    // reap on drop (and doesn't).
    drop(child);

    Ok(ChildHandle { pid, pidfd, outputs })
}

/// Per-spawn execution context: a private runtime directory for the unit,
/// released again when the unit goes back to rest.
pub fn acquire_runtime_dir(run_dir: &Path, unit: &str) -> anyhow::Result<PathBuf> {
    let dir = run_dir.join("units").join(unit);
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("creating runtime dir {}", dir.display()))?;
    Ok(dir)
}

pub fn release_runtime_dir(run_dir: &Path, unit: &str) {
    let dir = run_dir.join("units").join(unit);
    let _ = std::fs::remove_dir_all(dir);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawn_and_reap() {
        let child = spawn_helper(Path::new("/bin/true"), &[], false).unwrap();

        // /bin/true exits immediately; poll for the reap.
        let exit = loop {
            if let Some(exit) = child.try_reap().unwrap() {
                break exit;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        };

        assert!(exit.is_clean());
    }

    #[test]
    fn test_nonzero_exit() {
        let child = spawn_helper(Path::new("/bin/false"), &[], false).unwrap();

        let exit = loop {
            if let Some(exit) = child.try_reap().unwrap() {
                break exit;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        };

        assert_eq!(exit, ChildExit::Exited { status: 1 });
    }

    #[test]
    fn test_signal() {
        let child = spawn_helper(
            Path::new("/bin/sleep"),
            &[OsString::from("60")],
            true,
        )
        .unwrap();

        child.signal(Signal::Term).unwrap();

        let exit = loop {
            if let Some(exit) = child.try_reap().unwrap() {
                break exit;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        };

        assert!(matches!(exit, ChildExit::Signaled { signal, .. } if signal == 15));
    }

    #[test]
    fn test_runtime_dir() {
        let run_dir = tempfile::tempdir().unwrap();

        let dir = acquire_runtime_dir(run_dir.path(), "mnt-data.mount").unwrap();
        assert!(dir.is_dir());

        release_runtime_dir(run_dir.path(), "mnt-data.mount");
        assert!(!dir.exists());
    }
}
