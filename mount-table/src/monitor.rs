// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: MIT

use std::ffi::OsStr;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::path::Path;

use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use nix::sys::inotify::{AddWatchFlags, InitFlags, Inotify, WatchDescriptor};
use tracing::{debug, warn};

use crate::PROC_SELF_MOUNTINFO;

const UTAB_DIR: &str = "/run/mount";
const UTAB_PARENT: &str = "/run";

const DATA_MOUNTINFO: u64 = 0;
const DATA_INOTIFY: u64 = 1;

#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("opening {0}: {1}")]
    Open(&'static str, std::io::Error),
    #[error(transparent)]
    Errno(#[from] Errno),
}

/// A single pollable descriptor covering both halves of the mount table:
/// the kernel half (`/proc/self/mountinfo`, which signals priority events
/// on change) and the userspace half (`/run/mount/utab`, watched through
/// inotify).
///
/// Register [`MountMonitor::as_fd`] for readability with the event loop and
/// call [`MountMonitor::drain`] when it fires.
pub struct MountMonitor {
    epoll: Epoll,
    mountinfo: File,
    inotify: Inotify,
    utab_watch: Option<WatchDescriptor>,
    parent_watch: Option<WatchDescriptor>,
    dropped_events: u64,
}

impl MountMonitor {
    pub fn new() -> Result<Self, MonitorError> {
        let mountinfo = File::open(PROC_SELF_MOUNTINFO)
            .map_err(|e| MonitorError::Open(PROC_SELF_MOUNTINFO, e))?;

        let inotify = Inotify::init(InitFlags::IN_NONBLOCK | InitFlags::IN_CLOEXEC)?;

        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?;
        epoll.add(
            mountinfo.as_fd(),
            EpollEvent::new(EpollFlags::EPOLLPRI | EpollFlags::EPOLLERR, DATA_MOUNTINFO),
        )?;
        epoll.add(
            inotify.as_fd(),
            EpollEvent::new(EpollFlags::EPOLLIN, DATA_INOTIFY),
        )?;

        let mut monitor = Self {
            epoll,
            mountinfo,
            inotify,
            utab_watch: None,
            parent_watch: None,
            dropped_events: 0,
        };

        monitor.rewatch_utab();
        Ok(monitor)
    }

    /// The number of change notifications that may have been lost, for
    /// example because draining the monitor failed. Exposed so callers can
    /// surface possible event loss instead of silently recovering.
    pub fn dropped_events(&self) -> u64 {
        self.dropped_events
    }

    /// Consumes all pending notifications. Returns true if at least one of
    /// them was a real mount-table change (as opposed to, say, the creation
    /// of /run/mount).
    pub fn drain(&mut self) -> bool {
        let mut rescan = false;

        loop {
            let mut events = [EpollEvent::empty(); 8];
            let n = match self.epoll.wait(&mut events, EpollTimeout::ZERO) {
                Ok(0) => break,
                Ok(n) => n,
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    // We can't tell what we missed; force a rescan.
                    warn!("draining mount monitor: {}", e);
                    self.dropped_events += 1;
                    return true;
                }
            };

            for event in &events[..n] {
                match event.data() {
                    DATA_MOUNTINFO => {
                        self.rearm_mountinfo();
                        rescan = true;
                    }
                    DATA_INOTIFY => {
                        if self.drain_inotify() {
                            rescan = true;
                        }
                    }
                    _ => unreachable!(),
                }
            }
        }

        rescan
    }

    /// The priority condition on mountinfo is level-triggered and resets
    /// when the file is read from the start again.
    fn rearm_mountinfo(&mut self) {
        let mut buf = [0u8; 1];
        let _ = self.mountinfo.seek(SeekFrom::Start(0));
        let _ = self.mountinfo.read(&mut buf);
    }

    fn drain_inotify(&mut self) -> bool {
        let mut rescan = false;

        loop {
            let events = match self.inotify.read_events() {
                Ok(events) => events,
                Err(Errno::EAGAIN) => break,
                Err(e) => {
                    warn!("reading inotify events: {}", e);
                    self.dropped_events += 1;
                    return true;
                }
            };

            for event in events {
                if Some(event.wd) == self.parent_watch {
                    // Watching /run for /run/mount to appear. The creation
                    // itself is not a table change.
                    if event.name.as_deref() == Some(OsStr::new("mount")) {
                        debug!("{} appeared, rewatching", UTAB_DIR);
                        self.rewatch_utab();
                    }
                } else if Some(event.wd) == self.utab_watch {
                    if event.mask.contains(AddWatchFlags::IN_IGNORED) {
                        // The directory went away.
                        self.utab_watch = None;
                        self.rewatch_utab();
                    } else if utab_event_is_real(event.name.as_deref()) {
                        rescan = true;
                    }
                }
            }
        }

        rescan
    }

    /// Watches /run/mount if it exists, or /run for its creation otherwise.
    fn rewatch_utab(&mut self) {
        if let Some(wd) = self.parent_watch.take() {
            let _ = self.inotify.rm_watch(wd);
        }

        if Path::new(UTAB_DIR).is_dir() {
            let flags = AddWatchFlags::IN_CLOSE_WRITE
                | AddWatchFlags::IN_MOVED_TO
                | AddWatchFlags::IN_DELETE
                | AddWatchFlags::IN_CREATE;
            match self.inotify.add_watch(Path::new(UTAB_DIR), flags) {
                Ok(wd) => {
                    self.utab_watch = Some(wd);
                    return;
                }
                Err(e) => debug!("watching {}: {}", UTAB_DIR, e),
            }
        }

        match self.inotify.add_watch(
            Path::new(UTAB_PARENT),
            AddWatchFlags::IN_CREATE | AddWatchFlags::IN_MOVED_TO,
        ) {
            Ok(wd) => self.parent_watch = Some(wd),
            Err(e) => debug!("watching {}: {}", UTAB_PARENT, e),
        }
    }
}

impl AsFd for MountMonitor {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.epoll.0.as_fd()
    }
}

impl AsRawFd for MountMonitor {
    fn as_raw_fd(&self) -> RawFd {
        self.epoll.0.as_raw_fd()
    }
}

/// Only changes to the utab itself count; lock files and editor temp files
/// in the same directory do not.
fn utab_event_is_real(name: Option<&OsStr>) -> bool {
    name == Some(OsStr::new("utab"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_utab_filter() {
        assert!(utab_event_is_real(Some(OsStr::new("utab"))));
        assert!(!utab_event_is_real(Some(OsStr::new("utab.lock"))));
        assert!(!utab_event_is_real(Some(OsStr::new(".#utab1234"))));
        assert!(!utab_event_is_real(None));
    }

    #[test]
    fn test_monitor_quiescent() {
        let mut monitor = MountMonitor::new().unwrap();

        // A drain consumes anything pending; with no table changes since,
        // the next one reports quiescence.
        monitor.drain();
        assert!(!monitor.drain());
        assert_eq!(monitor.dropped_events(), 0);
    }
}
