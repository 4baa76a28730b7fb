// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! The manager: one single-threaded event loop that owns the unit registry,
//! the mount-table monitor, the per-unit timers, and the helper children.
//! Everything the subsystem does happens as a bounded callback on this loop.

use std::collections::HashMap;
use std::os::fd::AsRawFd;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time;

use anyhow::Context as _;
use mount_table::{MountMonitor, MountTable};
use tracing::{debug, info, trace, warn};

use crate::config::{self, Config};
use crate::control::ControlConn;
use crate::exec::ChildHandle;
use crate::mount::{ControlChild, MountState, MountUnit};
use crate::timers::Timers;
use crate::unit_name;
use crate::units::{LoadState, RateLimit, Unit, UnitData, UnitKey, Units};

const MONITOR: mio::Token = mio::Token(0);
const WAKER: mio::Token = mio::Token(1);
const CONTROL: mio::Token = mio::Token(2);

// Timers, helper children, and control connections get their tokens from a
// bump allocator above the fixed ones.
const DYNAMIC_TOKEN_BASE: usize = 16;

pub(crate) enum TokenOwner {
    UnitTimer(UnitKey),
    Child(UnitKey),
    Orphan,
    Conn,
}

pub struct Manager {
    pub(crate) cfg: Config,
    pub(crate) poll: mio::Poll,
    waker: Arc<mio::Waker>,

    pub(crate) units: Units,
    pub(crate) timers: Timers,

    monitor: MountMonitor,
    pub(crate) table: MountTable,

    pub(crate) control: mio::net::UnixListener,
    pub(crate) conns: HashMap<mio::Token, ControlConn>,

    pub(crate) token_owners: HashMap<mio::Token, TokenOwner>,
    next_token: usize,

    // Helpers we gave up on but still have to reap eventually.
    orphans: HashMap<mio::Token, ChildHandle>,

    shutdown: Arc<AtomicBool>,
    pub(crate) in_initrd: bool,
}

/// Lets another thread (the signal handler) ask the loop to wind down.
#[derive(Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
    waker: Arc<mio::Waker>,
}

impl ShutdownHandle {
    pub fn request(&self) {
        self.flag.store(true, Ordering::SeqCst);
        let _ = self.waker.wake();
    }
}

impl Manager {
    pub fn new(cfg: Config) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&cfg.run_dir)
            .with_context(|| format!("creating run dir {}", cfg.run_dir.display()))?;

        let poll = mio::Poll::new()?;
        let waker = Arc::new(mio::Waker::new(poll.registry(), WAKER)?);

        let monitor = MountMonitor::new().context("setting up mount monitor")?;
        poll.registry().register(
            &mut mio::unix::SourceFd(&monitor.as_raw_fd()),
            MONITOR,
            mio::Interest::READABLE,
        )?;

        let socket_path = cfg.run_dir.join("control.sock");
        let _ = std::fs::remove_file(&socket_path);
        let mut control =
            mio::net::UnixListener::bind(&socket_path).context("binding control socket")?;
        poll.registry()
            .register(&mut control, CONTROL, mio::Interest::READABLE)?;

        Ok(Self {
            cfg,
            poll,
            waker,
            units: Units::default(),
            timers: Timers::default(),
            monitor,
            table: MountTable::default(),
            control,
            conns: HashMap::new(),
            token_owners: HashMap::new(),
            next_token: DYNAMIC_TOKEN_BASE,
            orphans: HashMap::new(),
            shutdown: Arc::new(AtomicBool::new(false)),
            in_initrd: Path::new("/etc/initrd-release").exists(),
        })
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            flag: self.shutdown.clone(),
            waker: self.waker.clone(),
        }
    }

    /// Enumerate, restore, coldplug, and kick off configured mounts.
    pub fn startup(&mut self) -> anyhow::Result<()> {
        self.synthesize_root();
        self.load_fragments();
        self.enumerate_mounts();

        if let Err(e) = self.restore_state() {
            warn!("failed to restore serialized state: {:#}", e);
        }
        self.coldplug_mounts();

        // Whatever changed while we were enumerating will be picked up by
        // the first pass; the startup events themselves are stale.
        self.monitor.drain();
        self.mounts_changed();

        self.start_auto_mounts();
        Ok(())
    }

    pub fn run(&mut self) -> anyhow::Result<()> {
        self.startup()?;
        info!("startup complete, {} units", self.units.len());

        let mut events = mio::Events::with_capacity(64);

        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                info!("shutting down");
                self.save_state()?;
                return Ok(());
            }

            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e).context("poll");
            }

            // The monitor outranks everything else in a batch: the state
            // machine wants the new table applied before a helper's exit is
            // routed.
            let mut rescan = false;
            for _ in events.iter().filter(|e| e.token() == MONITOR) {
                rescan |= self.monitor.drain();
            }
            if rescan {
                self.mounts_changed();
            }

            for event in events.iter().filter(|e| e.token() != MONITOR) {
                match event.token() {
                    WAKER => {} // Just here to interrupt the poll.
                    CONTROL => self.accept_control_conns(),
                    token => self.dispatch_dynamic(token),
                }
            }

            self.gc_mounts();
        }
    }

    fn dispatch_dynamic(&mut self, token: mio::Token) {
        match self.token_owners.get(&token) {
            Some(TokenOwner::UnitTimer(key)) => {
                let key = *key;
                if self.timers.acknowledge(key) {
                    self.mount_timer_event(key);
                }
            }
            Some(TokenOwner::Child(key)) => {
                let key = *key;
                self.child_event(key);
            }
            Some(TokenOwner::Orphan) => self.reap_orphan(token),
            Some(TokenOwner::Conn) => self.control_conn_event(token),
            None => trace!(?token, "event for stale token"),
        }
    }

    fn child_event(&mut self, key: UnitKey) {
        if !self.units.contains(key) {
            return;
        }

        let name = self.units.unit(key).name.clone();
        let exit = {
            let Some(m) = self.units.unit_mut(key).mount_mut() else {
                return;
            };
            let Some(control) = &mut m.control else {
                return;
            };

            control.handle.drain_output(&name);
            match control.handle.try_reap() {
                Ok(exit) => exit,
                Err(e) => {
                    warn!(unit = %name, "failed to reap helper: {:#}", e);
                    None
                }
            }
        };

        if let Some(exit) = exit {
            self.mount_sigchld_event(key, exit);
        }
    }

    fn reap_orphan(&mut self, token: mio::Token) {
        let Some(handle) = self.orphans.get_mut(&token) else {
            return;
        };

        handle.drain_output("orphan");
        if !matches!(handle.try_reap(), Ok(None)) {
            let mut handle = self.orphans.remove(&token).unwrap();
            handle.deregister(self.poll.registry());
            self.token_owners.remove(&token);
            trace!("orphaned helper reaped");
        }
    }

    pub(crate) fn alloc_token(&mut self, owner: TokenOwner) -> mio::Token {
        let token = mio::Token(self.next_token);
        self.next_token += 1;
        self.token_owners.insert(token, owner);
        token
    }

    pub(crate) fn arm_unit_timer(&mut self, key: UnitKey, timeout: time::Duration) {
        let token = mio::Token(self.next_token);
        match self.timers.arm(self.poll.registry(), || token, key, timeout) {
            Ok(Some(token)) => {
                self.next_token += 1;
                self.token_owners.insert(token, TokenOwner::UnitTimer(key));
            }
            Ok(None) => {}
            Err(e) => warn!("failed to arm unit timer: {:#}", e),
        }
    }

    pub(crate) fn cancel_unit_timer(&mut self, key: UnitKey) {
        self.timers.cancel(key);
    }

    pub(crate) fn watch_control_child(
        &mut self,
        key: UnitKey,
        mut handle: ChildHandle,
    ) -> anyhow::Result<()> {
        let token = self.alloc_token(TokenOwner::Child(key));
        handle.register(self.poll.registry(), token)?;

        let m = self.units.unit_mut(key).mount_mut().unwrap();
        m.control = Some(ControlChild { handle, token });
        Ok(())
    }

    /// Detaches the unit's helper, if any. An already-dead helper is reaped
    /// and dropped; a live one (say, unkillable) is parked for reaping.
    pub(crate) fn discard_control_child(&mut self, key: UnitKey) {
        let control = match self.units.unit_mut(key).mount_mut() {
            Some(m) => m.control.take(),
            None => None,
        };
        let Some(mut control) = control else {
            return;
        };

        self.token_owners.remove(&control.token);
        control.handle.deregister(self.poll.registry());

        if matches!(control.handle.try_reap(), Ok(None)) {
            let token = self.alloc_token(TokenOwner::Orphan);
            match control.handle.register(self.poll.registry(), token) {
                Ok(()) => {
                    self.orphans.insert(token, control.handle);
                }
                Err(_) => {
                    self.token_owners.remove(&token);
                }
            }
        }
    }

    pub(crate) fn release_unit(&mut self, key: UnitKey) {
        self.discard_control_child(key);
        if let Some(token) = self.timers.remove(self.poll.registry(), key) {
            self.token_owners.remove(&token);
        }
        self.units.release(key);
    }

    /// The root mount exists for the manager's whole lifetime, whether or
    /// not anything else mentions it.
    pub(crate) fn synthesize_root(&mut self) {
        if self.units.get(unit_name::ROOT_MOUNT).is_some() {
            return;
        }

        let mut unit = Unit::new(
            unit_name::ROOT_MOUNT.to_string(),
            UnitData::Mount(MountUnit::new("/".into(), self.cfg.default_timeout)),
            RateLimit::off(),
        );
        unit.perpetual = true;
        unit.default_dependencies = false;
        unit.load_state = LoadState::Loaded;

        self.units.insert(unit);
        debug!("synthesized {}", unit_name::ROOT_MOUNT);
    }

    fn load_fragments(&mut self) {
        let fragments = match config::load_fragments(&self.cfg.fragment_dirs) {
            Ok(fragments) => fragments,
            Err(e) => {
                warn!("failed to load fragments: {:#}", e);
                return;
            }
        };

        for f in fragments {
            let key = match self.units.get(&f.name) {
                Some(key) => key,
                None => self.units.insert(Unit::new(
                    f.name.clone(),
                    UnitData::Mount(MountUnit::new(
                        f.where_.clone(),
                        self.cfg.default_timeout,
                    )),
                    RateLimit::new(self.cfg.start_limit_interval, self.cfg.start_limit_burst),
                )),
            };

            let unit = self.units.unit_mut(key);
            if !unit.perpetual {
                unit.default_dependencies = f.default_dependencies;
            }

            let Some(m) = unit.mount_mut() else {
                warn!(unit = %f.name, "fragment name collides with a non-mount unit");
                continue;
            };

            m.from_fragment = true;
            m.parameters_fragment = Some(crate::mount::options::MountParameters {
                what: f.what,
                options: f.options,
                fstype: f.fstype,
            });
            m.sloppy_options = f.sloppy_options;
            m.lazy_unmount = f.lazy_unmount;
            m.force_unmount = f.force_unmount;
            m.directory_mode = f.directory_mode;
            m.timeout = f.timeout.unwrap_or(self.cfg.default_timeout);
            m.auto_start = f.auto;
            m.device_bound =
                f.device_bound || m.parameters_fragment.as_ref().unwrap().is_device_bound();

            self.units.enqueue_load(key);
        }

        for key in self.units.take_load_queue() {
            if self.units.unit(key).mount().is_some() {
                self.mount_load(key);
            }
        }
    }

    fn start_auto_mounts(&mut self) {
        for key in self.units.mounts() {
            let (name, wanted) = {
                let unit = self.units.unit(key);
                let m = unit.mount().unwrap();
                let wanted = m.from_fragment
                    && m.auto_start
                    && m.state == MountState::Dead
                    && m.parameters()
                        .map(|p| p.is_auto() && !p.is_automount())
                        .unwrap_or(false);
                (unit.name.clone(), wanted)
            };

            if !wanted {
                continue;
            }

            info!(unit = %name, "starting configured mount");
            if let Err(e) = self.mount_start(key) {
                warn!(unit = %name, "failed to start: {}", e);
            }
        }
    }
}

pub(crate) fn now_monotonic_usec() -> u64 {
    let ts = rustix::time::clock_gettime(rustix::time::ClockId::Monotonic);
    (ts.tv_sec as u64) * 1_000_000 + (ts.tv_nsec as u64) / 1_000
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::Scope;

    pub(crate) fn test_manager() -> (Manager, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config {
            scope: Scope::System,
            default_timeout: time::Duration::from_secs(90),
            send_sigkill: true,
            kill_signal: rustix::process::Signal::Term,
            start_limit_interval: time::Duration::from_secs(10),
            start_limit_burst: 5,
            run_dir: dir.path().join("run"),
            fragment_dirs: Vec::new(),
            mount_path: "/bin/true".into(),
            umount_path: "/bin/true".into(),
        };

        let mgr = Manager::new(cfg).unwrap();
        (mgr, dir)
    }

    #[test]
    fn test_startup_against_live_table() {
        let (mut mgr, _dir) = test_manager();
        mgr.startup().unwrap();

        // The root is always mounted on a live system.
        let root = mgr.units.get(unit_name::ROOT_MOUNT).unwrap();
        let unit = mgr.units.unit(root);
        assert!(unit.perpetual);
        assert!(!unit.default_dependencies);
        assert_eq!(unit.mount().unwrap().state, MountState::Mounted);

        // Everything enumerated from the live table is at rest and clean.
        for (_, unit) in mgr.units.iter() {
            let Some(m) = unit.mount() else { continue };
            assert!(m.where_.is_absolute());
            assert!(!m.is_mounted && !m.just_mounted && !m.just_changed);
            assert!(m.control_pid().is_none());
        }
    }

    #[test]
    fn test_fragment_startup() {
        let dir = tempfile::tempdir().unwrap();
        let fragment_dir = dir.path().join("mounts.d");
        std::fs::create_dir_all(&fragment_dir).unwrap();
        std::fs::write(
            fragment_dir.join("mnt-test\\x2ddata.toml"),
            "[mount]\nwhere = \"/mnt/test-data\"\nwhat = \"/dev/sdz9\"\ntype = \"ext4\"\nauto = false\n",
        )
        .unwrap();

        let cfg = Config {
            scope: Scope::System,
            default_timeout: time::Duration::from_secs(90),
            send_sigkill: true,
            kill_signal: rustix::process::Signal::Term,
            start_limit_interval: time::Duration::from_secs(10),
            start_limit_burst: 5,
            run_dir: dir.path().join("run"),
            fragment_dirs: vec![fragment_dir],
            mount_path: "/bin/true".into(),
            umount_path: "/bin/true".into(),
        };

        let mut mgr = Manager::new(cfg).unwrap();
        mgr.startup().unwrap();

        let key = mgr.units.get("mnt-test\\x2ddata.mount").unwrap();
        let unit = mgr.units.unit(key);
        assert_eq!(unit.load_state, LoadState::Loaded);

        let m = unit.mount().unwrap();
        assert!(m.from_fragment);
        // auto = false, so nothing was started.
        assert_eq!(m.state, MountState::Dead);

        // The fragment pins the parent mount path.
        assert!(unit
            .requires_mounts_for
            .contains(&std::path::PathBuf::from("/mnt")));
    }
}
