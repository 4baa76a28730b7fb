// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! Reconciliation of the unit registry against the kernel mount table.
//! Every pass diffs one snapshot against the registered units, synthesizes
//! units for new mounts, updates changed ones, and retires vanished ones.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use mount_table::{unescape_octal, MountEntry, ParseError};
use tracing::{debug, warn};

use crate::manager::Manager;
use crate::mount::options::{self, MountParameters};
use crate::mount::{MountResult, MountState, MountUnit};
use crate::unit_name;
use crate::units::{
    Dependency, LoadState, RateLimit, Unit, UnitData, UnitKey, LOCAL_FS_TARGET, REMOTE_FS_TARGET,
    UMOUNT_TARGET,
};

impl Manager {
    /// A full reconciliation pass, run whenever the monitor reports a real
    /// change.
    pub(crate) fn mounts_changed(&mut self) {
        let entries = match self.read_mount_table() {
            Ok(entries) => entries,
            Err(e) => {
                // Not fatal for any unit; the flags are reset so the next
                // event starts from a clean slate.
                warn!("failed to read mount table: {}", e);
                self.reset_scan_flags();
                return;
            }
        };

        self.reconcile_entries(&entries, true);
    }

    /// The startup variant: registers units and parameters for everything
    /// currently mounted, without flipping any states. Coldplug decides
    /// those afterwards.
    pub(crate) fn enumerate_mounts(&mut self) {
        match self.read_mount_table() {
            Ok(entries) => self.reconcile_entries(&entries, false),
            Err(e) => warn!("failed to read mount table: {}", e),
        }
    }

    fn read_mount_table(&self) -> Result<Vec<MountEntry>, ParseError> {
        self.table.snapshot()?.collect()
    }

    /// One reconciliation pass over a snapshot. With `set_flags` unset, only
    /// units and parameters are recorded (the enumerate case).
    pub(crate) fn reconcile_entries(&mut self, entries: &[MountEntry], set_flags: bool) {
        for entry in entries {
            let target = PathBuf::from(unescape_octal(&entry.target));
            if !target.is_absolute() || entry.source.is_empty() || entry.fstype == "autofs" {
                continue;
            }

            let what = PathBuf::from(unescape_octal(&entry.source));
            if what.starts_with("/dev") {
                self.device_found_by_mount(&what, true);
            }

            let params = MountParameters {
                what: Some(what),
                options: Some(entry.options.clone()),
                fstype: Some(entry.fstype.clone()),
            };

            self.mount_setup_unit(target, params, set_flags);
        }

        // Dispatch the load queue for anything the scan brought in.
        for key in self.units.take_load_queue() {
            if self.units.contains(key) && self.units.unit(key).mount().is_some() {
                self.mount_load(key);
            }
        }

        if !set_flags {
            return;
        }

        // Anything we didn't see in the snapshot is gone.
        let mut gone: BTreeSet<PathBuf> = BTreeSet::new();
        for key in self.units.mounts() {
            let m = self.units.unit_mut(key).mount_mut().unwrap();
            if m.is_mounted {
                continue;
            }

            if m.from_proc_self_mountinfo {
                if let Some(what) = m.parameters_mountinfo.as_ref().and_then(|p| p.what.clone())
                {
                    if what.starts_with("/dev") {
                        gone.insert(what);
                    }
                }
            }

            m.from_proc_self_mountinfo = false;
            m.parameters_mountinfo = None;

            if m.state == MountState::Mounted {
                // Somebody unmounted it behind our back; that's not a
                // failure of the unit.
                self.mount_enter_dead(key, MountResult::Success);
            }
        }

        // Fresh or changed mounts move their units forward.
        for key in self.units.mounts() {
            let (just_mounted, just_changed, state) = {
                let m = self.units.unit(key).mount().unwrap();
                (m.just_mounted, m.just_changed, m.state)
            };

            if !just_mounted && !just_changed {
                continue;
            }

            match state {
                MountState::Dead | MountState::Failed => {
                    let unit = self.units.unit_mut(key);
                    unit.invocation_id = Some(uuid::Uuid::new_v4());
                    let m = unit.mount_mut().unwrap();
                    m.result = MountResult::Success;
                    m.reload_result = MountResult::Success;
                    self.mount_enter_mounted(key, MountResult::Success);
                }
                MountState::Mounting => {
                    self.mount_set_state(key, MountState::MountingDone);
                }
                _ => {
                    // Nothing to transition, but consumers may care (e.g. a
                    // ro/rw remount done behind our back).
                    debug!(
                        unit = %self.units.unit(key).name,
                        "mount changed externally"
                    );
                }
            }
        }

        // Sources still backing some mount are not gone, whatever the
        // per-unit bookkeeping said.
        let mut around: BTreeSet<PathBuf> = BTreeSet::new();
        for key in self.units.mounts() {
            let m = self.units.unit_mut(key).mount_mut().unwrap();
            if m.is_mounted {
                if let Some(what) = m.parameters_mountinfo.as_ref().and_then(|p| p.what.clone())
                {
                    if what.starts_with("/dev") {
                        around.insert(what);
                    }
                }
            }

            m.is_mounted = false;
            m.just_mounted = false;
            m.just_changed = false;
        }

        for path in gone.difference(&around) {
            self.device_found_by_mount(path, false);
        }

        self.gc_mounts();
    }

    fn mount_setup_unit(&mut self, where_: PathBuf, params: MountParameters, set_flags: bool) {
        let name = match unit_name::from_path(&where_) {
            Ok(name) => name,
            Err(e) => {
                debug!("ignoring mount table entry: {}", e);
                return;
            }
        };

        let extrinsic = options::is_extrinsic(self.cfg.scope, &where_, &params, self.in_initrd);

        match self.units.get(&name) {
            None => {
                let mut unit = Unit::new(
                    name,
                    UnitData::Mount(MountUnit::new(where_, self.cfg.default_timeout)),
                    RateLimit::new(self.cfg.start_limit_interval, self.cfg.start_limit_burst),
                );

                let m = unit.mount_mut().unwrap();
                m.from_proc_self_mountinfo = true;
                m.parameters_mountinfo = Some(params.clone());
                if set_flags {
                    m.is_mounted = true;
                    m.just_mounted = true;
                    m.just_changed = true;
                }

                let key = self.units.insert(unit);

                if self.cfg.scope.is_system() && !extrinsic {
                    let target = if params.is_network() {
                        REMOTE_FS_TARGET
                    } else {
                        LOCAL_FS_TARGET
                    };
                    self.units.add_dependency_by_name(key, Dependency::Before, target);
                    self.units
                        .add_dependency_by_name(key, Dependency::Conflicts, UMOUNT_TARGET);
                }

                self.units.enqueue_load(key);
            }
            Some(key) => {
                let unit = self.units.unit_mut(key);
                let Some(m) = unit.mount_mut() else {
                    return;
                };

                let was_network = m
                    .parameters_mountinfo
                    .as_ref()
                    .map(|p| p.is_network())
                    .unwrap_or(false);

                let newly_mounted = !m.from_proc_self_mountinfo;
                let changed = m.set_mountinfo_parameters(params.clone());

                m.from_proc_self_mountinfo = true;
                if set_flags {
                    m.is_mounted = true;
                    m.just_mounted = m.just_mounted || newly_mounted;
                    m.just_changed = m.just_changed || changed;
                }

                if unit.load_state == LoadState::NotFound {
                    unit.load_state = LoadState::Loaded;
                }

                // A mount that turns out to be networked after the fact
                // still gets its remote-fs ordering. Edges are only ever
                // added here; a full reload is what removes stale ones.
                if !was_network
                    && params.is_network()
                    && self.cfg.scope.is_system()
                    && !extrinsic
                {
                    self.units
                        .add_dependency_by_name(key, Dependency::Before, REMOTE_FS_TARGET);
                }
            }
        }
    }

    pub(crate) fn reset_scan_flags(&mut self) {
        for key in self.units.mounts() {
            let m = self.units.unit_mut(key).mount_mut().unwrap();
            m.is_mounted = false;
            m.just_mounted = false;
            m.just_changed = false;
        }
    }

    /// Records whether a device node currently backs any mount.
    pub(crate) fn device_found_by_mount(&mut self, path: &Path, found: bool) {
        let name = match unit_name::device_from_path(path) {
            Ok(name) => name,
            Err(_) => return,
        };

        let key = self.units.ensure_device(&name, path);
        if let UnitData::Device(dev) = &mut self.units.unit_mut(key).data {
            if dev.found_by_mount != found {
                debug!(device = %name, node = %dev.path.display(), found, "device presence changed");
                dev.found_by_mount = found;
            }
        }
    }

    /// Drops mount units that no longer have any backing: no fragment, not
    /// in the kernel table, dead, perpetuals excepted. Failed units stay
    /// registered so their result remains queryable.
    pub(crate) fn gc_mounts(&mut self) {
        let doomed: Vec<UnitKey> = self
            .units
            .iter()
            .filter(|(_, u)| !u.perpetual)
            .filter_map(|(k, u)| u.mount().map(|m| (k, m)))
            .filter(|(_, m)| {
                !m.from_fragment
                    && !m.from_proc_self_mountinfo
                    && m.control.is_none()
                    && m.state == MountState::Dead
            })
            .map(|(k, _)| k)
            .collect();

        for key in doomed {
            debug!(unit = %self.units.unit(key).name, "collecting unit");
            self.release_unit(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::ChildExit;
    use crate::manager::tests::test_manager;
    use crate::mount::RETRY_UMOUNT_MAX;

    fn entry(source: &str, target: &str, fstype: &str, options: &str) -> MountEntry {
        MountEntry {
            source: source.to_string(),
            target: target.to_string(),
            fstype: fstype.to_string(),
            options: options.to_string(),
        }
    }

    fn mount_state(mgr: &Manager, name: &str) -> MountState {
        let key = mgr.units.get(name).unwrap();
        mgr.units.unit(key).mount().unwrap().state
    }

    #[test]
    fn test_adhoc_mount_appears() {
        let (mut mgr, _dir) = test_manager();
        mgr.synthesize_root();

        mgr.reconcile_entries(
            &[entry("/dev/sda1", "/mnt/data", "ext4", "rw,relatime")],
            true,
        );

        let key = mgr.units.get("mnt-data.mount").unwrap();
        let unit = mgr.units.unit(key);
        let m = unit.mount().unwrap();

        assert_eq!(m.state, MountState::Mounted);
        assert!(m.from_proc_self_mountinfo);
        assert_eq!(
            m.parameters_mountinfo,
            Some(MountParameters {
                what: Some("/dev/sda1".into()),
                options: Some("rw,relatime".to_string()),
                fstype: Some("ext4".to_string()),
            })
        );

        let local_fs = mgr.units.get(LOCAL_FS_TARGET).unwrap();
        let umount = mgr.units.get(UMOUNT_TARGET).unwrap();
        assert!(unit.has_dependency(Dependency::Before, local_fs));
        assert!(unit.has_dependency(Dependency::Conflicts, umount));
        assert!(unit.invocation_id.is_some());
    }

    #[test]
    fn test_reconcile_idempotent() {
        let (mut mgr, _dir) = test_manager();
        mgr.synthesize_root();

        let entries = vec![
            entry("/dev/sda1", "/mnt/data", "ext4", "rw,relatime"),
            entry("tmpfs", "/tmp", "tmpfs", "rw"),
        ];

        mgr.reconcile_entries(&entries, true);

        let snapshot = |mgr: &Manager| {
            let mut units: Vec<_> = mgr
                .units
                .iter()
                .map(|(_, u)| {
                    let mount = u.mount().map(|m| {
                        (
                            m.state,
                            m.from_proc_self_mountinfo,
                            m.parameters_mountinfo.clone(),
                            m.is_mounted,
                            m.just_mounted,
                            m.just_changed,
                        )
                    });
                    let edges: usize = u.deps.values().map(|s| s.len()).sum();
                    (u.name.clone(), mount, edges)
                })
                .collect();
            units.sort();
            units
        };

        let first = snapshot(&mgr);
        mgr.reconcile_entries(&entries, true);
        let second = snapshot(&mgr);

        assert_eq!(first, second);
    }

    #[test]
    fn test_diff_correctness() {
        let (mut mgr, _dir) = test_manager();
        mgr.synthesize_root();

        mgr.reconcile_entries(
            &[
                entry("/dev/sda1", "/mnt/a", "ext4", "rw"),
                entry("/dev/sdb1", "/mnt/b", "ext4", "rw"),
            ],
            true,
        );

        assert_eq!(mount_state(&mgr, "mnt-a.mount"), MountState::Mounted);
        assert_eq!(mount_state(&mgr, "mnt-b.mount"), MountState::Mounted);

        // b vanishes, a changes options, c is new.
        mgr.reconcile_entries(
            &[
                entry("/dev/sda1", "/mnt/a", "ext4", "ro"),
                entry("/dev/sdc1", "/mnt/c", "ext4", "rw"),
            ],
            true,
        );

        assert_eq!(mount_state(&mgr, "mnt-a.mount"), MountState::Mounted);
        assert_eq!(mount_state(&mgr, "mnt-c.mount"), MountState::Mounted);

        let a = mgr.units.get("mnt-a.mount").unwrap();
        let m = mgr.units.unit(a).mount().unwrap();
        assert_eq!(
            m.parameters_mountinfo.as_ref().unwrap().options.as_deref(),
            Some("ro")
        );

        // The vanished unit went to rest and was collected (nothing else
        // referenced it).
        assert!(mgr.units.get("mnt-b.mount").is_none());
    }

    #[test]
    fn test_gone_mount_is_not_a_failure() {
        let (mut mgr, _dir) = test_manager();

        mgr.reconcile_entries(&[entry("/dev/sda1", "/srv", "ext4", "rw")], true);
        let key = mgr.units.get("srv.mount").unwrap();

        // Pin the unit with a fragment so it survives the disappearance.
        {
            let m = mgr.units.unit_mut(key).mount_mut().unwrap();
            m.from_fragment = true;
        }

        mgr.reconcile_entries(&[], true);

        let m = mgr.units.unit(key).mount().unwrap();
        assert_eq!(m.state, MountState::Dead);
        assert_eq!(m.result, MountResult::Success);
        assert!(!m.from_proc_self_mountinfo);
        assert!(m.parameters_mountinfo.is_none());
    }

    #[test]
    fn test_root_is_perpetual() {
        let (mut mgr, _dir) = test_manager();
        mgr.synthesize_root();

        let root = mgr.units.get("-.mount").unwrap();
        assert!(mgr.units.unit(root).perpetual);
        assert!(!mgr.units.unit(root).default_dependencies);

        mgr.reconcile_entries(&[entry("/dev/root", "/", "ext4", "rw")], true);
        assert_eq!(mount_state(&mgr, "-.mount"), MountState::Mounted);

        // The root never conflicts with umount.target, and survives even a
        // snapshot that (absurdly) lacks it.
        if let Some(umount) = mgr.units.get(UMOUNT_TARGET) {
            assert!(!mgr.units.unit(root).has_dependency(Dependency::Conflicts, umount));
        }

        mgr.reconcile_entries(&[], true);
        assert!(mgr.units.get("-.mount").is_some());
    }

    #[test]
    fn test_device_found_and_gone() {
        let (mut mgr, _dir) = test_manager();

        mgr.reconcile_entries(&[entry("/dev/sda1", "/mnt/data", "ext4", "rw")], true);

        let dev = mgr.units.get("dev-sda1.device").unwrap();
        match &mgr.units.unit(dev).data {
            UnitData::Device(d) => assert!(d.found_by_mount),
            _ => panic!("expected a device unit"),
        }

        mgr.reconcile_entries(&[], true);

        match &mgr.units.unit(dev).data {
            UnitData::Device(d) => assert!(!d.found_by_mount),
            _ => panic!("expected a device unit"),
        }
    }

    #[test]
    fn test_late_netdev_adds_remote_fs_edge() {
        let (mut mgr, _dir) = test_manager();

        mgr.reconcile_entries(&[entry("//host/share", "/mnt/share", "ext4", "rw")], true);

        let key = mgr.units.get("mnt-share.mount").unwrap();
        let local_fs = mgr.units.get(LOCAL_FS_TARGET).unwrap();
        assert!(mgr.units.unit(key).has_dependency(Dependency::Before, local_fs));

        // The same mount shows up as networked later on.
        mgr.reconcile_entries(
            &[entry("//host/share", "/mnt/share", "ext4", "rw,_netdev")],
            true,
        );

        let remote_fs = mgr.units.get(REMOTE_FS_TARGET).unwrap();
        assert!(mgr.units.unit(key).has_dependency(Dependency::Before, remote_fs));
        // Additive only: the old edge stays until a full reload.
        assert!(mgr.units.unit(key).has_dependency(Dependency::Before, local_fs));
    }

    #[test]
    fn test_stop_of_mounted_unit() {
        let (mut mgr, _dir) = test_manager();

        mgr.reconcile_entries(&[entry("/dev/sda1", "/srv", "ext4", "rw")], true);
        let key = mgr.units.get("srv.mount").unwrap();
        {
            let m = mgr.units.unit_mut(key).mount_mut().unwrap();
            m.lazy_unmount = true;
        }

        mgr.mount_stop(key).unwrap();

        {
            let m = mgr.units.unit(key).mount().unwrap();
            assert_eq!(m.state, MountState::Unmounting);
            assert!(m.control_pid().is_some());
            assert_eq!(m.control_command, Some(crate::mount::MountExecCommand::Unmount));
            assert!(mgr.timers.armed(key));
        }

        // The kernel table drops the entry, then the helper reports success.
        mgr.reconcile_entries(&[], true);
        assert_eq!(mount_state(&mgr, "srv.mount"), MountState::Unmounting);

        mgr.mount_sigchld_event(key, ChildExit::Exited { status: 0 });

        let m = mgr.units.unit(key).mount().unwrap();
        assert_eq!(m.state, MountState::Dead);
        assert_eq!(m.result, MountResult::Success);
        assert!(m.control_pid().is_none());
        assert!(!mgr.timers.armed(key));
    }

    #[test]
    fn test_umount_retries_then_gives_up() {
        let (mut mgr, _dir) = test_manager();

        mgr.reconcile_entries(&[entry("/dev/sda1", "/srv", "ext4", "rw")], true);
        let key = mgr.units.get("srv.mount").unwrap();

        mgr.mount_stop(key).unwrap();

        // The helper keeps succeeding, but the kernel still shows the mount.
        for i in 1..=RETRY_UMOUNT_MAX {
            mgr.mount_sigchld_event(key, ChildExit::Exited { status: 0 });
            let m = mgr.units.unit(key).mount().unwrap();
            assert_eq!(m.n_retry_umount, i);
            assert_eq!(m.state, MountState::Unmounting);
        }

        // Attempt 33 gives up gracefully.
        mgr.mount_sigchld_event(key, ChildExit::Exited { status: 0 });

        let m = mgr.units.unit(key).mount().unwrap();
        assert_eq!(m.state, MountState::Mounted);
        assert_eq!(m.result, MountResult::Success);
        assert_eq!(m.n_retry_umount, RETRY_UMOUNT_MAX);
    }

    #[test]
    fn test_mount_timeout_escalation() {
        let (mut mgr, _dir) = test_manager();

        // A fragment-backed unit that is not in the kernel table.
        let key = mgr.units.insert(Unit::new(
            "mnt-hang.mount".to_string(),
            UnitData::Mount(MountUnit::new("/mnt/hang".into(), mgr.cfg.default_timeout)),
            RateLimit::off(),
        ));
        {
            let m = mgr.units.unit_mut(key).mount_mut().unwrap();
            m.from_fragment = true;
            m.parameters_fragment = Some(MountParameters {
                what: Some("/dev/sdz1".into()),
                options: None,
                fstype: Some("ext4".to_string()),
            });
        }

        mgr.mount_start(key).unwrap();
        assert_eq!(mount_state(&mgr, "mnt-hang.mount"), MountState::Mounting);
        assert!(mgr.timers.armed(key));

        // TERM comes before KILL.
        mgr.mount_timer_event(key);
        assert_eq!(mount_state(&mgr, "mnt-hang.mount"), MountState::MountingSigterm);
        assert!(mgr.timers.armed(key));

        mgr.mount_timer_event(key);
        assert_eq!(mount_state(&mgr, "mnt-hang.mount"), MountState::MountingSigkill);
        assert!(mgr.timers.armed(key));

        // Still no kernel entry: the unit is dead, with a timeout result.
        mgr.mount_timer_event(key);
        let m = mgr.units.unit(key).mount().unwrap();
        assert_eq!(m.state, MountState::Dead);
        assert_eq!(m.result, MountResult::Timeout);
    }

    #[test]
    fn test_sigterm_skipped_when_sigkill_forbidden() {
        let (mut mgr, _dir) = test_manager();
        mgr.cfg.send_sigkill = false;

        mgr.reconcile_entries(&[entry("/dev/sda1", "/srv", "ext4", "rw")], true);
        let key = mgr.units.get("srv.mount").unwrap();

        mgr.mount_stop(key).unwrap();
        mgr.mount_timer_event(key);
        assert_eq!(mount_state(&mgr, "srv.mount"), MountState::UnmountingSigterm);

        // Without SIGKILL, the second expiry reconciles directly.
        mgr.mount_timer_event(key);
        let m = mgr.units.unit(key).mount().unwrap();
        assert_eq!(m.state, MountState::Mounted);
        assert_eq!(m.result, MountResult::Timeout);
    }

    #[test]
    fn test_reload_failure_does_not_unmount() {
        let (mut mgr, _dir) = test_manager();

        mgr.reconcile_entries(&[entry("/dev/sda1", "/srv", "ext4", "rw")], true);
        let key = mgr.units.get("srv.mount").unwrap();

        mgr.mount_reload(key).unwrap();
        assert_eq!(mount_state(&mgr, "srv.mount"), MountState::Remounting);

        mgr.mount_sigchld_event(key, ChildExit::Exited { status: 32 });

        let m = mgr.units.unit(key).mount().unwrap();
        assert_eq!(m.state, MountState::Mounted);
        assert_eq!(m.reload_result, MountResult::ExitCode);
        assert_eq!(m.result, MountResult::Success);
    }

    #[test]
    fn test_commands_rejected_in_flight() {
        let (mut mgr, _dir) = test_manager();

        mgr.reconcile_entries(&[entry("/dev/sda1", "/srv", "ext4", "rw")], true);
        let key = mgr.units.get("srv.mount").unwrap();

        mgr.mount_stop(key).unwrap();
        assert_eq!(
            mgr.mount_start(key),
            Err(crate::mount::CommandError::Again)
        );

        // A second stop is a no-op, not an error.
        mgr.mount_stop(key).unwrap();
        assert_eq!(mount_state(&mgr, "srv.mount"), MountState::Unmounting);
    }

    #[test]
    fn test_start_rate_limit() {
        let (mut mgr, _dir) = test_manager();
        let key = mgr.units.insert(Unit::new(
            "mnt-x.mount".to_string(),
            UnitData::Mount(MountUnit::new("/mnt/x".into(), mgr.cfg.default_timeout)),
            RateLimit::new(std::time::Duration::from_secs(60), 2),
        ));
        {
            let m = mgr.units.unit_mut(key).mount_mut().unwrap();
            m.from_fragment = true;
            m.parameters_fragment = Some(MountParameters {
                what: Some("/dev/sdz1".into()),
                options: None,
                fstype: None,
            });
        }

        for _ in 0..2 {
            mgr.mount_start(key).unwrap();
            // Force the unit back to rest for the next attempt.
            mgr.mount_sigchld_event(key, ChildExit::Exited { status: 1 });
            let m = mgr.units.unit_mut(key).mount_mut().unwrap();
            m.state = MountState::Dead;
            m.result = MountResult::Success;
        }

        assert_eq!(
            mgr.mount_start(key),
            Err(crate::mount::CommandError::StartLimitHit)
        );

        let m = mgr.units.unit(key).mount().unwrap();
        assert_eq!(m.state, MountState::Dead);
        assert_eq!(m.result, MountResult::StartLimitHit);
    }

    #[test]
    fn test_invariants_after_reconcile() {
        let (mut mgr, _dir) = test_manager();
        mgr.synthesize_root();

        mgr.reconcile_entries(
            &[
                entry("/dev/root", "/", "ext4", "rw"),
                entry("/dev/sda1", "/mnt/data", "ext4", "rw"),
                entry("proc", "/proc", "proc", "rw"),
                entry("systemd-1", "/mnt/auto", "autofs", "rw"),
            ],
            true,
        );

        // autofs entries are skipped entirely.
        assert!(mgr.units.get("mnt-auto.mount").is_none());

        for (_, unit) in mgr.units.iter() {
            let Some(m) = unit.mount() else { continue };

            assert!(m.where_.is_absolute());
            assert!(crate::unit_name::path_is_normalized(&m.where_));
            assert!(m.n_retry_umount <= RETRY_UMOUNT_MAX);
            assert_eq!(m.control_pid().is_some(), m.state.has_control_process());
            assert!(m.from_fragment || m.from_proc_self_mountinfo || unit.perpetual);

            // Scratch flags are reset at the end of every pass.
            assert!(!m.is_mounted && !m.just_mounted && !m.just_changed);
        }
    }
}
