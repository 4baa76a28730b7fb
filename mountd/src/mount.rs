// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! Mount units and their state machine. A mount unit represents one mount
//! point; commands (start/stop/reload) drive helper processes, and the
//! reconciler flips states when the kernel table changes underneath us.

pub mod options;
mod reconcile;
mod serialize;

use std::ffi::OsString;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::time;

use num_enum::{IntoPrimitive, TryFromPrimitive};
use rustix::process::Signal;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::exec::{self, ChildExit, ChildHandle};
use crate::manager::{now_monotonic_usec, Manager};
use crate::units::{
    ActiveState, Dependency, UnitKey, LOCAL_FS_PRE_TARGET, NETWORK_ONLINE_TARGET,
    NETWORK_TARGET, QUOTACHECK_SERVICE, QUOTAON_SERVICE, REMOTE_FS_PRE_TARGET, UMOUNT_TARGET,
};
use crate::unit_name;
use self::options::MountParameters;

/// An umount helper that keeps succeeding while the kernel still shows the
/// mount gets retried at most this often.
pub const RETRY_UMOUNT_MAX: u32 = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum MountState {
    Dead,
    Mounting,
    MountingDone,
    Mounted,
    Remounting,
    Unmounting,
    MountingSigterm,
    MountingSigkill,
    RemountingSigterm,
    RemountingSigkill,
    UnmountingSigterm,
    UnmountingSigkill,
    Failed,
}

impl MountState {
    pub fn as_str(self) -> &'static str {
        match self {
            MountState::Dead => "dead",
            MountState::Mounting => "mounting",
            MountState::MountingDone => "mounting-done",
            MountState::Mounted => "mounted",
            MountState::Remounting => "remounting",
            MountState::Unmounting => "unmounting",
            MountState::MountingSigterm => "mounting-sigterm",
            MountState::MountingSigkill => "mounting-sigkill",
            MountState::RemountingSigterm => "remounting-sigterm",
            MountState::RemountingSigkill => "remounting-sigkill",
            MountState::UnmountingSigterm => "unmounting-sigterm",
            MountState::UnmountingSigkill => "unmounting-sigkill",
            MountState::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        [
            MountState::Dead,
            MountState::Mounting,
            MountState::MountingDone,
            MountState::Mounted,
            MountState::Remounting,
            MountState::Unmounting,
            MountState::MountingSigterm,
            MountState::MountingSigkill,
            MountState::RemountingSigterm,
            MountState::RemountingSigkill,
            MountState::UnmountingSigterm,
            MountState::UnmountingSigkill,
            MountState::Failed,
        ]
        .into_iter()
        .find(|state| state.as_str() == s)
    }

    pub fn active_state(self) -> ActiveState {
        match self {
            MountState::Dead => ActiveState::Inactive,
            MountState::Mounting => ActiveState::Activating,
            MountState::MountingDone | MountState::Mounted => ActiveState::Active,
            MountState::Remounting
            | MountState::RemountingSigterm
            | MountState::RemountingSigkill => ActiveState::Reloading,
            MountState::Unmounting
            | MountState::MountingSigterm
            | MountState::MountingSigkill
            | MountState::UnmountingSigterm
            | MountState::UnmountingSigkill => ActiveState::Deactivating,
            MountState::Failed => ActiveState::Failed,
        }
    }

    /// States during which a helper process is running on our behalf.
    pub fn has_control_process(self) -> bool {
        !matches!(self, MountState::Dead | MountState::Mounted | MountState::Failed)
    }

    fn in_mounting_flow(self) -> bool {
        matches!(
            self,
            MountState::Mounting
                | MountState::MountingDone
                | MountState::MountingSigterm
                | MountState::MountingSigkill
        )
    }

    fn in_remounting_flow(self) -> bool {
        matches!(
            self,
            MountState::Remounting
                | MountState::RemountingSigterm
                | MountState::RemountingSigkill
        )
    }

    fn in_unmounting_flow(self) -> bool {
        matches!(
            self,
            MountState::Unmounting
                | MountState::UnmountingSigterm
                | MountState::UnmountingSigkill
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum MountResult {
    Success,
    Resources,
    Timeout,
    ExitCode,
    Signal,
    CoreDump,
    StartLimitHit,
}

impl MountResult {
    pub fn as_str(self) -> &'static str {
        match self {
            MountResult::Success => "success",
            MountResult::Resources => "resources",
            MountResult::Timeout => "timeout",
            MountResult::ExitCode => "exit-code",
            MountResult::Signal => "signal",
            MountResult::CoreDump => "core-dump",
            MountResult::StartLimitHit => "start-limit-hit",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        [
            MountResult::Success,
            MountResult::Resources,
            MountResult::Timeout,
            MountResult::ExitCode,
            MountResult::Signal,
            MountResult::CoreDump,
            MountResult::StartLimitHit,
        ]
        .into_iter()
        .find(|result| result.as_str() == s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum MountExecCommand {
    Mount,
    Unmount,
    Remount,
}

impl MountExecCommand {
    pub fn as_str(self) -> &'static str {
        match self {
            MountExecCommand::Mount => "ExecMount",
            MountExecCommand::Unmount => "ExecUnmount",
            MountExecCommand::Remount => "ExecRemount",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        [
            MountExecCommand::Mount,
            MountExecCommand::Unmount,
            MountExecCommand::Remount,
        ]
        .into_iter()
        .find(|cmd| cmd.as_str() == s)
    }
}

/// A command that can't be carried out right now, because a conflicting
/// operation is in flight or the unit refuses it.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("operation already in progress, try again")]
    Again,
    #[error("start limit hit")]
    StartLimitHit,
    #[error("invalid state for this operation")]
    InvalidState,
    #[error("not a mount unit")]
    NotAMount,
}

/// The running helper of a mount unit, with the token its pidfd and output
/// pipes are registered under.
pub struct ControlChild {
    pub handle: ChildHandle,
    pub token: mio::Token,
}

pub struct MountUnit {
    pub where_: PathBuf,
    pub state: MountState,
    pub result: MountResult,
    pub reload_result: MountResult,

    pub from_fragment: bool,
    pub from_proc_self_mountinfo: bool,
    pub parameters_fragment: Option<MountParameters>,
    pub parameters_mountinfo: Option<MountParameters>,

    pub timeout: time::Duration,
    pub directory_mode: u32,
    pub sloppy_options: bool,
    pub lazy_unmount: bool,
    pub force_unmount: bool,
    pub device_bound: bool,
    pub auto_start: bool,

    pub control: Option<ControlChild>,
    pub control_command: Option<MountExecCommand>,
    pub n_retry_umount: u32,

    // Scratch flags for one reconciliation pass.
    pub is_mounted: bool,
    pub just_mounted: bool,
    pub just_changed: bool,

    pub deserialized_state: Option<MountState>,
    pub deserialized_pid: Option<i32>,

    /// CLOCK_MONOTONIC, microseconds.
    pub state_change_usec: u64,
}

impl MountUnit {
    pub fn new(where_: PathBuf, default_timeout: time::Duration) -> Self {
        Self {
            where_,
            state: MountState::Dead,
            result: MountResult::Success,
            reload_result: MountResult::Success,
            from_fragment: false,
            from_proc_self_mountinfo: false,
            parameters_fragment: None,
            parameters_mountinfo: None,
            timeout: default_timeout,
            directory_mode: 0o755,
            sloppy_options: false,
            lazy_unmount: false,
            force_unmount: false,
            device_bound: false,
            auto_start: false,
            control: None,
            control_command: None,
            n_retry_umount: 0,
            is_mounted: false,
            just_mounted: false,
            just_changed: false,
            deserialized_state: None,
            deserialized_pid: None,
            state_change_usec: 0,
        }
    }

    /// The parameters in effect: the fragment wins over what we observed in
    /// the kernel table.
    pub fn parameters(&self) -> Option<&MountParameters> {
        if self.from_fragment {
            self.parameters_fragment.as_ref()
        } else {
            self.parameters_mountinfo.as_ref()
        }
    }

    pub fn control_pid(&self) -> Option<i32> {
        self.control.as_ref().map(|c| c.handle.pid_raw())
    }

    /// Replaces the kernel-table copy of the parameters, reporting whether
    /// anything observable changed. The old copy is dropped atomically with
    /// the report.
    pub fn set_mountinfo_parameters(&mut self, params: MountParameters) -> bool {
        let changed = self.parameters_mountinfo.as_ref() != Some(&params);
        self.parameters_mountinfo = Some(params);
        changed
    }
}

/// The argv for `mount <what> <where> [-s] [-t <fstype>] [-o <options>]`,
/// or with `-o remount[,<options>]` first for a remount. Options are
/// stripped of the tokens only the manager consumes.
fn mount_command_args(
    where_: &Path,
    p: &MountParameters,
    sloppy: bool,
    remount: bool,
) -> Option<Vec<OsString>> {
    let what = p.what.as_ref()?;

    let mut args: Vec<OsString> = vec![what.into(), where_.into()];

    let filtered = p
        .options
        .as_deref()
        .and_then(options::filter_exec_options);

    if remount {
        let opts = match &filtered {
            Some(o) => format!("remount,{}", o),
            None => "remount".to_string(),
        };
        args.push("-o".into());
        args.push(opts.into());
    }

    if sloppy {
        args.push("-s".into());
    }

    if let Some(fstype) = &p.fstype {
        args.push("-t".into());
        args.push(fstype.into());
    }

    if !remount {
        if let Some(o) = filtered {
            args.push("-o".into());
            args.push(o.into());
        }
    }

    Some(args)
}

/// The argv for `umount <where> -c [-l] [-f]`.
fn umount_command_args(where_: &Path, lazy: bool, force: bool) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![where_.into(), "-c".into()];
    if lazy {
        args.push("-l".into());
    }
    if force {
        args.push("-f".into());
    }
    args
}

impl Manager {
    pub fn mount_start(&mut self, key: UnitKey) -> Result<(), CommandError> {
        let unit = self.units.unit_mut(key);
        let state = unit.mount().ok_or(CommandError::NotAMount)?.state;

        match state {
            MountState::Mounting | MountState::MountingDone => Ok(()),
            MountState::Mounted => Ok(()),
            s if s.in_unmounting_flow() => Err(CommandError::Again),
            MountState::MountingSigterm | MountState::MountingSigkill => {
                Err(CommandError::Again)
            }
            s if s.in_remounting_flow() => Err(CommandError::Again),
            MountState::Dead | MountState::Failed => {
                if !unit.start_limit.check() {
                    warn!(unit = %unit.name, "start request repeated too quickly");
                    unit.mount_mut().unwrap().result = MountResult::StartLimitHit;
                    self.mount_set_state(key, MountState::Dead);
                    return Err(CommandError::StartLimitHit);
                }

                unit.invocation_id = Some(Uuid::new_v4());
                let m = unit.mount_mut().unwrap();
                m.result = MountResult::Success;
                m.reload_result = MountResult::Success;

                self.mount_enter_mounting(key);
                Ok(())
            }
            _ => unreachable!(),
        }
    }

    pub fn mount_stop(&mut self, key: UnitKey) -> Result<(), CommandError> {
        let state = self
            .units
            .unit(key)
            .mount()
            .ok_or(CommandError::NotAMount)?
            .state;

        match state {
            s if s.in_unmounting_flow() => Ok(()),
            MountState::MountingSigterm | MountState::MountingSigkill => Ok(()),
            MountState::Mounting
            | MountState::MountingDone
            | MountState::Mounted
            | MountState::Remounting
            | MountState::RemountingSigterm
            | MountState::RemountingSigkill => {
                self.mount_enter_unmounting(key);
                Ok(())
            }
            _ => Err(CommandError::InvalidState),
        }
    }

    pub fn mount_reload(&mut self, key: UnitKey) -> Result<(), CommandError> {
        let unit = self.units.unit_mut(key);
        let m = unit.mount_mut().ok_or(CommandError::NotAMount)?;

        match m.state {
            MountState::MountingDone => Err(CommandError::Again),
            MountState::Mounted => {
                m.reload_result = MountResult::Success;
                self.mount_enter_remounting(key);
                Ok(())
            }
            _ => Err(CommandError::InvalidState),
        }
    }

    pub(crate) fn mount_set_state(&mut self, key: UnitKey, state: MountState) {
        let unit = self.units.unit_mut(key);
        let name = unit.name.clone();
        let m = unit.mount_mut().unwrap();

        let old = m.state;
        if old == state {
            return;
        }

        m.state = state;
        m.state_change_usec = now_monotonic_usec();

        if !state.has_control_process() {
            self.cancel_unit_timer(key);
            self.discard_control_child(key);
            let m = self.units.unit_mut(key).mount_mut().unwrap();
            m.control_command = None;
        }

        debug!(
            unit = %name,
            old = old.as_str(),
            new = state.as_str(),
            "mount state changed"
        );
    }

    pub(crate) fn mount_enter_dead(&mut self, key: UnitKey, f: MountResult) {
        self.mount_enter_dead_inner(key, f, true);
    }

    fn mount_enter_dead_inner(&mut self, key: UnitKey, f: MountResult, allow_failed: bool) {
        {
            let m = self.units.unit_mut(key).mount_mut().unwrap();
            if m.result == MountResult::Success {
                m.result = f;
            }
        }

        let (name, where_, old, result) = {
            let unit = self.units.unit(key);
            let m = unit.mount().unwrap();
            (unit.name.clone(), m.where_.clone(), m.state, m.result)
        };

        let state = if allow_failed && result != MountResult::Success {
            MountState::Failed
        } else {
            MountState::Dead
        };

        log_finished(&where_, old, false, result);
        self.mount_set_state(key, state);

        // The execution context is released when the unit comes to rest.
        exec::release_runtime_dir(&self.cfg.run_dir, &name);
    }

    pub(crate) fn mount_enter_mounted(&mut self, key: UnitKey, f: MountResult) {
        let (where_, old, result) = {
            let m = self.units.unit_mut(key).mount_mut().unwrap();
            if m.result == MountResult::Success {
                m.result = f;
            }
            (m.where_.clone(), m.state, m.result)
        };

        log_finished(&where_, old, true, result);
        self.mount_set_state(key, MountState::Mounted);
    }

    /// The kernel table is the tie-breaker whenever a helper flow ends
    /// ambiguously: MOUNTED if the entry is present, plain DEAD otherwise.
    pub(crate) fn mount_enter_dead_or_mounted(&mut self, key: UnitKey, f: MountResult) {
        let mounted = self
            .units
            .unit(key)
            .mount()
            .unwrap()
            .from_proc_self_mountinfo;

        if mounted {
            self.mount_enter_mounted(key, f);
        } else {
            self.mount_enter_dead_inner(key, f, false);
        }
    }

    fn mount_enter_mounting(&mut self, key: UnitKey) {
        let (name, where_, dir_mode, sloppy, params, timeout) = {
            let unit = self.units.unit(key);
            let m = unit.mount().unwrap();
            (
                unit.name.clone(),
                m.where_.clone(),
                m.directory_mode,
                m.sloppy_options,
                m.parameters().cloned(),
                m.timeout,
            )
        };

        // Make sure the mount point exists.
        if let Err(e) = std::fs::DirBuilder::new()
            .recursive(true)
            .mode(dir_mode)
            .create(&where_)
        {
            if e.kind() != std::io::ErrorKind::AlreadyExists {
                debug!(unit = %name, "failed to create mount point: {}", e);
            }
        }

        let args = params
            .as_ref()
            .and_then(|p| mount_command_args(&where_, p, sloppy, false));

        let Some(args) = args else {
            warn!(unit = %name, "no mount parameters to operate on");
            self.mount_enter_dead(key, MountResult::Resources);
            return;
        };

        let mount_path = self.cfg.mount_path.clone();
        match self.mount_spawn_helper(key, MountExecCommand::Mount, &mount_path, &args) {
            Ok(()) => {
                info!("Mounting {}...", where_.display());
                self.arm_unit_timer(key, timeout);
                self.mount_set_state(key, MountState::Mounting);
            }
            Err(e) => {
                warn!(unit = %name, "failed to run mount helper: {:#}", e);
                self.mount_enter_dead(key, MountResult::Resources);
            }
        }
    }

    fn mount_enter_unmounting(&mut self, key: UnitKey) {
        let (name, where_, lazy, force, timeout, state) = {
            let m = self.units.unit(key).mount().unwrap();
            (
                self.units.unit(key).name.clone(),
                m.where_.clone(),
                m.lazy_unmount,
                m.force_unmount,
                m.timeout,
                m.state,
            )
        };

        // The retry counter starts over when we begin unmounting; re-entries
        // from the retry loop keep counting up.
        if !state.in_unmounting_flow() {
            self.units.unit_mut(key).mount_mut().unwrap().n_retry_umount = 0;
        }

        let args = umount_command_args(&where_, lazy, force);

        let umount_path = self.cfg.umount_path.clone();
        match self.mount_spawn_helper(key, MountExecCommand::Unmount, &umount_path, &args) {
            Ok(()) => {
                info!("Unmounting {}...", where_.display());
                self.arm_unit_timer(key, timeout);
                self.mount_set_state(key, MountState::Unmounting);
            }
            Err(e) => {
                warn!(unit = %name, "failed to run umount helper: {:#}", e);
                self.mount_enter_mounted(key, MountResult::Resources);
            }
        }
    }

    fn mount_enter_remounting(&mut self, key: UnitKey) {
        let (name, where_, sloppy, params, timeout) = {
            let unit = self.units.unit(key);
            let m = unit.mount().unwrap();
            (
                unit.name.clone(),
                m.where_.clone(),
                m.sloppy_options,
                m.parameters().cloned(),
                m.timeout,
            )
        };

        let args = params
            .as_ref()
            .and_then(|p| mount_command_args(&where_, p, sloppy, true));

        let Some(args) = args else {
            warn!(unit = %name, "no mount parameters to operate on");
            let m = self.units.unit_mut(key).mount_mut().unwrap();
            m.reload_result = MountResult::Resources;
            return;
        };

        let mount_path = self.cfg.mount_path.clone();
        match self.mount_spawn_helper(key, MountExecCommand::Remount, &mount_path, &args) {
            Ok(()) => {
                self.arm_unit_timer(key, timeout);
                self.mount_set_state(key, MountState::Remounting);
            }
            Err(e) => {
                warn!(unit = %name, "failed to run remount helper: {:#}", e);
                let m = self.units.unit_mut(key).mount_mut().unwrap();
                if m.reload_result == MountResult::Success {
                    m.reload_result = MountResult::Resources;
                }
                self.mount_enter_dead_or_mounted(key, MountResult::Success);
            }
        }
    }

    /// Sends a signal to the helper and moves to the corresponding kill
    /// state, or skips ahead if there is nobody to signal (or SIGKILL is not
    /// permitted).
    fn mount_enter_signal(&mut self, key: UnitKey, state: MountState, f: MountResult) {
        {
            let m = self.units.unit_mut(key).mount_mut().unwrap();
            if !m.state.in_remounting_flow() && m.result == MountResult::Success {
                m.result = f;
            }
        }

        let signal = match state {
            MountState::MountingSigterm
            | MountState::RemountingSigterm
            | MountState::UnmountingSigterm => self.cfg.kill_signal,
            _ => Signal::Kill,
        };

        let killed = {
            let m = self.units.unit(key).mount().unwrap();
            match &m.control {
                Some(control) => control.handle.signal(signal).is_ok(),
                None => false,
            }
        };

        if killed {
            let timeout = self.units.unit(key).mount().unwrap().timeout;
            self.arm_unit_timer(key, timeout);
            self.mount_set_state(key, state);
        } else if matches!(
            state,
            MountState::MountingSigterm
                | MountState::RemountingSigterm
                | MountState::UnmountingSigterm
        ) && self.cfg.send_sigkill
        {
            let next = match state {
                MountState::MountingSigterm => MountState::MountingSigkill,
                MountState::RemountingSigterm => MountState::RemountingSigkill,
                MountState::UnmountingSigterm => MountState::UnmountingSigkill,
                _ => unreachable!(),
            };
            self.mount_enter_signal(key, next, f);
        } else {
            self.mount_enter_dead_or_mounted(key, f);
        }
    }

    fn mount_spawn_helper(
        &mut self,
        key: UnitKey,
        command: MountExecCommand,
        exe: &Path,
        args: &[OsString],
    ) -> anyhow::Result<()> {
        let (name, stdio_null) = {
            let unit = self.units.unit(key);
            // The root mount must not hold open a logging pipe; it would
            // pin the mount hierarchy the log sink lives on.
            (unit.name.clone(), unit.perpetual)
        };

        // Any previous helper (e.g. an unkillable one we gave up on) loses
        // its claim on the unit.
        self.discard_control_child(key);

        exec::acquire_runtime_dir(&self.cfg.run_dir, &name)?;

        let handle = exec::spawn_helper(exe, args, stdio_null)?;
        self.watch_control_child(key, handle)?;

        let m = self.units.unit_mut(key).mount_mut().unwrap();
        m.control_command = Some(command);

        Ok(())
    }

    /// A helper of ours terminated.
    pub(crate) fn mount_sigchld_event(&mut self, key: UnitKey, exit: ChildExit) {
        let f = match exit {
            ChildExit::Exited { status: 0 } => MountResult::Success,
            ChildExit::Exited { .. } => MountResult::ExitCode,
            ChildExit::Signaled { core_dumped: true, .. } => MountResult::CoreDump,
            ChildExit::Signaled { .. } => MountResult::Signal,
        };

        let (name, state, still_mounted, n_retry) = {
            let unit = self.units.unit_mut(key);
            let name = unit.name.clone();
            let m = match unit.mount_mut() {
                Some(m) => m,
                None => return,
            };

            m.control_command = None;
            (name, m.state, m.from_proc_self_mountinfo, m.n_retry_umount)
        };

        self.discard_control_child(key);

        debug!(unit = %name, ?exit, state = state.as_str(), "mount helper exited");

        {
            let m = self.units.unit_mut(key).mount_mut().unwrap();
            if state.in_remounting_flow() {
                if m.reload_result == MountResult::Success {
                    m.reload_result = f;
                }
            } else if m.result == MountResult::Success {
                m.result = f;
            }
        }

        match state {
            s if s.in_mounting_flow() => {
                // When the helper reports success we take its word for it;
                // the kernel entry follows shortly if it isn't there yet.
                if f == MountResult::Success || still_mounted {
                    self.mount_enter_mounted(key, f);
                } else {
                    self.mount_enter_dead(key, f);
                }
            }
            s if s.in_remounting_flow() => {
                self.mount_enter_dead_or_mounted(key, MountResult::Success);
            }
            s if s.in_unmounting_flow() => {
                if still_mounted {
                    if f == MountResult::Success && n_retry < RETRY_UMOUNT_MAX {
                        // The umount helper raced a new mount or the kernel
                        // hasn't caught up; try again.
                        let m = self.units.unit_mut(key).mount_mut().unwrap();
                        m.n_retry_umount += 1;
                        self.mount_enter_unmounting(key);
                    } else {
                        // Give up gracefully; the mount is evidently there.
                        self.mount_enter_mounted(key, f);
                    }
                } else {
                    self.mount_enter_dead(key, f);
                }
            }
            _ => {
                // A stale child from before a state change; nothing to do.
                debug!(unit = %name, "ignoring helper exit in state {}", state.as_str());
            }
        }
    }

    /// The per-unit timer fired: escalate.
    pub(crate) fn mount_timer_event(&mut self, key: UnitKey) {
        let (where_, state) = {
            let unit = self.units.unit(key);
            let m = match unit.mount() {
                Some(m) => m,
                None => return,
            };
            (m.where_.clone(), m.state)
        };

        match state {
            MountState::Mounting | MountState::MountingDone => {
                warn!("Timed out mounting {}.", where_.display());
                self.mount_enter_signal(key, MountState::MountingSigterm, MountResult::Timeout);
            }
            MountState::Remounting => {
                // A reload that times out does not unmount; only the reload
                // result records the timeout.
                let m = self.units.unit_mut(key).mount_mut().unwrap();
                if m.reload_result == MountResult::Success {
                    m.reload_result = MountResult::Timeout;
                }
                self.mount_enter_signal(key, MountState::RemountingSigterm, MountResult::Success);
            }
            MountState::Unmounting => {
                warn!("Timed out unmounting {}.", where_.display());
                self.mount_enter_signal(key, MountState::UnmountingSigterm, MountResult::Timeout);
            }
            MountState::MountingSigterm => {
                if self.cfg.send_sigkill {
                    self.mount_enter_signal(
                        key,
                        MountState::MountingSigkill,
                        MountResult::Timeout,
                    );
                } else {
                    self.mount_enter_dead_or_mounted(key, MountResult::Timeout);
                }
            }
            MountState::RemountingSigterm => {
                let m = self.units.unit_mut(key).mount_mut().unwrap();
                if m.reload_result == MountResult::Success {
                    m.reload_result = MountResult::Timeout;
                }

                if self.cfg.send_sigkill {
                    self.mount_enter_signal(
                        key,
                        MountState::RemountingSigkill,
                        MountResult::Success,
                    );
                } else {
                    self.mount_enter_dead_or_mounted(key, MountResult::Success);
                }
            }
            MountState::UnmountingSigterm => {
                if self.cfg.send_sigkill {
                    self.mount_enter_signal(
                        key,
                        MountState::UnmountingSigkill,
                        MountResult::Timeout,
                    );
                } else {
                    self.mount_enter_dead_or_mounted(key, MountResult::Timeout);
                }
            }
            MountState::MountingSigkill | MountState::UnmountingSigkill => {
                // The helper shrugged off SIGKILL; stop waiting for it.
                self.mount_enter_dead_or_mounted(key, MountResult::Timeout);
            }
            MountState::RemountingSigkill => {
                let m = self.units.unit_mut(key).mount_mut().unwrap();
                if m.reload_result == MountResult::Success {
                    m.reload_result = MountResult::Timeout;
                }
                self.mount_enter_dead_or_mounted(key, MountResult::Success);
            }
            MountState::Dead | MountState::Mounted | MountState::Failed => {
                debug!("stale timer expiry in state {}", state.as_str());
            }
        }
    }

    /// Applies a fragment to a unit and synthesizes its dependencies. Runs
    /// once per unit off the load queue.
    pub(crate) fn mount_load(&mut self, key: UnitKey) {
        let loaded = {
            let unit = self.units.unit(key);
            let m = unit.mount().unwrap();
            m.from_fragment || m.from_proc_self_mountinfo
        };

        if !loaded {
            self.units.unit_mut(key).load_state = crate::units::LoadState::NotFound;
            return;
        }

        self.mount_add_mount_links(key);
        self.mount_add_device_links(key);
        self.mount_add_quota_links(key);
        self.mount_add_default_dependencies(key);

        self.units.unit_mut(key).load_state = crate::units::LoadState::Loaded;
    }

    /// Ordering and requirement edges derived from path containment: this
    /// mount needs its parent mounted first, and units that require a path
    /// below `where` need this mount.
    fn mount_add_mount_links(&mut self, key: UnitKey) {
        let (where_, params, from_fragment) = {
            let unit = self.units.unit(key);
            let m = unit.mount().unwrap();
            (m.where_.clone(), m.parameters().cloned(), m.from_fragment)
        };

        // The parent mount point has to be there before us.
        if where_ != Path::new("/") {
            if let Some(parent) = where_.parent() {
                let unit = self.units.unit_mut(key);
                let parent = parent.to_path_buf();
                if !unit.requires_mounts_for.contains(&parent) {
                    unit.requires_mounts_for.push(parent);
                }
            }
        }

        // Same for the backing path of bind, loop, and other local mounts.
        if let Some(p) = &params {
            if let Some(what) = &p.what {
                if what.is_absolute() && (p.is_bind() || p.is_loop() || !p.is_network()) {
                    let unit = self.units.unit_mut(key);
                    if !unit.requires_mounts_for.contains(what) {
                        unit.requires_mounts_for.push(what.clone());
                    }
                }
            }
        }

        // Units that require a path at or below our mount point depend on
        // us being mounted.
        let dependents: Vec<UnitKey> = self
            .units
            .iter()
            .filter(|(other, _)| *other != key)
            .filter(|(_, u)| {
                u.requires_mounts_for
                    .iter()
                    .any(|p| p == &where_ || p.starts_with(&where_))
            })
            .map(|(k, _)| k)
            .collect();

        for other in dependents {
            self.units.add_dependency(other, Dependency::After, key);
            if from_fragment {
                self.units.add_dependency(other, Dependency::Requires, key);
            }
        }

        // And the inverse: if a mount that contains our paths is already
        // registered, order us after it.
        let wanted: Vec<PathBuf> = self.units.unit(key).requires_mounts_for.clone();
        let providers: Vec<UnitKey> = self
            .units
            .iter()
            .filter(|(other, _)| *other != key)
            .filter_map(|(k, u)| u.mount().map(|m| (k, m)))
            .filter(|(_, m)| wanted.iter().any(|p| p == &m.where_ || p.starts_with(&m.where_)))
            .map(|(k, _)| k)
            .collect();

        for provider in providers {
            self.units.add_dependency(key, Dependency::After, provider);
            if self.units.unit(key).mount().unwrap().from_fragment {
                self.units.add_dependency(key, Dependency::Requires, provider);
            }
        }
    }

    /// A mount backed by a device node is tied to the corresponding device
    /// unit.
    fn mount_add_device_links(&mut self, key: UnitKey) {
        let (where_, params, device_bound, auto_wants) = {
            let unit = self.units.unit(key);
            let m = unit.mount().unwrap();

            let auto_wants = m
                .parameters()
                .map(|p| p.is_auto() && !p.is_automount())
                .unwrap_or(false)
                && self.cfg.scope.is_system();

            (
                m.where_.clone(),
                m.parameters().cloned(),
                m.device_bound,
                auto_wants,
            )
        };

        let Some(what) = params.as_ref().and_then(|p| p.what.clone()) else {
            return;
        };

        if !what.starts_with("/dev") || what == Path::new("/dev/root") || where_ == Path::new("/")
        {
            return;
        }

        let device_name = match unit_name::device_from_path(&what) {
            Ok(name) => name,
            Err(_) => return,
        };

        let device = self.units.ensure_device(&device_name, &what);

        let kind = if device_bound {
            Dependency::BindsTo
        } else {
            Dependency::Requires
        };
        self.units.add_dependency(key, kind, device);
        self.units.add_dependency(key, Dependency::After, device);

        // Plugging the device pulls the mount in.
        if auto_wants {
            self.units.add_dependency(device, Dependency::Wants, key);
        }
    }

    fn mount_add_quota_links(&mut self, key: UnitKey) {
        if !self.cfg.scope.is_system() {
            return;
        }

        let needs_quota = self
            .units
            .unit(key)
            .mount()
            .unwrap()
            .parameters()
            .map(|p| p.needs_quota())
            .unwrap_or(false);

        if !needs_quota {
            return;
        }

        for service in [QUOTACHECK_SERVICE, QUOTAON_SERVICE] {
            self.units
                .add_dependency_by_name(key, Dependency::Before, service);
            self.units
                .add_dependency_by_name(key, Dependency::Wants, service);
        }
    }

    fn mount_add_default_dependencies(&mut self, key: UnitKey) {
        let (where_, params, default_deps) = {
            let unit = self.units.unit(key);
            let m = unit.mount().unwrap();
            (m.where_.clone(), m.parameters().cloned(), unit.default_dependencies)
        };

        if !default_deps {
            return;
        }

        let params = params.unwrap_or_default();
        if options::is_extrinsic(self.cfg.scope, &where_, &params, self.in_initrd) {
            return;
        }

        if params.is_network() {
            self.units
                .add_dependency_by_name(key, Dependency::After, NETWORK_TARGET);
            self.units
                .add_dependency_by_name(key, Dependency::Wants, NETWORK_ONLINE_TARGET);
            self.units
                .add_dependency_by_name(key, Dependency::After, NETWORK_ONLINE_TARGET);
            self.units
                .add_dependency_by_name(key, Dependency::After, REMOTE_FS_PRE_TARGET);
        } else {
            self.units
                .add_dependency_by_name(key, Dependency::After, LOCAL_FS_PRE_TARGET);
        }

        // Stopping umount.target on shutdown unmounts us.
        self.units
            .add_dependency_by_name(key, Dependency::Conflicts, UMOUNT_TARGET);
        self.units
            .add_dependency_by_name(key, Dependency::Before, UMOUNT_TARGET);
    }
}

fn log_finished(where_: &Path, old: MountState, now_mounted: bool, result: MountResult) {
    if old.in_mounting_flow() {
        match result {
            MountResult::Success if now_mounted => info!("Mounted {}.", where_.display()),
            MountResult::Timeout => warn!("Timed out mounting {}.", where_.display()),
            MountResult::Success => {}
            _ => warn!("Failed to mount {}.", where_.display()),
        }
    } else if old.in_unmounting_flow() {
        match result {
            MountResult::Success if !now_mounted => info!("Unmounted {}.", where_.display()),
            MountResult::Timeout => warn!("Timed out unmounting {}.", where_.display()),
            MountResult::Success => {}
            _ => warn!("Failed unmounting {}.", where_.display()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(
        what: Option<&str>,
        options: Option<&str>,
        fstype: Option<&str>,
    ) -> MountParameters {
        MountParameters {
            what: what.map(PathBuf::from),
            options: options.map(str::to_string),
            fstype: fstype.map(str::to_string),
        }
    }

    #[test]
    fn test_mount_args() {
        let p = params(Some("/dev/sda1"), Some("rw,noauto,nofail"), Some("ext4"));
        let args = mount_command_args(Path::new("/mnt/data"), &p, false, false).unwrap();
        assert_eq!(
            args,
            ["/dev/sda1", "/mnt/data", "-t", "ext4", "-o", "rw"]
                .map(OsString::from)
                .to_vec()
        );

        // Sloppy options add -s; no options or fstype drops the flags.
        let p = params(Some("//host/share"), None, None);
        let args = mount_command_args(Path::new("/mnt/share"), &p, true, false).unwrap();
        assert_eq!(
            args,
            ["//host/share", "/mnt/share", "-s"].map(OsString::from).to_vec()
        );

        // No what, no invocation.
        let p = params(None, None, Some("tmpfs"));
        assert!(mount_command_args(Path::new("/mnt/x"), &p, false, false).is_none());
    }

    #[test]
    fn test_remount_args() {
        let p = params(Some("/dev/sda1"), Some("ro"), Some("ext4"));
        let args = mount_command_args(Path::new("/mnt/data"), &p, false, true).unwrap();
        assert_eq!(
            args,
            ["/dev/sda1", "/mnt/data", "-o", "remount,ro", "-t", "ext4"]
                .map(OsString::from)
                .to_vec()
        );

        let p = params(Some("/dev/sda1"), None, None);
        let args = mount_command_args(Path::new("/mnt/data"), &p, false, true).unwrap();
        assert_eq!(
            args,
            ["/dev/sda1", "/mnt/data", "-o", "remount"].map(OsString::from).to_vec()
        );
    }

    #[test]
    fn test_umount_args() {
        assert_eq!(
            umount_command_args(Path::new("/srv"), false, false),
            ["/srv", "-c"].map(OsString::from).to_vec()
        );
        assert_eq!(
            umount_command_args(Path::new("/srv"), true, false),
            ["/srv", "-c", "-l"].map(OsString::from).to_vec()
        );
        assert_eq!(
            umount_command_args(Path::new("/srv"), true, true),
            ["/srv", "-c", "-l", "-f"].map(OsString::from).to_vec()
        );
    }

    #[test]
    fn test_state_strings() {
        for state in [
            MountState::Dead,
            MountState::Mounting,
            MountState::MountingDone,
            MountState::Mounted,
            MountState::Remounting,
            MountState::Unmounting,
            MountState::MountingSigterm,
            MountState::MountingSigkill,
            MountState::RemountingSigterm,
            MountState::RemountingSigkill,
            MountState::UnmountingSigterm,
            MountState::UnmountingSigkill,
            MountState::Failed,
        ] {
            assert_eq!(MountState::from_str(state.as_str()), Some(state));
        }

        assert_eq!(MountState::from_str("bogus"), None);
    }

    #[test]
    fn test_active_state_table() {
        use MountState::*;

        assert_eq!(Dead.active_state(), ActiveState::Inactive);
        assert_eq!(Mounting.active_state(), ActiveState::Activating);
        assert_eq!(MountingDone.active_state(), ActiveState::Active);
        assert_eq!(Mounted.active_state(), ActiveState::Active);
        assert_eq!(Remounting.active_state(), ActiveState::Reloading);
        assert_eq!(RemountingSigterm.active_state(), ActiveState::Reloading);
        assert_eq!(RemountingSigkill.active_state(), ActiveState::Reloading);
        assert_eq!(Unmounting.active_state(), ActiveState::Deactivating);
        assert_eq!(MountingSigterm.active_state(), ActiveState::Deactivating);
        assert_eq!(MountingSigkill.active_state(), ActiveState::Deactivating);
        assert_eq!(UnmountingSigterm.active_state(), ActiveState::Deactivating);
        assert_eq!(UnmountingSigkill.active_state(), ActiveState::Deactivating);
        assert_eq!(Failed.active_state(), ActiveState::Failed);
    }

    #[test]
    fn test_result_strings() {
        assert_eq!(MountResult::ExitCode.as_str(), "exit-code");
        assert_eq!(MountResult::from_str("start-limit-hit"), Some(MountResult::StartLimitHit));
        assert_eq!(MountResult::from_str("core-dump"), Some(MountResult::CoreDump));
    }

    #[test]
    fn test_exec_command_strings() {
        assert_eq!(MountExecCommand::Mount.as_str(), "ExecMount");
        assert_eq!(
            MountExecCommand::from_str("ExecRemount"),
            Some(MountExecCommand::Remount)
        );
    }

    #[test]
    fn test_set_mountinfo_parameters_reports_changes() {
        let mut m = MountUnit::new(PathBuf::from("/mnt/data"), time::Duration::from_secs(90));

        let p = params(Some("/dev/sda1"), Some("rw"), Some("ext4"));
        assert!(m.set_mountinfo_parameters(p.clone()));
        assert!(!m.set_mountinfo_parameters(p.clone()));

        let q = params(Some("/dev/sda1"), Some("ro"), Some("ext4"));
        assert!(m.set_mountinfo_parameters(q));
    }
}
