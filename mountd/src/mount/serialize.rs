// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! Dump and restore of per-unit state, so a re-exec of the manager doesn't
//! lose track of in-flight helpers.

use std::io::Write;
use std::time;

use anyhow::Context as _;
use tracing::{debug, warn};

use crate::exec::{ChildExit, ChildHandle};
use crate::manager::{now_monotonic_usec, Manager};
use crate::mount::{MountExecCommand, MountResult, MountState};

const STATE_FILE: &str = "deserialization";

impl Manager {
    pub(crate) fn serialize_units(&self, out: &mut impl Write) -> std::io::Result<()> {
        for key in self.units.mounts() {
            let unit = self.units.unit(key);
            let m = unit.mount().unwrap();

            writeln!(out, "unit={}", unit.name)?;
            writeln!(out, "state={}", m.state.as_str())?;
            writeln!(out, "result={}", m.result.as_str())?;
            writeln!(out, "reload-result={}", m.reload_result.as_str())?;
            if let Some(pid) = m.control_pid() {
                writeln!(out, "control-pid={}", pid)?;
            }
            if let Some(cmd) = m.control_command {
                writeln!(out, "control-command={}", cmd.as_str())?;
            }
            writeln!(out, "state-change-timestamp={}", m.state_change_usec)?;
            writeln!(out)?;
        }

        Ok(())
    }

    pub(crate) fn save_state(&self) -> anyhow::Result<()> {
        let path = self.cfg.run_dir.join(STATE_FILE);
        let mut out = Vec::new();
        self.serialize_units(&mut out)?;

        std::fs::write(&path, out).with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }

    /// Reads back a state dump left by a previous incarnation. Values land
    /// in the deserialized fields; coldplug applies them.
    pub(crate) fn restore_state(&mut self) -> anyhow::Result<()> {
        let path = self.cfg.run_dir.join(STATE_FILE);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e).context(format!("reading {}", path.display())),
        };

        let mut current = None;
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let Some((k, v)) = line.split_once('=') else {
                continue;
            };

            if k == "unit" {
                current = self.units.get(v);
                if current.is_none() {
                    debug!(unit = v, "ignoring state for unknown unit");
                }
                continue;
            }

            let Some(key) = current else { continue };
            let Some(m) = self.units.unit_mut(key).mount_mut() else {
                continue;
            };

            match k {
                "state" => m.deserialized_state = MountState::from_str(v),
                "result" => {
                    if let Some(result) = MountResult::from_str(v) {
                        m.result = result;
                    }
                }
                "reload-result" => {
                    if let Some(result) = MountResult::from_str(v) {
                        m.reload_result = result;
                    }
                }
                "control-pid" => m.deserialized_pid = v.parse().ok(),
                "control-command" => m.control_command = MountExecCommand::from_str(v),
                "state-change-timestamp" => {
                    m.state_change_usec = v.parse().unwrap_or(0);
                }
                _ => debug!(key = k, "ignoring unknown serialization key"),
            }
        }

        let _ = std::fs::remove_file(&path);
        Ok(())
    }

    /// Applies deserialized state after enumeration. Helper-active states
    /// re-attach to their pid and re-arm the timer at the original deadline;
    /// a pid that can't be watched anymore is treated as an exit we missed.
    pub(crate) fn coldplug_mounts(&mut self) {
        for key in self.units.mounts() {
            let (name, state, deserialized, pid, from_mountinfo, timeout, changed_usec) = {
                let unit = self.units.unit_mut(key);
                let name = unit.name.clone();
                let m = unit.mount_mut().unwrap();
                (
                    name,
                    m.state,
                    m.deserialized_state.take(),
                    m.deserialized_pid.take(),
                    m.from_proc_self_mountinfo,
                    m.timeout,
                    m.state_change_usec,
                )
            };

            let new_state = match deserialized {
                Some(s) if s != state => s,
                _ if from_mountinfo => MountState::Mounted,
                _ => continue,
            };

            if new_state == state {
                continue;
            }

            if !matches!(new_state, MountState::Dead | MountState::Failed) {
                // The unit is coming back non-idle; it needs its execution
                // context again.
                if let Err(e) = crate::exec::acquire_runtime_dir(&self.cfg.run_dir, &name) {
                    debug!(unit = %name, "failed to reacquire runtime dir: {:#}", e);
                }
            }

            if new_state.has_control_process() {
                let watched = pid.and_then(|pid| match ChildHandle::watch_existing(pid) {
                    Ok(handle) => Some(handle),
                    Err(e) => {
                        debug!(unit = %name, pid, "helper gone across exec: {:#}", e);
                        None
                    }
                });

                match watched {
                    Some(handle) => {
                        if let Err(e) = self.watch_control_child(key, handle) {
                            warn!(unit = %name, "failed to watch helper: {:#}", e);
                            continue;
                        }

                        // Re-arm at the original deadline.
                        let deadline = changed_usec.saturating_add(timeout.as_micros() as u64);
                        let remaining = deadline.saturating_sub(now_monotonic_usec()).max(1);
                        self.arm_unit_timer(key, time::Duration::from_micros(remaining));

                        let m = self.units.unit_mut(key).mount_mut().unwrap();
                        m.state = new_state;
                    }
                    None => {
                        // We missed the exit; let the regular completion path
                        // reconcile against the kernel table.
                        let m = self.units.unit_mut(key).mount_mut().unwrap();
                        m.state = new_state;
                        self.mount_sigchld_event(key, ChildExit::Exited { status: 0 });
                    }
                }
            } else {
                self.mount_set_state(key, new_state);
            }
        }
    }
}
