// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! The unit registry. Mount units are the only kind with behavior of their
//! own; device, target, and service units exist as passive nodes so that
//! dependency edges have endpoints.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::time;

use slotmap::SlotMap;
use uuid::Uuid;

use crate::mount::MountUnit;

pub const LOCAL_FS_TARGET: &str = "local-fs.target";
pub const REMOTE_FS_TARGET: &str = "remote-fs.target";
pub const LOCAL_FS_PRE_TARGET: &str = "local-fs-pre.target";
pub const REMOTE_FS_PRE_TARGET: &str = "remote-fs-pre.target";
pub const NETWORK_TARGET: &str = "network.target";
pub const NETWORK_ONLINE_TARGET: &str = "network-online.target";
pub const UMOUNT_TARGET: &str = "umount.target";
pub const QUOTACHECK_SERVICE: &str = "quotacheck.service";
pub const QUOTAON_SERVICE: &str = "quotaon.service";

slotmap::new_key_type! {
    pub struct UnitKey;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Dependency {
    Requires,
    Wants,
    BindsTo,
    Before,
    After,
    Conflicts,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveState {
    Inactive,
    Activating,
    Active,
    Reloading,
    Deactivating,
    Failed,
}

impl ActiveState {
    pub fn as_str(self) -> &'static str {
        match self {
            ActiveState::Inactive => "inactive",
            ActiveState::Activating => "activating",
            ActiveState::Active => "active",
            ActiveState::Reloading => "reloading",
            ActiveState::Deactivating => "deactivating",
            ActiveState::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    Stub,
    Loaded,
    NotFound,
}

/// A device node referenced by some mount. Passive; its only state is
/// whether any current mount references it.
#[derive(Debug, Clone)]
pub struct DeviceUnit {
    pub path: PathBuf,
    pub found_by_mount: bool,
}

pub enum UnitData {
    Mount(MountUnit),
    Device(DeviceUnit),
    /// A target or service owned by some other part of the system. We only
    /// hold edges to it.
    Node,
}

pub struct Unit {
    pub name: String,
    pub data: UnitData,
    pub load_state: LoadState,
    pub perpetual: bool,
    pub default_dependencies: bool,
    pub invocation_id: Option<Uuid>,
    pub requires_mounts_for: Vec<PathBuf>,
    pub start_limit: RateLimit,
    pub deps: BTreeMap<Dependency, BTreeSet<UnitKey>>,
}

impl Unit {
    pub fn new(name: String, data: UnitData, start_limit: RateLimit) -> Self {
        Self {
            name,
            data,
            load_state: LoadState::Stub,
            perpetual: false,
            default_dependencies: true,
            invocation_id: None,
            requires_mounts_for: Vec::new(),
            start_limit,
            deps: BTreeMap::new(),
        }
    }

    pub fn mount(&self) -> Option<&MountUnit> {
        match &self.data {
            UnitData::Mount(m) => Some(m),
            _ => None,
        }
    }

    pub fn mount_mut(&mut self) -> Option<&mut MountUnit> {
        match &mut self.data {
            UnitData::Mount(m) => Some(m),
            _ => None,
        }
    }

    pub fn active_state(&self) -> ActiveState {
        match &self.data {
            UnitData::Mount(m) => m.state.active_state(),
            UnitData::Device(d) => {
                if d.found_by_mount {
                    ActiveState::Active
                } else {
                    ActiveState::Inactive
                }
            }
            UnitData::Node => ActiveState::Inactive,
        }
    }

    pub fn has_dependency(&self, kind: Dependency, other: UnitKey) -> bool {
        self.deps.get(&kind).is_some_and(|set| set.contains(&other))
    }
}

#[derive(Default)]
pub struct Units {
    units: SlotMap<UnitKey, Unit>,
    by_name: HashMap<String, UnitKey>,
    load_queue: Vec<UnitKey>,
}

impl Units {
    pub fn get(&self, name: &str) -> Option<UnitKey> {
        self.by_name.get(name).copied()
    }

    pub fn unit(&self, key: UnitKey) -> &Unit {
        &self.units[key]
    }

    pub fn unit_mut(&mut self, key: UnitKey) -> &mut Unit {
        &mut self.units[key]
    }

    pub fn contains(&self, key: UnitKey) -> bool {
        self.units.contains_key(key)
    }

    pub fn insert(&mut self, unit: Unit) -> UnitKey {
        let name = unit.name.clone();
        let key = self.units.insert(unit);
        self.by_name.insert(name, key);
        key
    }

    /// Looks up a passive target/service node, creating it if needed.
    pub fn ensure_node(&mut self, name: &str) -> UnitKey {
        if let Some(key) = self.get(name) {
            return key;
        }

        let mut unit = Unit::new(name.to_string(), UnitData::Node, RateLimit::off());
        unit.load_state = LoadState::Loaded;
        self.insert(unit)
    }

    /// Looks up the device unit for a node path, creating it if needed.
    pub fn ensure_device(&mut self, name: &str, path: &Path) -> UnitKey {
        if let Some(key) = self.get(name) {
            return key;
        }

        let mut unit = Unit::new(
            name.to_string(),
            UnitData::Device(DeviceUnit {
                path: path.to_path_buf(),
                found_by_mount: false,
            }),
            RateLimit::off(),
        );
        unit.load_state = LoadState::Loaded;
        self.insert(unit)
    }

    pub fn enqueue_load(&mut self, key: UnitKey) {
        if !self.load_queue.contains(&key) {
            self.load_queue.push(key);
        }
    }

    pub fn take_load_queue(&mut self) -> Vec<UnitKey> {
        std::mem::take(&mut self.load_queue)
    }

    /// Adds a dependency edge. Before/After edges also record their inverse
    /// on the other unit, the way ordering edges are usually consumed.
    pub fn add_dependency(&mut self, from: UnitKey, kind: Dependency, to: UnitKey) {
        if from == to {
            return;
        }

        self.units[from].deps.entry(kind).or_default().insert(to);

        let inverse = match kind {
            Dependency::Before => Some(Dependency::After),
            Dependency::After => Some(Dependency::Before),
            _ => None,
        };
        if let Some(inverse) = inverse {
            self.units[to].deps.entry(inverse).or_default().insert(from);
        }
    }

    pub fn add_dependency_by_name(&mut self, from: UnitKey, kind: Dependency, to: &str) {
        let to = self.ensure_node(to);
        self.add_dependency(from, kind, to);
    }

    /// Removes a unit and every edge pointing at it.
    pub fn release(&mut self, key: UnitKey) {
        if let Some(unit) = self.units.remove(key) {
            self.by_name.remove(&unit.name);
        }

        self.load_queue.retain(|k| *k != key);
        for (_, unit) in self.units.iter_mut() {
            for set in unit.deps.values_mut() {
                set.remove(&key);
            }
        }
    }

    pub fn keys(&self) -> Vec<UnitKey> {
        self.units.keys().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (UnitKey, &Unit)> {
        self.units.iter()
    }

    /// Every mount unit, in registry order.
    pub fn mounts(&self) -> Vec<UnitKey> {
        self.units
            .iter()
            .filter(|(_, u)| matches!(u.data, UnitData::Mount(_)))
            .map(|(k, _)| k)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

/// Start rate limiting: at most `burst` attempts per `interval`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimit {
    interval: time::Duration,
    burst: u32,
    begin: Option<time::Instant>,
    num: u32,
}

impl RateLimit {
    pub fn new(interval: time::Duration, burst: u32) -> Self {
        Self { interval, burst, begin: None, num: 0 }
    }

    /// A limiter that never fires.
    pub fn off() -> Self {
        Self::new(time::Duration::ZERO, 0)
    }

    /// Records an attempt. Returns false if the limit has been hit.
    pub fn check(&mut self) -> bool {
        if self.interval.is_zero() || self.burst == 0 {
            return true;
        }

        let now = time::Instant::now();
        match self.begin {
            Some(begin) if now.duration_since(begin) < self.interval => {
                self.num += 1;
                self.num <= self.burst
            }
            _ => {
                self.begin = Some(now);
                self.num = 1;
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ratelimit() {
        let mut rl = RateLimit::new(time::Duration::from_secs(60), 2);
        assert!(rl.check());
        assert!(rl.check());
        assert!(!rl.check());

        let mut off = RateLimit::off();
        for _ in 0..100 {
            assert!(off.check());
        }
    }

    #[test]
    fn test_dependency_inverse() {
        let mut units = Units::default();
        let a = units.ensure_node("a.target");
        let b = units.ensure_node("b.target");

        units.add_dependency(a, Dependency::Before, b);
        assert!(units.unit(a).has_dependency(Dependency::Before, b));
        assert!(units.unit(b).has_dependency(Dependency::After, a));

        // Idempotent.
        units.add_dependency(a, Dependency::Before, b);
        assert_eq!(units.unit(a).deps[&Dependency::Before].len(), 1);
    }

    #[test]
    fn test_release_sweeps_edges() {
        let mut units = Units::default();
        let a = units.ensure_node("a.target");
        let b = units.ensure_node("b.target");
        units.add_dependency(a, Dependency::Requires, b);

        units.release(b);
        assert!(units.get("b.target").is_none());
        assert!(!units.unit(a).has_dependency(Dependency::Requires, b));
    }
}
