// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

use std::path::{Path, PathBuf};
use std::time;

use anyhow::{bail, Context};
use lazy_static::lazy_static;
use tracing::{debug, warn};

use crate::unit_name;

lazy_static! {
    static ref DEFAULT_CFG: parsed::Config =
        toml::from_str(include_str!("../mountd.default.toml")).unwrap();
}

/// Serde representations of the configuration files.
mod parsed {
    use converge::Converge;
    use serde::Deserialize;
    use std::path::PathBuf;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub(super) enum Scope {
        System,
        User,
    }

    #[derive(Debug, Clone, PartialEq, Deserialize, Converge)]
    pub(super) struct Config {
        #[converge(nest)]
        pub(super) manager: Option<ManagerConfig>,
    }

    #[derive(Debug, Clone, PartialEq, Deserialize, Converge)]
    #[serde(deny_unknown_fields)]
    pub(super) struct ManagerConfig {
        pub(super) scope: Option<Scope>,
        pub(super) default_timeout: Option<u64>,
        pub(super) send_sigkill: Option<bool>,
        pub(super) kill_signal: Option<String>,
        pub(super) start_limit_interval: Option<u64>,
        pub(super) start_limit_burst: Option<u32>,
        pub(super) run_dir: Option<PathBuf>,
        pub(super) fragment_dirs: Option<Vec<PathBuf>>,
        pub(super) mount_path: Option<PathBuf>,
        pub(super) umount_path: Option<PathBuf>,
    }

    /// One mount fragment file.
    #[derive(Debug, Clone, PartialEq, Deserialize)]
    #[serde(deny_unknown_fields)]
    pub(super) struct Fragment {
        pub(super) mount: FragmentMount,
    }

    #[derive(Debug, Clone, PartialEq, Deserialize)]
    #[serde(deny_unknown_fields)]
    pub(super) struct FragmentMount {
        #[serde(rename = "where")]
        pub(super) where_: PathBuf,
        pub(super) what: Option<PathBuf>,
        #[serde(rename = "type")]
        pub(super) fstype: Option<String>,
        pub(super) options: Option<String>,
        pub(super) sloppy_options: Option<bool>,
        pub(super) lazy_unmount: Option<bool>,
        pub(super) force_unmount: Option<bool>,
        pub(super) directory_mode: Option<u32>,
        pub(super) timeout: Option<u64>,
        pub(super) device_bound: Option<bool>,
        pub(super) default_dependencies: Option<bool>,
        pub(super) auto: Option<bool>,
    }
}

/// Whether this is the system-wide manager or a per-user one. A user manager
/// treats every mount it sees as extrinsic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    System,
    User,
}

impl Scope {
    pub fn is_system(self) -> bool {
        matches!(self, Scope::System)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub scope: Scope,
    pub default_timeout: time::Duration,
    pub send_sigkill: bool,
    /// The signal used for graceful helper termination; escalation uses
    /// SIGKILL regardless (if permitted at all).
    pub kill_signal: rustix::process::Signal,
    pub start_limit_interval: time::Duration,
    pub start_limit_burst: u32,
    pub run_dir: PathBuf,
    pub fragment_dirs: Vec<PathBuf>,
    pub mount_path: PathBuf,
    pub umount_path: PathBuf,
}

impl Config {
    pub fn new(path: Option<&PathBuf>, user: bool) -> anyhow::Result<Config> {
        let file = path
            .map(|p| p.to_owned())
            .or_else(locate_default_config_file);

        let cfg = if let Some(file) = file {
            let content = std::fs::read_to_string(&file)?;
            let parsed: parsed::Config = toml::from_str(&content)
                .context(format!("parsing configuration file {}", file.display()))?;

            Some(parsed)
        } else {
            None
        };

        Self::build(cfg, user)
    }

    fn build(cfg: Option<parsed::Config>, user: bool) -> anyhow::Result<Self> {
        let defaults = DEFAULT_CFG.clone();

        let input = if let Some(cfg) = cfg {
            // Merge the default config with the input config, giving the
            // input precedence.
            use converge::Converge;
            cfg.converge(defaults)
        } else {
            defaults
        };

        // Only values set in the default config get unwrapped here; this is
        // verified by a test.
        let manager = input.manager.unwrap();

        let scope = if user {
            Scope::User
        } else {
            match manager.scope.unwrap() {
                parsed::Scope::System => Scope::System,
                parsed::Scope::User => Scope::User,
            }
        };

        Ok(Config {
            scope,
            default_timeout: time::Duration::from_secs(manager.default_timeout.unwrap()),
            send_sigkill: manager.send_sigkill.unwrap(),
            kill_signal: parse_signal(&manager.kill_signal.unwrap())?,
            start_limit_interval: time::Duration::from_secs(
                manager.start_limit_interval.unwrap(),
            ),
            start_limit_burst: manager.start_limit_burst.unwrap(),
            run_dir: manager.run_dir.unwrap(),
            fragment_dirs: manager.fragment_dirs.unwrap(),
            mount_path: match manager.mount_path {
                Some(p) => p,
                None => find_helper("mount")?,
            },
            umount_path: match manager.umount_path {
                Some(p) => p,
                None => find_helper("umount")?,
            },
        })
    }
}

fn locate_default_config_file() -> Option<PathBuf> {
    let p = PathBuf::from("/etc/mountd/mountd.toml");
    p.exists().then_some(p)
}

fn parse_signal(name: &str) -> anyhow::Result<rustix::process::Signal> {
    use rustix::process::Signal;

    match name {
        "SIGTERM" => Ok(Signal::Term),
        "SIGINT" => Ok(Signal::Int),
        "SIGHUP" => Ok(Signal::Hup),
        "SIGQUIT" => Ok(Signal::Quit),
        _ => bail!("unsupported kill_signal {:?}", name),
    }
}

fn find_helper(name: &str) -> anyhow::Result<PathBuf> {
    pathsearch::find_executable_in_path(name)
        .ok_or_else(|| anyhow::anyhow!("helper binary {:?} not in PATH", name))
}

/// The settings of one mount unit, as read from its fragment file.
#[derive(Debug, Clone, PartialEq)]
pub struct Fragment {
    pub name: String,
    pub where_: PathBuf,
    pub what: Option<PathBuf>,
    pub fstype: Option<String>,
    pub options: Option<String>,
    pub sloppy_options: bool,
    pub lazy_unmount: bool,
    pub force_unmount: bool,
    pub directory_mode: u32,
    pub timeout: Option<time::Duration>,
    pub device_bound: bool,
    pub default_dependencies: bool,
    pub auto: bool,
}

/// Loads every `*.toml` fragment below the configured directories. The file
/// stem has to match the unit name derived from `where`, so that lookups by
/// either agree.
pub fn load_fragments(dirs: &[PathBuf]) -> anyhow::Result<Vec<Fragment>> {
    let mut out = Vec::new();

    for dir in dirs {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("fragment directory {} does not exist", dir.display());
                continue;
            }
            Err(e) => return Err(e).context(format!("reading {}", dir.display())),
        };

        for entry in entries {
            let path = entry?.path();
            if path.extension().map_or(true, |e| e != "toml") {
                continue;
            }

            match load_fragment(&path) {
                Ok(f) => out.push(f),
                // One broken fragment shouldn't take the others down.
                Err(e) => warn!("ignoring fragment {}: {:#}", path.display(), e),
            }
        }
    }

    Ok(out)
}

fn load_fragment(path: &Path) -> anyhow::Result<Fragment> {
    let content = std::fs::read_to_string(path)?;
    let parsed: parsed::Fragment = toml::from_str(&content)?;
    let mount = parsed.mount;

    if !unit_name::path_is_normalized(&mount.where_) {
        bail!("`where` is not an absolute, normalized path");
    }

    let name = unit_name::from_path(&mount.where_)?;

    let stem = path.file_stem().unwrap_or_default().to_string_lossy();
    if format!("{}{}", stem, unit_name::MOUNT_SUFFIX) != name {
        bail!(
            "fragment file name {:?} does not match unit name {:?} derived from `where`",
            stem,
            name
        );
    }

    Ok(Fragment {
        name,
        where_: mount.where_,
        what: mount.what,
        fstype: mount.fstype,
        options: mount.options,
        sloppy_options: mount.sloppy_options.unwrap_or(false),
        lazy_unmount: mount.lazy_unmount.unwrap_or(false),
        force_unmount: mount.force_unmount.unwrap_or(false),
        directory_mode: mount.directory_mode.unwrap_or(0o755),
        timeout: mount.timeout.map(time::Duration::from_secs),
        device_bound: mount.device_bound.unwrap_or(false),
        default_dependencies: mount.default_dependencies.unwrap_or(true),
        auto: mount.auto.unwrap_or(true),
    })
}
