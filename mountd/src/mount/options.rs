// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! Mount parameters and the predicates derived from them. Everything here
//! is a pure function of `(what, where, options, fstype)`.

use std::path::{Path, PathBuf};

use crate::config::Scope;

/// Filesystem types that imply the mount needs the network up.
const NETWORK_FSTYPES: &[&str] = &[
    "afs", "ceph", "cifs", "smb3", "smbfs", "sshfs", "ncpfs", "ncp", "nfs", "nfs4", "gfs",
    "gfs2", "glusterfs", "gluster", "pvfs2", "ocfs2", "lustre", "davfs",
];

/// Mount points the manager observes but never manages, by prefix.
const EXTRINSIC_PREFIXES: &[&str] = &["/run/initramfs", "/proc", "/sys", "/dev"];

const QUOTA_OPTIONS: &[&str] = &["usrquota", "grpquota", "quota", "usrjquota", "grpjquota"];

/// What, options, and filesystem type of one mount. A unit keeps two of
/// these: the copy from its fragment, and the copy last observed in the
/// kernel table.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct MountParameters {
    pub what: Option<PathBuf>,
    pub options: Option<String>,
    pub fstype: Option<String>,
}

impl MountParameters {
    pub fn is_network(&self) -> bool {
        if self.has_option("_netdev") {
            return true;
        }

        self.fstype.as_deref().is_some_and(fstype_is_network)
    }

    pub fn is_bind(&self) -> bool {
        self.has_option("bind")
            || self.has_option("rbind")
            || matches!(self.fstype.as_deref(), Some("bind") | Some("rbind"))
    }

    pub fn is_loop(&self) -> bool {
        self.has_option("loop")
    }

    pub fn is_auto(&self) -> bool {
        !self.has_option("noauto")
    }

    pub fn is_automount(&self) -> bool {
        self.options
            .as_deref()
            .into_iter()
            .flat_map(|o| o.split(','))
            .any(|o| o == "comment=systemd.automount" || o == "x-systemd.automount")
    }

    pub fn is_device_bound(&self) -> bool {
        self.has_option_name("x-systemd.device-bound")
    }

    pub fn needs_quota(&self) -> bool {
        if self.is_network() || self.is_bind() {
            return false;
        }

        self.option_names().any(|name| QUOTA_OPTIONS.contains(&name))
    }

    /// Exact-token membership test: `noauto` matches `noauto` but not
    /// `noauto=x`.
    fn has_option(&self, name: &str) -> bool {
        self.options
            .as_deref()
            .into_iter()
            .flat_map(|o| o.split(','))
            .any(|o| o == name)
    }

    /// Matches the option by name, with or without a `=value` part.
    fn has_option_name(&self, name: &str) -> bool {
        self.option_names().any(|n| n == name)
    }

    fn option_names(&self) -> impl Iterator<Item = &str> {
        self.options
            .as_deref()
            .into_iter()
            .flat_map(|o| o.split(','))
            .map(|o| o.split('=').next().unwrap_or(o))
    }
}

pub fn fstype_is_network(fstype: &str) -> bool {
    let fstype = fstype.strip_prefix("fuse.").unwrap_or(fstype);
    NETWORK_FSTYPES.contains(&fstype)
}

/// An extrinsic mount is one we track but never manage: everything under the
/// API filesystems, the OS root and /usr, initrd-retained mounts outside the
/// initrd, and (for a user manager) every mount on the system.
pub fn is_extrinsic(
    scope: Scope,
    where_: &Path,
    params: &MountParameters,
    in_initrd: bool,
) -> bool {
    if !scope.is_system() {
        return true;
    }

    if where_ == Path::new("/") || where_ == Path::new("/usr") {
        return true;
    }

    if EXTRINSIC_PREFIXES
        .iter()
        .any(|p| where_.starts_with(p))
    {
        return true;
    }

    if params.has_option_name("x-initrd.mount") && !in_initrd {
        return true;
    }

    false
}

/// Strips the options that only concern the manager, not the helper:
/// `nofail`, `noauto`, `auto`. Returns None when nothing is left.
pub fn filter_exec_options(options: &str) -> Option<String> {
    let filtered = options
        .split(',')
        .filter(|o| !matches!(*o, "nofail" | "noauto" | "auto") && !o.is_empty())
        .collect::<Vec<_>>()
        .join(",");

    (!filtered.is_empty()).then_some(filtered)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(options: Option<&str>, fstype: Option<&str>) -> MountParameters {
        MountParameters {
            what: None,
            options: options.map(str::to_string),
            fstype: fstype.map(str::to_string),
        }
    }

    #[test]
    fn test_is_network() {
        assert!(params(Some("rw,_netdev"), Some("ext4")).is_network());
        assert!(params(None, Some("nfs4")).is_network());
        assert!(params(None, Some("fuse.sshfs")).is_network());
        assert!(!params(Some("rw"), Some("ext4")).is_network());
        // Exact token match only.
        assert!(!params(Some("_netdevice"), Some("ext4")).is_network());
    }

    #[test]
    fn test_is_bind() {
        assert!(params(Some("bind"), None).is_bind());
        assert!(params(Some("rw,rbind"), None).is_bind());
        assert!(params(None, Some("bind")).is_bind());
        assert!(!params(Some("rw"), Some("ext4")).is_bind());
    }

    #[test]
    fn test_is_auto() {
        assert!(params(Some("rw"), None).is_auto());
        assert!(!params(Some("rw,noauto"), None).is_auto());
        assert!(params(None, None).is_auto());
    }

    #[test]
    fn test_is_automount() {
        assert!(params(Some("x-systemd.automount"), None).is_automount());
        assert!(params(Some("comment=systemd.automount"), None).is_automount());
        assert!(!params(Some("rw"), None).is_automount());
    }

    #[test]
    fn test_needs_quota() {
        assert!(params(Some("rw,usrquota"), Some("ext4")).needs_quota());
        assert!(params(Some("usrjquota=aquota.user"), Some("ext4")).needs_quota());
        // Network and bind mounts never need local quota.
        assert!(!params(Some("usrquota,_netdev"), Some("ext4")).needs_quota());
        assert!(!params(Some("usrquota,bind"), None).needs_quota());
        assert!(!params(Some("rw"), Some("ext4")).needs_quota());
    }

    #[test]
    fn test_is_extrinsic() {
        let plain = params(Some("rw"), Some("ext4"));

        assert!(is_extrinsic(Scope::User, Path::new("/mnt/x"), &plain, false));
        assert!(is_extrinsic(Scope::System, Path::new("/"), &plain, false));
        assert!(is_extrinsic(Scope::System, Path::new("/usr"), &plain, false));
        assert!(is_extrinsic(Scope::System, Path::new("/proc/fs"), &plain, false));
        assert!(is_extrinsic(Scope::System, Path::new("/dev/pts"), &plain, false));
        assert!(!is_extrinsic(Scope::System, Path::new("/mnt/x"), &plain, false));
        assert!(!is_extrinsic(Scope::System, Path::new("/usr2"), &plain, false));

        let initrd = params(Some("x-initrd.mount"), Some("ext4"));
        assert!(is_extrinsic(Scope::System, Path::new("/sysroot"), &initrd, false));
        assert!(!is_extrinsic(Scope::System, Path::new("/sysroot"), &initrd, true));
    }

    #[test]
    fn test_filter_exec_options() {
        assert_eq!(
            filter_exec_options("rw,noauto,nofail,relatime").as_deref(),
            Some("rw,relatime")
        );
        assert_eq!(filter_exec_options("auto,nofail"), None);
        assert_eq!(filter_exec_options("defaults").as_deref(), Some("defaults"));
    }
}
