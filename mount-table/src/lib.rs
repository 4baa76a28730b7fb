// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: MIT

//! Parsing and monitoring of the kernel mount table.
//!
//! The kernel exposes the mount table of a process's namespace at
//! `/proc/self/mountinfo`. This crate parses snapshots of that file and
//! provides [`MountMonitor`], a single pollable descriptor that becomes
//! readable whenever the kernel or userspace mount table changes.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Lines};
use std::path::{Path, PathBuf};

mod monitor;
pub use monitor::MountMonitor;

pub const PROC_SELF_MOUNTINFO: &str = "/proc/self/mountinfo";

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("truncated mountinfo line: {0:?}")]
    Truncated(String),
    #[error("missing field separator in mountinfo line: {0:?}")]
    MissingSeparator(String),
    #[error("reading mount table: {0}")]
    Io(#[from] io::Error),
}

/// One line of `/proc/self/mountinfo`.
///
/// The `source` and `target` fields are kept in the kernel's octal-escape
/// form; pass them through [`unescape_octal`] before treating them as paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub source: String,
    pub target: String,
    pub fstype: String,
    /// VFS mount options joined with the superblock options.
    pub options: String,
}

impl MountEntry {
    /// Parses a single mountinfo line. Field order per the kernel's
    /// Documentation/filesystems/proc.rst section 3.5:
    ///
    /// `36 35 98:0 /mnt1 /mnt2 rw,noatime master:1 - ext4 /dev/root rw`
    pub fn parse(line: &str) -> Result<MountEntry, ParseError> {
        let truncated = || ParseError::Truncated(line.to_string());

        let mut fields = line.split_ascii_whitespace();

        // id, parent id, major:minor, root.
        for _ in 0..4 {
            fields.next().ok_or_else(truncated)?;
        }

        let target = fields.next().ok_or_else(truncated)?.to_string();
        let vfs_options = fields.next().ok_or_else(truncated)?;

        // A variable number of optional tagged fields, up to the "-"
        // separator.
        loop {
            match fields.next() {
                Some("-") => break,
                Some(_) => continue,
                None => return Err(ParseError::MissingSeparator(line.to_string())),
            }
        }

        let fstype = fields.next().ok_or_else(truncated)?.to_string();
        let source = fields.next().ok_or_else(truncated)?.to_string();
        let super_options = fields.next().ok_or_else(truncated)?;

        Ok(MountEntry {
            source,
            target,
            fstype,
            options: join_options(vfs_options, super_options),
        })
    }
}

fn join_options(vfs: &str, superblock: &str) -> String {
    match (vfs.is_empty(), superblock.is_empty()) {
        (false, false) => format!("{},{}", vfs, superblock),
        (false, true) => vfs.to_string(),
        (true, _) => superblock.to_string(),
    }
}

/// A handle on a mount-table file. Snapshots are restartable: each call to
/// [`MountTable::snapshot`] re-reads the table from the start.
#[derive(Debug, Clone)]
pub struct MountTable {
    path: PathBuf,
}

impl Default for MountTable {
    fn default() -> Self {
        Self::new(PROC_SELF_MOUNTINFO)
    }
}

impl MountTable {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self { path: path.as_ref().to_path_buf() }
    }

    pub fn snapshot(&self) -> Result<Snapshot, ParseError> {
        let file = File::open(&self.path)?;
        Ok(Snapshot {
            lines: BufReader::new(file).lines(),
        })
    }
}

/// A lazy iteration over one snapshot of the mount table.
pub struct Snapshot {
    lines: Lines<BufReader<File>>,
}

impl Iterator for Snapshot {
    type Item = Result<MountEntry, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.lines.next()? {
                Ok(line) if line.trim().is_empty() => continue,
                Ok(line) => return Some(MountEntry::parse(&line)),
                Err(e) => return Some(Err(e.into())),
            }
        }
    }
}

/// Decodes the `\NNN` octal escapes the kernel uses for whitespace and
/// backslashes in mountinfo fields. The decoder is lenient: sequences that
/// aren't three octal digits pass through unchanged.
pub fn unescape_octal(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let bytes = s.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 4 <= bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|b| (b'0'..=b'7').contains(b)) {
                let val = (digits[0] - b'0') as u32 * 64
                    + (digits[1] - b'0') as u32 * 8
                    + (digits[2] - b'0') as u32;
                if let Some(c) = char::from_u32(val) {
                    out.push(c);
                    i += 4;
                    continue;
                }
            }
        }

        // Not an escape (or not one we understand); copy the raw byte.
        let ch_len = utf8_len(bytes[i]);
        out.push_str(&s[i..i + ch_len]);
        i += ch_len;
    }

    out
}

fn utf8_len(b: u8) -> usize {
    match b {
        b if b & 0x80 == 0 => 1,
        b if b & 0xe0 == 0xc0 => 2,
        b if b & 0xf0 == 0xe0 => 3,
        _ => 4,
    }
}
