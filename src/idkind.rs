// Take a look at the license at the top of the repository in the LICENSE file.

//! The closed set of stable-identity schemes a device can be listed under.
//!
//! Every kind except [`IdKind::Devname`] survives a kernel rename. Devname
//! is kept as a last resort for hardware that exposes nothing better, and
//! is the sole reason the rename search in [`crate::Registry::search_renamed`]
//! exists.

use std::fmt;
use std::fs;
use std::path::Path;

use log::debug;

use crate::devcache::Majors;

/// Substring of WWIDs that QEMU assigns to every emulated disk; such a
/// value is shared by all of them and useless as an identity.
const QEMU_WWID: &str = "QEMU_HARDDISK";

/// Identity scheme for one registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdKind {
    /// World-Wide Identifier read from `device/wwid` in sysfs.
    SysWwid,
    /// SCSI serial number read from `device/serial`.
    SysSerial,
    /// Device-mapper UUID carrying the `mpath-` prefix.
    MpathUuid,
    /// Device-mapper UUID carrying the `CRYPT-` prefix.
    CryptUuid,
    /// Device-mapper UUID carrying the `LVM-` prefix (an LV used as a PV).
    LvmlvUuid,
    /// MD array UUID read from `md/uuid`.
    MdUuid,
    /// Backing-file path of a loop device.
    LoopFile,
    /// The kernel device name itself. Unstable; last resort.
    Devname,
}

impl IdKind {
    /// Textual tag used in the devices file.
    pub fn tag(self) -> &'static str {
        match self {
            IdKind::SysWwid => "sys_wwid",
            IdKind::SysSerial => "sys_serial",
            IdKind::MpathUuid => "mpath_uuid",
            IdKind::CryptUuid => "crypt_uuid",
            IdKind::LvmlvUuid => "lvmlv_uuid",
            IdKind::MdUuid => "md_uuid",
            IdKind::LoopFile => "loop_file",
            IdKind::Devname => "devname",
        }
    }

    /// Parse a tag from the devices file. Unknown tags (including reserved
    /// ones such as `drbd_uuid`) yield `None` and the entry is skipped.
    pub fn from_tag(tag: &str) -> Option<Self> {
        Some(match tag {
            "sys_wwid" => IdKind::SysWwid,
            "sys_serial" => IdKind::SysSerial,
            "mpath_uuid" => IdKind::MpathUuid,
            "crypt_uuid" => IdKind::CryptUuid,
            "lvmlv_uuid" => IdKind::LvmlvUuid,
            "md_uuid" => IdKind::MdUuid,
            "loop_file" => IdKind::LoopFile,
            "devname" => IdKind::Devname,
            _ => return None,
        })
    }

    /// Whether this kind survives reboots and renames.
    pub fn is_stable(self) -> bool {
        self != IdKind::Devname
    }

    /// Whether a device with the given major number can carry this kind of
    /// identity at all. Used by the matcher to skip doomed sysfs reads.
    pub fn major_compatible(self, majors: &Majors, major: u32) -> bool {
        match self {
            IdKind::MpathUuid | IdKind::CryptUuid | IdKind::LvmlvUuid => majors.is_dm(major),
            IdKind::MdUuid => majors.is_md(major),
            IdKind::LoopFile => majors.is_loop(major),
            IdKind::SysWwid | IdKind::SysSerial => {
                !majors.is_dm(major) && !majors.is_md(major) && !majors.is_loop(major)
            }
            IdKind::Devname => true,
        }
    }
}

impl fmt::Display for IdKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Identifiers are stored with every whitespace and control character
/// replaced, so one entry always stays one line with whitespace-delimited
/// fields.
pub(crate) fn sanitize_id(raw: &str) -> String {
    raw.trim()
        .chars()
        .map(|c| if c.is_whitespace() || c.is_control() { '_' } else { c })
        .collect()
}

fn read_sysfs_value(dir: &Path, attr: &str) -> Option<String> {
    let path = dir.join(attr);
    match fs::read_to_string(&path) {
        Ok(s) => {
            let s = sanitize_id(&s);
            if s.is_empty() { None } else { Some(s) }
        }
        Err(e) => {
            debug!("no {attr} under {}: {e}", dir.display());
            None
        }
    }
}

/// `partN-` prefixes mark a DM partition of a DM device; the identity of
/// interest is the parent map's, so the prefix is not part of the value.
pub(crate) fn strip_dm_part_prefix(uuid: &str) -> &str {
    let Some(rest) = uuid.strip_prefix("part") else {
        return uuid;
    };
    let digits = rest.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits == 0 {
        return uuid;
    }
    match rest[digits..].strip_prefix('-') {
        Some(tail) => tail,
        None => uuid,
    }
}

/// Read the identity of `kind` for the device whose sysfs directory is
/// `sys_dir`. `dev_path` is only used by [`IdKind::Devname`].
///
/// `sys_dir` must belong to the device that actually carries the attribute:
/// for WWIDs and serials of a partition that is the primary device, which
/// the caller resolves before calling here.
pub(crate) fn system_read(kind: IdKind, sys_dir: &Path, dev_path: &Path) -> Option<String> {
    match kind {
        IdKind::SysWwid => {
            let wwid = read_sysfs_value(sys_dir, "device/wwid")
                .or_else(|| read_sysfs_value(sys_dir, "wwid"))?;
            if wwid.contains(QEMU_WWID) {
                debug!("ignoring non-unique qemu wwid on {}", dev_path.display());
                return None;
            }
            Some(wwid)
        }
        IdKind::SysSerial => read_sysfs_value(sys_dir, "device/serial"),
        IdKind::MpathUuid => read_dm_uuid(sys_dir, "mpath-"),
        IdKind::CryptUuid => read_dm_uuid(sys_dir, "CRYPT-"),
        IdKind::LvmlvUuid => read_dm_uuid(sys_dir, "LVM-"),
        IdKind::MdUuid => read_sysfs_value(sys_dir, "md/uuid"),
        IdKind::LoopFile => {
            let backing = read_sysfs_value(sys_dir, "loop/backing_file")?;
            // An unlinked backing file shows up as "..._(deleted)" after
            // sanitization; it no longer names anything stable.
            if backing.ends_with("_(deleted)") || backing.ends_with("(deleted)") {
                debug!("ignoring deleted loop backing file on {}", dev_path.display());
                return None;
            }
            Some(backing)
        }
        IdKind::Devname => Some(dev_path.to_string_lossy().into_owned()),
    }
}

fn read_dm_uuid(sys_dir: &Path, prefix: &str) -> Option<String> {
    let uuid = read_sysfs_value(sys_dir, "dm/uuid")?;
    let uuid = strip_dm_part_prefix(&uuid);
    if uuid.starts_with(prefix) {
        Some(uuid.to_string())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_round_trip() {
        for kind in [
            IdKind::SysWwid,
            IdKind::SysSerial,
            IdKind::MpathUuid,
            IdKind::CryptUuid,
            IdKind::LvmlvUuid,
            IdKind::MdUuid,
            IdKind::LoopFile,
            IdKind::Devname,
        ] {
            assert_eq!(IdKind::from_tag(kind.tag()), Some(kind));
        }
        assert_eq!(IdKind::from_tag("drbd_uuid"), None);
        assert_eq!(IdKind::from_tag(""), None);
    }

    #[test]
    fn sanitize_replaces_whitespace_and_controls() {
        assert_eq!(sanitize_id("naa.600 1405\tf8"), "naa.600_1405_f8");
        assert_eq!(sanitize_id("  plain  \n"), "plain");
        assert_eq!(sanitize_id("a\u{7}b"), "a_b");
    }

    #[test]
    fn dm_part_prefix_stripping() {
        assert_eq!(strip_dm_part_prefix("mpath-36001405"), "mpath-36001405");
        assert_eq!(strip_dm_part_prefix("part1-mpath-36001405"), "mpath-36001405");
        assert_eq!(strip_dm_part_prefix("part12-CRYPT-aaaa"), "CRYPT-aaaa");
        // Not actually a partition prefix.
        assert_eq!(strip_dm_part_prefix("part-mpath-x"), "part-mpath-x");
        assert_eq!(strip_dm_part_prefix("part1mpath-x"), "part1mpath-x");
    }

    #[test]
    fn only_devname_is_unstable() {
        assert!(IdKind::SysWwid.is_stable());
        assert!(IdKind::LoopFile.is_stable());
        assert!(!IdKind::Devname.is_stable());
    }
}
