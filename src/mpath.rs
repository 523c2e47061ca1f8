// Take a look at the license at the top of the repository in the LICENSE file.

//! Detection of multipath component devices.
//!
//! A path device that belongs to a dm-multipath group must never be used
//! as a first-class device; only the multipath map above it may be. Three
//! strategies are tried in order, first hit wins: the sysfs holders walk,
//! a lookup in the multipath wwids file (pruned by the blacklist
//! configuration), and udev properties when configured as the external
//! info source.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use log::debug;

use crate::config::{Config, ExternalInfo, SystemPaths};
use crate::devcache::{DeviceCache, DeviceRecord};
use crate::idkind::strip_dm_part_prefix;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Memo {
    Component,
    NotComponent,
}

/// Stateful detector; keep one per command so repeated queries for the
/// same minors stay cheap.
#[derive(Default)]
pub struct MultipathDetector {
    /// Holder-walk results, indexed by minor.
    memo: HashMap<u32, Memo>,
    /// Pruned wwid set, loaded on first use.
    wwids: Option<HashSet<String>>,
}

impl MultipathDetector {
    /// A detector with empty caches.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the device is a member of a multipath group.
    pub fn is_component(&mut self, cache: &DeviceCache, dev_idx: usize, cfg: &Config) -> bool {
        let dev = cache.dev(dev_idx);

        // Only SCSI disks and NVMe namespaces can be multipath paths; for
        // those, walk their holders looking for an mpath map.
        if cache.majors().is_scsi(dev.major) || cache.majors().is_nvme(dev.major) {
            let hit = match self.memo.get(&dev.minor) {
                Some(memo) => *memo == Memo::Component,
                None => {
                    let hit = holders_have_mpath(cache, dev);
                    self.memo.insert(
                        dev.minor,
                        if hit { Memo::Component } else { Memo::NotComponent },
                    );
                    hit
                }
            };
            if hit {
                debug!("{} is a multipath component (holders)", dev.path.display());
                return true;
            }
        }

        if let Some(wwids_file) = cfg.multipath_wwids_file.clone() {
            let paths = &cfg.paths;
            let set = self
                .wwids
                .get_or_insert_with(|| load_wwid_set(&wwids_file, paths));
            if !set.is_empty() {
                if let Some(wwid) = dev_wwid(paths, dev) {
                    if set.contains(&wwid) {
                        debug!("{} is a multipath component (wwid)", dev.path.display());
                        return true;
                    }
                }
            }
        }

        if cfg.external_info == ExternalInfo::Udev && udev_says_component(dev) {
            debug!("{} is a multipath component (udev)", dev.path.display());
            return true;
        }
        false
    }
}

fn read_trimmed(path: &Path) -> Option<String> {
    let s = fs::read_to_string(path).ok()?;
    let s = s.trim();
    if s.is_empty() { None } else { Some(s.to_string()) }
}

/// `device/wwid` of the device, with the leading `<typestr>.` (e.g.
/// `naa.`, `eui.`) removed; that is the form the multipath wwids file
/// stores after its own prefix stripping.
fn dev_wwid(paths: &SystemPaths, dev: &DeviceRecord) -> Option<String> {
    let raw = read_trimmed(&paths.sys_block(&dev.name).join("device/wwid"))?;
    let stripped = match raw.split_once('.') {
        Some((_typestr, rest)) if !rest.is_empty() => rest,
        _ => raw.as_str(),
    };
    Some(stripped.to_string())
}

fn holders_have_mpath(cache: &DeviceCache, dev: &DeviceRecord) -> bool {
    let paths = cache.paths();
    let holders = paths.sys_block(&dev.name).join("holders");
    let entries = match fs::read_dir(&holders) {
        Ok(entries) => entries,
        Err(_) => return false,
    };
    for entry in entries.flatten() {
        let holder = entry.file_name().to_string_lossy().into_owned();
        let node = paths.devfs.join(&holder);
        let Ok(md) = fs::metadata(&node) else {
            continue;
        };
        let major = libc::major(md.rdev() as libc::dev_t) as u32;
        if !cache.majors().is_dm(major) {
            continue;
        }
        let Some(uuid) = read_trimmed(&paths.sys_block(&holder).join("dm/uuid")) else {
            continue;
        };
        if strip_dm_part_prefix(&uuid).starts_with("mpath-") {
            return true;
        }
    }
    false
}

/// Representative WWID of a multipath group: the `device/wwid` of the
/// first path device under `slaves/`.
pub fn mpath_group_wwid(paths: &SystemPaths, major: u32, minor: u32) -> Option<String> {
    let slaves = paths.sys_dev_block(major, minor).join("slaves");
    let mut names: Vec<String> = fs::read_dir(&slaves)
        .ok()?
        .flatten()
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    let first = names.into_iter().next()?;
    read_trimmed(&paths.sys_block(&first).join("device/wwid"))
}

/// Strip the decorations a wwid carries in multipath's own files: optional
/// surrounding quotes or slashes, and the SCSI type-3 `3` prefix.
fn normalize_wwid(raw: &str) -> Option<String> {
    let w = raw.trim();
    let w = w.strip_prefix('/').and_then(|w| w.strip_suffix('/')).unwrap_or(w);
    let w = w.strip_prefix('"').and_then(|w| w.strip_suffix('"')).unwrap_or(w);
    let w = w.strip_prefix('3').unwrap_or(w);
    if w.is_empty() { None } else { Some(w.to_string()) }
}

/// Load the multipath wwids file and prune it by the blacklist and
/// blacklist-exceptions configuration.
fn load_wwid_set(wwids_file: &Path, paths: &SystemPaths) -> HashSet<String> {
    let content = match fs::read_to_string(wwids_file) {
        Ok(c) => c,
        Err(e) => {
            debug!("cannot read {}: {e}", wwids_file.display());
            return HashSet::new();
        }
    };
    let mut set = parse_wwids_file(&content);

    let (blacklist, exceptions) = load_blacklists(paths);
    set.retain(|w| !blacklist.contains(w) || exceptions.contains(w));
    set
}

fn parse_wwids_file(content: &str) -> HashSet<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .filter_map(normalize_wwid)
        .collect()
}

fn load_blacklists(paths: &SystemPaths) -> (HashSet<String>, HashSet<String>) {
    let mut blacklist = HashSet::new();
    let mut exceptions = HashSet::new();

    let mut files = vec![paths.etc_dir.join("multipath.conf")];
    let confd = paths.etc_dir.join("multipath/conf.d");
    if let Ok(entries) = fs::read_dir(&confd) {
        let mut extra: Vec<PathBuf> = entries.flatten().map(|e| e.path()).collect();
        extra.sort();
        files.extend(extra);
    }

    for file in files {
        if let Ok(content) = fs::read_to_string(&file) {
            parse_blacklist_config(&content, &mut blacklist, &mut exceptions);
        }
    }
    (blacklist, exceptions)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    None,
    Blacklist,
    Exceptions,
}

/// Line-oriented reader for multipath.conf. Only the `blacklist` and
/// `blacklist_exceptions` sections are of interest, and within them only
/// `wwid` keys; nested subsections (`device { ... }`) just track brace
/// depth.
pub(crate) fn parse_blacklist_config(
    content: &str,
    blacklist: &mut HashSet<String>,
    exceptions: &mut HashSet<String>,
) {
    let mut section = Section::None;
    let mut depth = 0usize;

    for raw in content.lines() {
        let line = match raw.split_once('#') {
            Some((before, _)) => before.trim(),
            None => raw.trim(),
        };
        if line.is_empty() {
            continue;
        }

        if section == Section::None {
            if let Some(first) = line.split_whitespace().next() {
                let open = line.contains('{');
                if open && first == "blacklist" {
                    section = Section::Blacklist;
                    depth = 1;
                    continue;
                }
                if open && first == "blacklist_exceptions" {
                    section = Section::Exceptions;
                    depth = 1;
                    continue;
                }
            }
            continue;
        }

        depth += line.matches('{').count();
        depth -= line.matches('}').count().min(depth);
        if depth == 0 {
            section = Section::None;
            continue;
        }

        let mut tokens = line.split_whitespace();
        if tokens.next() == Some("wwid") {
            if let Some(wwid) = tokens.next().and_then(normalize_wwid) {
                match section {
                    Section::Blacklist => {
                        blacklist.insert(wwid);
                    }
                    Section::Exceptions => {
                        exceptions.insert(wwid);
                    }
                    Section::None => {}
                }
            }
        }
    }
}

#[cfg(feature = "udev")]
fn udev_says_component(dev: &DeviceRecord) -> bool {
    let devnum = libc::makedev(dev.major, dev.minor);
    match udev::Device::from_devnum(udev::DeviceType::Block, devnum) {
        Ok(udev_dev) => udev_dev
            .property_value("DM_MULTIPATH_DEVICE_PATH")
            .and_then(|v| v.to_str())
            == Some("1"),
        Err(e) => {
            debug!("udev lookup of {} failed: {e}", dev.path.display());
            false
        }
    }
}

#[cfg(not(feature = "udev"))]
fn udev_says_component(dev: &DeviceRecord) -> bool {
    debug!(
        "udev info requested for {} but the udev feature is not built in",
        dev.path.display()
    );
    false
}
