// Take a look at the license at the top of the repository in the LICENSE file.

//! In-process view of the host's block devices.
//!
//! The crate does not enumerate devices itself; the caller's device scan
//! pushes one [`DeviceRecord`] per present device into a [`DeviceCache`].
//! The cache then answers identity queries, memoising every sysfs read
//! (including the negative ones) on the record it was asked about.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::debug;

use crate::config::{Config, SystemPaths};
use crate::idkind::{self, IdKind};

/// Block-device major numbers looked up from `<procfs>/devices`.
///
/// Device-mapper and blkext (NVMe namespace) majors are dynamic, so they
/// cannot be hard-coded; loop and md have well-known values that serve as a
/// fallback when procfs is not readable.
#[derive(Debug, Default)]
pub struct Majors {
    named: HashMap<String, Vec<u32>>,
}

const LOOP_MAJOR: u32 = 7;
const MD_MAJOR: u32 = 9;

impl Majors {
    /// Read the block-device section of `<procfs>/devices`.
    pub fn load(paths: &SystemPaths) -> Self {
        let path = paths.procfs.join("devices");
        match fs::read_to_string(&path) {
            Ok(content) => Self::parse(&content),
            Err(e) => {
                debug!("cannot read {}: {e}", path.display());
                Self::default()
            }
        }
    }

    pub(crate) fn parse(content: &str) -> Self {
        let mut named: HashMap<String, Vec<u32>> = HashMap::new();
        let mut in_block = false;
        for line in content.lines() {
            let line = line.trim();
            if line.ends_with("devices:") {
                in_block = line.starts_with("Block");
                continue;
            }
            if !in_block || line.is_empty() {
                continue;
            }
            let mut it = line.split_whitespace();
            let (Some(num), Some(name)) = (it.next(), it.next()) else {
                continue;
            };
            if let Ok(major) = num.parse::<u32>() {
                named.entry(name.to_string()).or_default().push(major);
            }
        }
        Self { named }
    }

    fn has(&self, name: &str, major: u32) -> bool {
        self.named.get(name).is_some_and(|v| v.contains(&major))
    }

    /// Major belongs to device-mapper. There is no fallback value; a host
    /// without the dm module loaded simply has no dm devices.
    pub fn is_dm(&self, major: u32) -> bool {
        self.has("device-mapper", major)
    }

    /// Major belongs to an MD array device.
    pub fn is_md(&self, major: u32) -> bool {
        major == MD_MAJOR || self.has("md", major)
    }

    /// Major belongs to a loop device.
    pub fn is_loop(&self, major: u32) -> bool {
        major == LOOP_MAJOR || self.has("loop", major)
    }

    /// Major belongs to a SCSI disk (an `sd` entry).
    pub fn is_scsi(&self, major: u32) -> bool {
        self.has("sd", major)
    }

    /// Major belongs to blkext, which NVMe namespaces are registered under.
    pub fn is_nvme(&self, major: u32) -> bool {
        self.has("blkext", major)
    }
}

/// One cached identity on a device.
///
/// `name == None` is a recorded negative: the kind was looked up once and
/// is not available on this device, so the lookup is not repeated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceId {
    /// Identity scheme this entry caches.
    pub kind: IdKind,
    /// The identifier, or `None` for a recorded negative.
    pub name: Option<String>,
}

/// One present block device, as reported by the caller's enumeration.
///
/// `pvid`, `scanned` and `filtered` are written by the caller's label-scan
/// pipeline between matching and validation; everything else is managed by
/// the crate.
#[derive(Debug)]
pub struct DeviceRecord {
    /// Kernel name, e.g. `sdb`, `sda1`, `dm-3`.
    pub name: String,
    /// Preferred device node path, e.g. `/dev/sdb`.
    pub path: PathBuf,
    /// Device node major number.
    pub major: u32,
    /// Device node minor number.
    pub minor: u32,
    /// Partition index; 0 for a whole disk.
    pub part: u32,
    /// Kernel name of the whole-disk device when `part > 0`.
    pub primary: Option<String>,
    /// PVID read from the on-disk label, if the device was scanned and
    /// carries one.
    pub pvid: Option<String>,
    /// The label scan actually read this device.
    pub scanned: bool,
    /// A downstream filter excluded this device from use.
    pub filtered: bool,
    ids: Vec<DeviceId>,
    active: Option<IdKind>,
    matched: bool,
}

impl DeviceRecord {
    /// A record for a device node that is already fully described.
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>, major: u32, minor: u32) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            major,
            minor,
            part: 0,
            primary: None,
            pvid: None,
            scanned: false,
            filtered: false,
            ids: Vec::new(),
            active: None,
            matched: false,
        }
    }

    /// Cached identity of the given kind, positive or negative.
    pub fn id_for(&self, kind: IdKind) -> Option<&DeviceId> {
        self.ids.iter().find(|id| id.kind == kind)
    }

    /// The identity the matcher paired this device on, if any.
    pub fn active_id(&self) -> Option<&DeviceId> {
        self.active.and_then(|kind| self.id_for(kind))
    }

    /// Whether this device has been paired to a registry entry.
    pub fn is_matched(&self) -> bool {
        self.matched
    }

    pub(crate) fn cache_id(&mut self, kind: IdKind, name: Option<String>) {
        if let Some(id) = self.ids.iter_mut().find(|id| id.kind == kind) {
            id.name = name;
        } else {
            self.ids.push(DeviceId { kind, name });
        }
    }

    pub(crate) fn set_matched(&mut self, kind: IdKind) {
        self.matched = true;
        self.active = Some(kind);
    }

    pub(crate) fn clear_matched(&mut self) {
        self.matched = false;
        self.active = None;
    }
}

/// The set of block devices present on the host.
pub struct DeviceCache {
    devices: Vec<DeviceRecord>,
    majors: Majors,
    paths: SystemPaths,
}

impl DeviceCache {
    /// An empty cache; the caller's enumeration fills it with
    /// [`DeviceCache::push`].
    pub fn new(cfg: &Config) -> Self {
        Self {
            devices: Vec::new(),
            majors: Majors::load(&cfg.paths),
            paths: cfg.paths.clone(),
        }
    }

    /// Add a device and return its index.
    pub fn push(&mut self, dev: DeviceRecord) -> usize {
        self.devices.push(dev);
        self.devices.len() - 1
    }

    /// Number of devices in the cache.
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Whether the cache holds no devices.
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Iterate over all device records.
    pub fn iter(&self) -> impl Iterator<Item = &DeviceRecord> {
        self.devices.iter()
    }

    /// Device record by index. Indices are stable for the cache lifetime.
    pub fn dev(&self, idx: usize) -> &DeviceRecord {
        &self.devices[idx]
    }

    /// Mutable device record by index.
    pub fn dev_mut(&mut self, idx: usize) -> &mut DeviceRecord {
        &mut self.devices[idx]
    }

    /// Look up a device by its node path, falling back to the kernel name
    /// for aliases like `/dev/mapper/*`.
    pub fn lookup_path(&self, path: &Path) -> Option<usize> {
        if let Some(i) = self.devices.iter().position(|d| d.path == path) {
            return Some(i);
        }
        let name = path.file_name()?.to_str()?;
        self.lookup_name(name)
    }

    /// Look up a device by kernel name.
    pub fn lookup_name(&self, name: &str) -> Option<usize> {
        self.devices.iter().position(|d| d.name == name)
    }

    /// The major-number table loaded from procfs.
    pub fn majors(&self) -> &Majors {
        &self.majors
    }

    /// The filesystem roots this cache reads from.
    pub fn paths(&self) -> &SystemPaths {
        &self.paths
    }

    /// Identity of `kind` for the device at `idx`, consulting the record's
    /// cached identities before touching sysfs. The result, including a
    /// miss, is memoised on the record.
    pub fn dev_id(&mut self, idx: usize, kind: IdKind) -> Option<String> {
        if let Some(id) = self.devices[idx].id_for(kind) {
            return id.name.clone();
        }
        let value = self.read_id(idx, kind);
        self.devices[idx].cache_id(kind, value.clone());
        value
    }

    fn read_id(&self, idx: usize, kind: IdKind) -> Option<String> {
        let dev = &self.devices[idx];
        if kind == IdKind::Devname {
            return Some(dev.path.to_string_lossy().into_owned());
        }
        // WWIDs and serials live on the whole-disk device; partitions
        // inherit them from their primary.
        let sys_dir = if matches!(kind, IdKind::SysWwid | IdKind::SysSerial) && dev.part > 0 {
            match dev.primary.as_deref() {
                Some(primary) => self.paths.sys_block(primary),
                None => {
                    debug!("{}: partition without a known primary", dev.name);
                    return None;
                }
            }
        } else {
            self.paths.sys_dev_block(dev.major, dev.minor)
        };
        idkind::system_read(kind, &sys_dir, &dev.path)
    }
}
