// Take a look at the license at the top of the repository in the LICENSE file.

//! The in-memory mirror of the devices file: one [`UseEntry`] per listed
//! device, the parsed header fields, and the edit operations.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use log::{debug, warn};

use crate::config::Config;
use crate::devcache::DeviceCache;
use crate::file;
use crate::idkind::IdKind;
use crate::{Error, Result};

/// Version of the on-disk file, `major.minor.counter`.
///
/// The counter increments on every successful write; it is what the
/// best-effort update path compares to detect a concurrent rewrite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Version {
    /// Layout major. Files with a higher major than the implementation
    /// supports are readable but never rewritten.
    pub major: u32,
    /// Layout minor.
    pub minor: u32,
    /// Write counter, strictly monotonic within one file.
    pub counter: u32,
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.counter)
    }
}

impl FromStr for Version {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, ()> {
        let mut it = s.trim().split('.');
        let major = it.next().and_then(|v| v.parse().ok()).ok_or(())?;
        let minor = it.next().and_then(|v| v.parse().ok()).ok_or(())?;
        let counter = it.next().and_then(|v| v.parse().ok()).ok_or(())?;
        if it.next().is_some() {
            return Err(());
        }
        Ok(Version {
            major,
            minor,
            counter,
        })
    }
}

/// One row of the devices file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UseEntry {
    /// Identity scheme the device is listed under.
    pub idtype: IdKind,
    /// Kind-specific identifier. `None` means the identity was lost (an
    /// impostor was unmatched) and the rename search may restore it.
    pub idname: Option<String>,
    /// Last-known device path. A hint only; never trusted for identity.
    pub devname: Option<String>,
    /// PVID last observed on disk for this entry.
    pub pvid: Option<String>,
    /// Partition index, 0 for the whole disk.
    pub part: u32,
    /// Index of the matched device in the caller's [`DeviceCache`], set by
    /// the matcher and cleared when validation unmatches an impostor.
    pub(crate) dev: Option<usize>,
}

impl UseEntry {
    pub(crate) fn new(idtype: IdKind) -> Self {
        Self {
            idtype,
            idname: None,
            devname: None,
            pvid: None,
            part: 0,
            dev: None,
        }
    }

    /// Index of the matched device in the device cache, if any.
    pub fn device(&self) -> Option<usize> {
        self.dev
    }
}

pub(crate) fn dot(v: Option<&str>) -> &str {
    v.unwrap_or(".")
}

impl fmt::Display for UseEntry {
    /// Formats the entry exactly as it is written to the file.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "IDTYPE={} IDNAME={} DEVNAME={} PVID={}",
            self.idtype.tag(),
            dot(self.idname.as_deref()),
            dot(self.devname.as_deref()),
            dot(self.pvid.as_deref()),
        )?;
        if self.part > 0 {
            write!(f, " PART={}", self.part)?;
        }
        Ok(())
    }
}

/// Options for [`Registry::add_device`].
#[derive(Debug, Default, Clone, Copy)]
pub struct AddOptions<'a> {
    /// Accept identity conflicts without failing (the `--yes` of a CLI).
    pub yes: bool,
    /// PVID the caller already knows for the device.
    pub pvid: Option<&'a str>,
    /// Identity kind requested by the caller instead of the automatic
    /// selection.
    pub idtype: Option<IdKind>,
    /// Identifier requested by the caller; only honoured together with
    /// `idtype`, and checked against what the device actually reports.
    pub idname: Option<&'a str>,
}

/// The process-wide registry: ordered entries plus the file header state.
///
/// Entry order is preserved from the file so that rewrites stay readable
/// diffs of the previous content.
#[derive(Debug)]
pub struct Registry {
    pub(crate) entries: Vec<UseEntry>,
    /// `SYSTEMID` header of the file, if present.
    pub system_id: Option<String>,
    pub(crate) version: Version,
    pub(crate) path: PathBuf,
    pub(crate) dirty: bool,
    pub(crate) unparseable: bool,
    pub(crate) needs_refresh: bool,
    pub(crate) list_mode: bool,
    pub(crate) added_devs: bool,
}

impl Registry {
    pub(crate) fn empty(path: PathBuf) -> Self {
        Self {
            entries: Vec::new(),
            system_id: None,
            version: Version::default(),
            path,
            dirty: false,
            unparseable: false,
            needs_refresh: false,
            list_mode: false,
            added_devs: false,
        }
    }

    /// Read the configured devices file.
    ///
    /// A missing file yields [`Error::FileMissing`], which readers treat as
    /// "the feature is disabled on this host". The same applies when
    /// [`Config::enable_devices_file`] is off.
    pub fn load(cfg: &Config) -> Result<Self> {
        let path = cfg.file_path();
        if !cfg.enable_devices_file {
            return Err(Error::FileMissing { path });
        }
        file::read(cfg, &path)
    }

    /// Read the devices file for a command that may create it.
    ///
    /// The file is only created implicitly for a first-PV creation on a
    /// host where the scan saw no existing PVs; any other absence still
    /// means "disabled".
    pub fn load_for_create(cfg: &Config, creating_first_pv: bool, pvs_seen: bool) -> Result<Self> {
        match Self::load(cfg) {
            Err(Error::FileMissing { path }) if creating_first_pv && !pvs_seen => {
                debug!("creating new devices file {}", path.display());
                Ok(Self::empty(path))
            }
            other => other,
        }
    }

    /// Build a registry from an explicit device list instead of a file.
    ///
    /// Used when the caller was invoked with device arguments; pairing is
    /// then by name only and nothing is ever written back.
    pub fn from_device_list<P: AsRef<Path>>(cfg: &Config, devices: &[P]) -> Self {
        let mut reg = Self::empty(cfg.file_path());
        reg.list_mode = true;
        for path in devices {
            let path = path.as_ref().to_string_lossy().into_owned();
            let mut entry = UseEntry::new(IdKind::Devname);
            entry.idname = Some(path.clone());
            entry.devname = Some(path);
            reg.entries.push(entry);
        }
        reg
    }

    /// All entries, in file order.
    pub fn entries(&self) -> &[UseEntry] {
        &self.entries
    }

    /// Version parsed from the file (or last written).
    pub fn version(&self) -> Version {
        self.version
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether in-memory state differs from the file and a write is due.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Whether the file came from a different host (`SYSTEMID` mismatch)
    /// and a full re-validation is advisable.
    pub fn needs_refresh(&self) -> bool {
        self.needs_refresh
    }

    /// First entry whose PVID equals `pvid`.
    pub fn find_by_pvid(&self, pvid: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.pvid.as_deref() == Some(pvid))
    }

    /// First entry whose device-name hint equals `devname`.
    pub fn find_by_devname(&self, devname: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.devname.as_deref() == Some(devname))
    }

    /// First entry listed under exactly this identity.
    pub fn find_by_id(&self, idtype: IdKind, idname: &str, part: u32) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.idtype == idtype && e.idname.as_deref() == Some(idname) && e.part == part)
    }

    /// Entries that matched no present device. Reported, never auto-removed.
    pub fn orphans(&self) -> Vec<usize> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.dev.is_none())
            .map(|(i, _)| i)
            .collect()
    }

    /// The `(idtype-tag, idname)` pair for embedding in volume-group
    /// metadata, or `None` when the device's identity kind is unstable.
    pub fn id_hint(&self, cache: &DeviceCache, dev_idx: usize) -> Option<(&'static str, String)> {
        let id = cache.dev(dev_idx).active_id()?;
        if !id.kind.is_stable() {
            return None;
        }
        Some((id.kind.tag(), id.name.clone()?))
    }

    /// List a device in the registry.
    ///
    /// The identity kind is picked per the selection policy (caller's
    /// choice first, then DM/loop/MD specials, then WWID, serial, and
    /// finally the unstable device name). Collisions with existing entries
    /// surface as [`Error::IdentityConflict`] unless `opts.yes` is set;
    /// a colliding entry that is just another partition of the same primary
    /// device is accepted silently.
    ///
    /// Returns the index of the new or updated entry.
    pub fn add_device(
        &mut self,
        cache: &mut DeviceCache,
        dev_idx: usize,
        cfg: &Config,
        opts: &AddOptions<'_>,
    ) -> Result<usize> {
        let (kind, idname) = choose_id(cache, dev_idx, cfg, opts);
        let dev = cache.dev(dev_idx);
        let part = dev.part;
        let devname = dev.path.to_string_lossy().into_owned();
        let pvid = opts.pvid.map(str::to_string).or_else(|| dev.pvid.clone());

        if let Some(existing) = self.check_conflict(&kind, idname.as_deref(), part, pvid.as_deref(), opts)? {
            let entry = &mut self.entries[existing];
            entry.idtype = kind;
            entry.idname = idname;
            entry.devname = Some(devname);
            entry.pvid = pvid;
            entry.part = part;
            entry.dev = Some(dev_idx);
            cache.dev_mut(dev_idx).set_matched(kind);
            self.dirty = true;
            self.added_devs = true;
            return Ok(existing);
        }

        let mut entry = UseEntry::new(kind);
        entry.idname = idname;
        entry.devname = Some(devname);
        entry.pvid = pvid;
        entry.part = part;
        entry.dev = Some(dev_idx);
        cache.dev_mut(dev_idx).set_matched(kind);
        self.entries.push(entry);
        self.dirty = true;
        self.added_devs = true;
        Ok(self.entries.len() - 1)
    }

    /// Check a prospective entry against the existing ones.
    ///
    /// `Ok(Some(i))` means entry `i` already describes this device and
    /// should be updated in place; `Ok(None)` means no collision.
    fn check_conflict(
        &self,
        kind: &IdKind,
        idname: Option<&str>,
        part: u32,
        pvid: Option<&str>,
        opts: &AddOptions<'_>,
    ) -> Result<Option<usize>> {
        for (i, e) in self.entries.iter().enumerate() {
            let same_id = e.idtype == *kind && e.idname.as_deref() == idname && idname.is_some();
            if same_id && e.part == part {
                // Same device slot. Re-adding is idempotent unless the
                // content changed underneath.
                if e.pvid.is_some() && pvid.is_some() && e.pvid.as_deref() != pvid && !opts.yes {
                    return Err(Error::IdentityConflict {
                        reason: format!("entry {e} holds a different PVID"),
                    });
                }
                return Ok(Some(i));
            }
            if same_id {
                // Another partition of the same primary; both may be listed.
                continue;
            }
            if pvid.is_some() && e.pvid.as_deref() == pvid {
                if !opts.yes {
                    return Err(Error::IdentityConflict {
                        reason: format!("PVID already listed by entry {e}"),
                    });
                }
                return Ok(Some(i));
            }
        }
        Ok(None)
    }

    /// Remove the entry whose device-name hint is `devname`.
    ///
    /// Returns whether an entry was removed. The matched flag of a paired
    /// device is cleared so the identity filter stops accepting it.
    pub fn remove_by_devname(&mut self, cache: Option<&mut DeviceCache>, devname: &str) -> bool {
        match self.find_by_devname(devname) {
            Some(i) => {
                self.remove_at(cache, i);
                true
            }
            None => false,
        }
    }

    /// Remove the entry carrying `pvid`.
    pub fn remove_by_pvid(&mut self, cache: Option<&mut DeviceCache>, pvid: &str) -> bool {
        match self.find_by_pvid(pvid) {
            Some(i) => {
                self.remove_at(cache, i);
                true
            }
            None => false,
        }
    }

    fn remove_at(&mut self, cache: Option<&mut DeviceCache>, idx: usize) {
        let entry = self.entries.remove(idx);
        if let (Some(cache), Some(dev_idx)) = (cache, entry.dev) {
            cache.dev_mut(dev_idx).clear_matched();
        }
        self.dirty = true;
    }
}

/// Pick the identity a new entry will be listed under. Falls through the
/// policy order until something is readable; the device name always is.
fn choose_id(
    cache: &mut DeviceCache,
    dev_idx: usize,
    cfg: &Config,
    opts: &AddOptions<'_>,
) -> (IdKind, Option<String>) {
    if let Some(kind) = opts.idtype {
        match cache.dev_id(dev_idx, kind) {
            Some(read) => {
                if let Some(requested) = opts.idname {
                    if requested != read {
                        warn!(
                            "{}: requested {kind} {requested} differs from device value {read}",
                            cache.dev(dev_idx).path.display()
                        );
                    }
                }
                return (kind, Some(read));
            }
            None => warn!(
                "{}: requested id type {kind} is not readable, selecting automatically",
                cache.dev(dev_idx).path.display()
            ),
        }
    }

    let major = cache.dev(dev_idx).major;
    let mut candidates: Vec<IdKind> = Vec::new();
    if cache.majors().is_dm(major) {
        candidates.extend([IdKind::MpathUuid, IdKind::CryptUuid]);
        if cfg.scan_lvs {
            candidates.push(IdKind::LvmlvUuid);
        }
    } else if cache.majors().is_loop(major) {
        candidates.push(IdKind::LoopFile);
    } else if cache.majors().is_md(major) {
        candidates.push(IdKind::MdUuid);
    } else {
        candidates.extend([IdKind::SysWwid, IdKind::SysSerial]);
    }

    for kind in candidates {
        if let Some(value) = cache.dev_id(dev_idx, kind) {
            return (kind, Some(value));
        }
    }
    let name = cache.dev_id(dev_idx, IdKind::Devname);
    (IdKind::Devname, name)
}
