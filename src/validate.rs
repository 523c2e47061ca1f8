// Take a look at the license at the top of the repository in the LICENSE file.

//! Post-scan reconciliation of the registry against what the label scan
//! actually read, and the search for devices whose kernel name changed.
//!
//! The disk is authoritative: where a stable-identity entry disagrees with
//! the PVID read from its device, the entry is corrected in place. For the
//! unstable device-name kind it is the other way around; the PVID decides
//! whether the name still refers to the listed device, and an impostor gets
//! the entry unmatched rather than the entry rewritten.

use std::collections::HashMap;
use std::fs;

use log::{debug, warn};

use crate::config::{Config, SearchMode};
use crate::devcache::DeviceCache;
use crate::filter::{FilterChain, RENAME_SEARCH_STAGES};
use crate::idkind::IdKind;
use crate::label;
use crate::registry::Registry;
use crate::{Error, Result};

/// What a validation pass did.
#[derive(Debug, Default)]
pub struct ValidateReport {
    /// Number of entries edited in place (PVID or devname refreshed).
    pub updated: usize,
    /// Cache indices of devices that were unmatched and are referenced by
    /// no remaining entry; the caller drops them from its own caches and
    /// filters.
    pub dropped: Vec<usize>,
    /// Entry indices skipped because a downstream filter excluded their
    /// device; the entries are stale but left alone.
    pub stale: Vec<usize>,
}

/// What a rename search found.
#[derive(Debug, Default)]
pub struct RenameReport {
    /// `(entry index, device index)` pairs that were re-paired; the caller
    /// re-runs its scan on these devices.
    pub renamed: Vec<(usize, usize)>,
    /// Wanted PVIDs that showed up on more than one device, with every
    /// device that reported them. Nothing is re-paired for these.
    pub ambiguous: Vec<(String, Vec<usize>)>,
    /// Whether candidate devices were actually read (false when the search
    /// was suppressed by configuration or the sentinel).
    pub searched: bool,
}

impl Registry {
    /// Reconcile matched entries against the scan results.
    ///
    /// `startup` marks boot-time callers, which must not churn `devname`
    /// hints while device names are still settling.
    pub fn validate_ids(
        &mut self,
        cache: &mut DeviceCache,
        cfg: &Config,
        startup: bool,
    ) -> ValidateReport {
        let _ = cfg;
        let mut report = ValidateReport::default();
        let mut unmatched: Vec<usize> = Vec::new();

        for i in 0..self.entries.len() {
            let Some(dev_idx) = self.entries[i].dev else {
                continue;
            };
            if !cache.dev(dev_idx).scanned {
                continue;
            }

            if self.entries[i].idtype.is_stable() {
                self.validate_stable(cache, i, dev_idx, startup, &mut report);
            } else {
                self.validate_devname(cache, i, dev_idx, &mut report, &mut unmatched);
            }
        }

        // A device only gets wiped downstream once nothing else lists it.
        unmatched.retain(|&d| self.entries.iter().all(|e| e.dev != Some(d)));
        report.dropped = unmatched;
        report
    }

    fn validate_stable(
        &mut self,
        cache: &DeviceCache,
        entry_idx: usize,
        dev_idx: usize,
        startup: bool,
        report: &mut ValidateReport,
    ) {
        let dev = cache.dev(dev_idx);
        if dev.filtered {
            warn!(
                "listed device {} is excluded by filters; entry is stale",
                dev.path.display()
            );
            report.stale.push(entry_idx);
            return;
        }

        let entry = &mut self.entries[entry_idx];
        if entry.pvid != dev.pvid {
            debug!(
                "updating PVID for {} ({} -> {})",
                dev.path.display(),
                entry.pvid.as_deref().unwrap_or("."),
                dev.pvid.as_deref().unwrap_or("."),
            );
            entry.pvid = dev.pvid.clone();
            self.dirty = true;
            report.updated += 1;
        }

        let current = dev.path.to_string_lossy();
        if !startup && entry.devname.as_deref() != Some(current.as_ref()) {
            entry.devname = Some(current.into_owned());
            self.dirty = true;
            report.updated += 1;
        }
    }

    fn validate_devname(
        &mut self,
        cache: &mut DeviceCache,
        entry_idx: usize,
        dev_idx: usize,
        report: &mut ValidateReport,
        unmatched: &mut Vec<usize>,
    ) {
        let dev_pvid = cache.dev(dev_idx).pvid.clone();
        let current = cache.dev(dev_idx).path.to_string_lossy().into_owned();
        let entry = &mut self.entries[entry_idx];

        if entry.pvid == dev_pvid {
            if entry.devname.as_deref() != Some(current.as_str()) {
                entry.devname = Some(current);
                self.dirty = true;
                report.updated += 1;
            }
            return;
        }

        // The name was reused by different content. Unmatch; keep devname
        // as a historical hint for the operator and the rename search.
        warn!(
            "device {current} holds {} instead of listed {}; unmatching",
            dev_pvid.as_deref().unwrap_or("no PVID"),
            entry.pvid.as_deref().unwrap_or("no PVID"),
        );
        entry.dev = None;
        entry.idname = None;
        cache.dev_mut(dev_idx).clear_matched();
        unmatched.push(dev_idx);
        self.dirty = true;
    }

    /// Search present devices for the PVIDs of device-name entries that
    /// matched nothing, and re-pair each PVID found on exactly one device.
    ///
    /// Candidates are narrowed by the sysfs-only filter stages, and (in
    /// [`SearchMode::Auto`]) skip devices that already carry a stable
    /// identity, since those can never have been listed by name. Each
    /// surviving candidate costs one 4 KiB header read.
    pub fn search_renamed(
        &mut self,
        cache: &mut DeviceCache,
        cfg: &Config,
        filters: &mut dyn FilterChain,
    ) -> Result<RenameReport> {
        let mut report = RenameReport::default();

        match cfg.search_for_devnames {
            SearchMode::None => return Ok(report),
            SearchMode::Auto => {
                if !cfg.is_system_file() {
                    debug!("not searching devnames for a non-system devices file");
                    return Ok(report);
                }
                if cfg.sentinel_path().exists() {
                    debug!("previous search found nothing, skipping (sentinel present)");
                    return Ok(report);
                }
            }
            SearchMode::All => {}
        }

        let wanted: Vec<(usize, String)> = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.idtype == IdKind::Devname && e.dev.is_none())
            .filter_map(|(i, e)| e.pvid.clone().map(|p| (i, p)))
            .collect();
        if wanted.is_empty() {
            return Ok(report);
        }
        report.searched = true;

        let mut found: HashMap<String, Vec<usize>> = HashMap::new();
        for dev_idx in 0..cache.len() {
            if cache.dev(dev_idx).is_matched() {
                continue;
            }
            if !filters.pass_all(cache, dev_idx, RENAME_SEARCH_STAGES) {
                continue;
            }
            if cfg.search_for_devnames == SearchMode::Auto && has_stable_id(cache, dev_idx) {
                continue;
            }

            let path = cache.dev(dev_idx).path.clone();
            let pvid = match label::read_pvid(&path) {
                Ok(Some(pvid)) => pvid,
                Ok(None) => continue,
                Err(e) => {
                    debug!("cannot read header of {}: {e}", path.display());
                    continue;
                }
            };
            if wanted.iter().any(|(_, w)| *w == pvid) {
                // Keep scanning after a hit; a second device with the same
                // PVID must be detected, not silently shadowed.
                found.entry(pvid).or_default().push(dev_idx);
            }
        }

        for (entry_idx, pvid) in &wanted {
            match found.get(pvid).map(Vec::as_slice) {
                None | Some([]) => {}
                Some([dev_idx]) => {
                    self.repair_renamed(cache, *entry_idx, *dev_idx);
                    report.renamed.push((*entry_idx, *dev_idx));
                }
                Some(devs) => {
                    let names: Vec<String> = devs
                        .iter()
                        .map(|&d| cache.dev(d).path.display().to_string())
                        .collect();
                    warn!(
                        "PVID {pvid} found on multiple devices ({}); not re-pairing",
                        names.join(", ")
                    );
                    report.ambiguous.push((pvid.clone(), devs.to_vec()));
                }
            }
        }

        if report.renamed.is_empty()
            && !self.added_devs
            && cfg.search_for_devnames == SearchMode::Auto
            && cfg.is_system_file()
        {
            self.touch_sentinel(cfg)?;
        }
        Ok(report)
    }

    fn repair_renamed(&mut self, cache: &mut DeviceCache, entry_idx: usize, dev_idx: usize) {
        let (path, part) = {
            let dev = cache.dev(dev_idx);
            (dev.path.to_string_lossy().into_owned(), dev.part)
        };
        debug!(
            "devname entry {} now at {path}",
            self.entries[entry_idx]
        );
        let entry = &mut self.entries[entry_idx];
        entry.idname = Some(path.clone());
        entry.devname = Some(path.clone());
        entry.part = part;
        entry.dev = Some(dev_idx);
        let dev = cache.dev_mut(dev_idx);
        dev.cache_id(IdKind::Devname, Some(path));
        dev.set_matched(IdKind::Devname);
        self.dirty = true;
    }

    fn touch_sentinel(&self, cfg: &Config) -> Result<()> {
        let path = cfg.sentinel_path();
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(|e| Error::io(dir, e))?;
        }
        fs::File::create(&path).map_err(|e| Error::io(&path, e))?;
        debug!("search found nothing, created {}", path.display());
        Ok(())
    }
}

fn has_stable_id(cache: &mut DeviceCache, dev_idx: usize) -> bool {
    const STABLE: [IdKind; 7] = [
        IdKind::SysWwid,
        IdKind::SysSerial,
        IdKind::MpathUuid,
        IdKind::CryptUuid,
        IdKind::LvmlvUuid,
        IdKind::MdUuid,
        IdKind::LoopFile,
    ];
    let major = cache.dev(dev_idx).major;
    for kind in STABLE {
        if !kind.major_compatible(cache.majors(), major) {
            continue;
        }
        if cache.dev_id(dev_idx, kind).is_some() {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devcache::DeviceRecord;
    use crate::file;
    use crate::filter::AcceptAll;
    use crate::registry::Registry;
    use std::fs as stdfs;
    use std::path::Path;

    fn test_cfg(root: &Path) -> Config {
        let mut cfg = Config::default();
        cfg.paths.sysfs = root.join("sys");
        cfg.paths.devfs = root.join("dev");
        cfg.paths.procfs = root.join("proc");
        cfg.paths.run_dir = root.join("run");
        cfg.devices_dir = root.join("devices");
        cfg.lock_dir = root.join("lock");
        stdfs::create_dir_all(&cfg.paths.devfs).unwrap();
        stdfs::create_dir_all(&cfg.paths.procfs).unwrap();
        stdfs::write(
            cfg.paths.procfs.join("devices"),
            "Block devices:\n  8 sd\n253 device-mapper\n",
        )
        .unwrap();
        cfg
    }

    fn load(cfg: &Config, content: &str) -> Registry {
        let mut reg = Registry::empty(cfg.file_path());
        file::parse_into(&mut reg, content, cfg);
        reg
    }

    /// A "device" whose node is a plain file holding a labelled header.
    fn fake_labelled_dev(cfg: &Config, name: &str, pvid: &str) -> DeviceRecord {
        let path = cfg.paths.devfs.join(name);
        stdfs::write(&path, label::make_header(0, pvid)).unwrap();
        DeviceRecord::new(name, path, 8, 0)
    }

    fn pvid(fill: char) -> String {
        std::iter::repeat_n(fill, 32).collect()
    }

    #[test]
    fn stable_kind_takes_pvid_from_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = test_cfg(tmp.path());
        let mut cache = DeviceCache::new(&cfg);
        let idx = cache.push(DeviceRecord::new("sda", "/dev/sda", 8, 0));
        cache.dev_mut(idx).scanned = true;
        cache.dev_mut(idx).pvid = Some(pvid('n'));

        let mut reg = load(
            &cfg,
            &format!(
                "VERSION=1.1.1\nIDTYPE=sys_wwid IDNAME=naa.1 DEVNAME=/dev/sda PVID={}\n",
                pvid('o')
            ),
        );
        reg.entries[0].dev = Some(idx);

        let report = reg.validate_ids(&mut cache, &cfg, false);
        assert_eq!(report.updated, 1);
        assert_eq!(reg.entries()[0].pvid.as_deref(), Some(pvid('n').as_str()));
        assert!(reg.is_dirty());

        // A second pass over unchanged state makes no further edits.
        let report = reg.validate_ids(&mut cache, &cfg, false);
        assert_eq!(report.updated, 0);
    }

    #[test]
    fn stable_kind_clears_pvid_when_device_has_none() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = test_cfg(tmp.path());
        let mut cache = DeviceCache::new(&cfg);
        let idx = cache.push(DeviceRecord::new("sda", "/dev/sda", 8, 0));
        cache.dev_mut(idx).scanned = true;

        let mut reg = load(
            &cfg,
            &format!(
                "VERSION=1.1.1\nIDTYPE=sys_wwid IDNAME=naa.1 DEVNAME=/dev/sda PVID={}\n",
                pvid('p')
            ),
        );
        reg.entries[0].dev = Some(idx);
        reg.validate_ids(&mut cache, &cfg, false);
        assert_eq!(reg.entries()[0].pvid, None);
    }

    #[test]
    fn unscanned_devices_are_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = test_cfg(tmp.path());
        let mut cache = DeviceCache::new(&cfg);
        let idx = cache.push(DeviceRecord::new("sda", "/dev/sda", 8, 0));

        let mut reg = load(
            &cfg,
            &format!(
                "VERSION=1.1.1\nIDTYPE=sys_wwid IDNAME=naa.1 DEVNAME=/dev/sda PVID={}\n",
                pvid('q')
            ),
        );
        reg.entries[0].dev = Some(idx);
        let report = reg.validate_ids(&mut cache, &cfg, false);
        assert_eq!(report.updated, 0);
        assert!(!reg.is_dirty());
    }

    #[test]
    fn filtered_device_marks_entry_stale() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = test_cfg(tmp.path());
        let mut cache = DeviceCache::new(&cfg);
        let idx = cache.push(DeviceRecord::new("sda", "/dev/sda", 8, 0));
        cache.dev_mut(idx).scanned = true;
        cache.dev_mut(idx).filtered = true;

        let mut reg = load(&cfg, "VERSION=1.1.1\nIDTYPE=sys_wwid IDNAME=naa.1 DEVNAME=/dev/sda PVID=.\n");
        reg.entries[0].dev = Some(idx);
        let report = reg.validate_ids(&mut cache, &cfg, false);
        assert_eq!(report.stale, vec![0]);
        assert!(!reg.is_dirty());
    }

    #[test]
    fn startup_does_not_churn_devnames() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = test_cfg(tmp.path());
        let mut cache = DeviceCache::new(&cfg);
        let idx = cache.push(DeviceRecord::new("sdz", "/dev/sdz", 8, 0));
        cache.dev_mut(idx).scanned = true;

        let mut reg = load(&cfg, "VERSION=1.1.1\nIDTYPE=sys_wwid IDNAME=naa.1 DEVNAME=/dev/sda PVID=.\n");
        reg.entries[0].dev = Some(idx);

        reg.validate_ids(&mut cache, &cfg, true);
        assert_eq!(reg.entries()[0].devname.as_deref(), Some("/dev/sda"));

        reg.validate_ids(&mut cache, &cfg, false);
        assert_eq!(reg.entries()[0].devname.as_deref(), Some("/dev/sdz"));
    }

    #[test]
    fn impostor_is_unmatched_and_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = test_cfg(tmp.path());
        let mut cache = DeviceCache::new(&cfg);
        let idx = cache.push(DeviceRecord::new("sdd", "/dev/sdd", 8, 48));
        cache.dev_mut(idx).scanned = true;
        cache.dev_mut(idx).pvid = Some(pvid('z'));

        let mut reg = load(
            &cfg,
            &format!(
                "VERSION=1.1.1\nIDTYPE=devname IDNAME=/dev/sdd DEVNAME=/dev/sdd PVID={}\n",
                pvid('y')
            ),
        );
        reg.match_devices(&mut cache);
        assert_eq!(reg.entries()[0].device(), Some(idx));

        let report = reg.validate_ids(&mut cache, &cfg, false);
        assert_eq!(report.dropped, vec![idx]);
        assert_eq!(reg.entries()[0].device(), None);
        assert_eq!(reg.entries()[0].idname, None);
        // devname stays as a hint.
        assert_eq!(reg.entries()[0].devname.as_deref(), Some("/dev/sdd"));
        assert!(!cache.dev(idx).is_matched());
        assert!(reg.is_dirty());
    }

    #[test]
    fn rename_search_repairs_single_hit() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = test_cfg(tmp.path());
        let mut cache = DeviceCache::new(&cfg);
        let dev = fake_labelled_dev(&cfg, "sdg", &pvid('x'));
        let devfs = cfg.paths.devfs.clone();
        let idx = cache.push(dev);

        let mut reg = load(
            &cfg,
            &format!(
                "VERSION=1.1.1\nIDTYPE=devname IDNAME=/dev/sdc DEVNAME=/dev/sdc PVID={}\n",
                pvid('x')
            ),
        );
        reg.match_devices(&mut cache);
        assert_eq!(reg.entries()[0].device(), None);

        let report = reg.search_renamed(&mut cache, &cfg, &mut AcceptAll).unwrap();
        assert!(report.searched);
        assert_eq!(report.renamed, vec![(0, idx)]);
        let expected = devfs.join("sdg").to_string_lossy().into_owned();
        assert_eq!(reg.entries()[0].idname.as_deref(), Some(expected.as_str()));
        assert_eq!(reg.entries()[0].devname.as_deref(), Some(expected.as_str()));
        assert_eq!(reg.entries()[0].device(), Some(idx));
        assert!(cache.dev(idx).is_matched());
        // Something was found, so no sentinel.
        assert!(!cfg.sentinel_path().exists());
    }

    #[test]
    fn rename_search_reports_duplicates_without_repairing() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = test_cfg(tmp.path());
        let mut cache = DeviceCache::new(&cfg);
        let a = cache.push(fake_labelled_dev(&cfg, "sde", &pvid('w')));
        let mut second = fake_labelled_dev(&cfg, "sdf", &pvid('w'));
        second.minor = 16;
        let b = cache.push(second);

        let mut reg = load(
            &cfg,
            &format!(
                "VERSION=1.1.1\nIDTYPE=devname IDNAME=/dev/gone DEVNAME=/dev/gone PVID={}\n",
                pvid('w')
            ),
        );
        let report = reg.search_renamed(&mut cache, &cfg, &mut AcceptAll).unwrap();
        assert_eq!(report.renamed, vec![]);
        assert_eq!(report.ambiguous.len(), 1);
        assert_eq!(report.ambiguous[0].1, vec![a, b]);
        assert_eq!(reg.entries()[0].device(), None);
    }

    #[test]
    fn fruitless_search_touches_sentinel_and_then_skips() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = test_cfg(tmp.path());
        let mut cache = DeviceCache::new(&cfg);
        cache.push(fake_labelled_dev(&cfg, "sdh", &pvid('u')));

        let mut reg = load(
            &cfg,
            &format!(
                "VERSION=1.1.1\nIDTYPE=devname IDNAME=/dev/gone DEVNAME=/dev/gone PVID={}\n",
                pvid('t')
            ),
        );
        let report = reg.search_renamed(&mut cache, &cfg, &mut AcceptAll).unwrap();
        assert!(report.searched);
        assert!(report.renamed.is_empty());
        assert!(cfg.sentinel_path().exists());

        // Sentinel suppresses the next search in auto mode.
        let report = reg.search_renamed(&mut cache, &cfg, &mut AcceptAll).unwrap();
        assert!(!report.searched);

        // But not in all mode.
        let mut all_cfg = cfg.clone();
        all_cfg.search_for_devnames = SearchMode::All;
        let report = reg.search_renamed(&mut cache, &all_cfg, &mut AcceptAll).unwrap();
        assert!(report.searched);
    }

    #[test]
    fn non_system_file_is_not_searched_in_auto_mode() {
        let tmp = tempfile::tempdir().unwrap();
        let mut cfg = test_cfg(tmp.path());
        cfg.devices_file = Some("alt.devices".into());
        let mut cache = DeviceCache::new(&cfg);
        cache.push(fake_labelled_dev(&cfg, "sdi", &pvid('s')));

        let mut reg = load(
            &cfg,
            &format!(
                "VERSION=1.1.1\nIDTYPE=devname IDNAME=/dev/gone DEVNAME=/dev/gone PVID={}\n",
                pvid('s')
            ),
        );
        let report = reg.search_renamed(&mut cache, &cfg, &mut AcceptAll).unwrap();
        assert!(!report.searched);

        cfg.search_for_devnames = SearchMode::All;
        let report = reg.search_renamed(&mut cache, &cfg, &mut AcceptAll).unwrap();
        assert!(report.searched);
        assert_eq!(report.renamed.len(), 1);
    }

    #[test]
    fn search_mode_none_never_reads() {
        let tmp = tempfile::tempdir().unwrap();
        let mut cfg = test_cfg(tmp.path());
        cfg.search_for_devnames = SearchMode::None;
        let mut cache = DeviceCache::new(&cfg);
        cache.push(fake_labelled_dev(&cfg, "sdj", &pvid('r')));

        let mut reg = load(
            &cfg,
            &format!(
                "VERSION=1.1.1\nIDTYPE=devname IDNAME=/dev/gone DEVNAME=/dev/gone PVID={}\n",
                pvid('r')
            ),
        );
        let report = reg.search_renamed(&mut cache, &cfg, &mut AcceptAll).unwrap();
        assert!(!report.searched);
        assert!(report.renamed.is_empty());
    }
}
