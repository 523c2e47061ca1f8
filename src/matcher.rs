// Take a look at the license at the top of the repository in the LICENSE file.

//! Pairing of registry entries to present devices.
//!
//! No device I/O happens here; everything is decided from sysfs reads
//! (memoised on the device records) and name lookups. Running the matcher
//! twice over the same cache yields the same pairings.

use std::fs;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::Path;

use log::debug;

use crate::devcache::DeviceCache;
use crate::idkind::IdKind;
use crate::registry::{Registry, UseEntry};

impl Registry {
    /// Pair each entry that has no device yet with a present device.
    ///
    /// The last-known `devname` is tried first since it is usually still
    /// correct; only when that fails is the whole cache scanned. A device
    /// already paired to another entry is never paired again.
    pub fn match_devices(&mut self, cache: &mut DeviceCache) {
        for i in 0..self.entries.len() {
            if self.entries[i].dev.is_some() {
                continue;
            }

            if let Some(hint) = self.entries[i].devname.clone() {
                if let Some(idx) = cache.lookup_path(Path::new(&hint)) {
                    if !cache.dev(idx).is_matched() && self.try_pair(cache, i, idx) {
                        continue;
                    }
                }
            }

            // In device-list mode pairing is by name only; a missing name
            // means the device is simply not present.
            if self.list_mode {
                continue;
            }

            for idx in 0..cache.len() {
                if cache.dev(idx).is_matched() {
                    continue;
                }
                if self.try_pair(cache, i, idx) {
                    break;
                }
            }
        }
    }

    fn try_pair(&mut self, cache: &mut DeviceCache, entry_idx: usize, dev_idx: usize) -> bool {
        let entry = self.entries[entry_idx].clone();
        if !self.list_mode && !entry_matches(&entry, cache, dev_idx) {
            return false;
        }
        let kind = self.entries[entry_idx].idtype;
        self.entries[entry_idx].dev = Some(dev_idx);
        cache.dev_mut(dev_idx).set_matched(kind);
        debug!(
            "entry {} matched to {}",
            self.entries[entry_idx],
            cache.dev(dev_idx).path.display()
        );
        true
    }
}

fn entry_matches(entry: &UseEntry, cache: &mut DeviceCache, dev_idx: usize) -> bool {
    {
        let dev = cache.dev(dev_idx);
        if !entry.idtype.major_compatible(cache.majors(), dev.major) {
            return false;
        }
        if dev.part != entry.part {
            return false;
        }
    }
    let Some(idname) = entry.idname.as_deref() else {
        // Identity was lost; only the rename search can restore it.
        return false;
    };

    if entry.idtype == IdKind::Devname {
        if cache.dev_id(dev_idx, IdKind::Devname).as_deref() == Some(idname) {
            return true;
        }
        return dm_name_equivalent(cache, dev_idx, idname);
    }
    cache.dev_id(dev_idx, entry.idtype).as_deref() == Some(idname)
}

/// Old files may hold one alias of a device-mapper device (`/dev/dm-3`)
/// while the cache lists another (`/dev/mapper/foo`). The two are the same
/// device iff the stored path stats to the candidate's major:minor. This is
/// the only place a path from the file is dereferenced.
fn dm_name_equivalent(cache: &DeviceCache, dev_idx: usize, stored: &str) -> bool {
    let dev = cache.dev(dev_idx);
    if !cache.majors().is_dm(dev.major) {
        return false;
    }
    let md = match fs::metadata(stored) {
        Ok(md) => md,
        Err(e) => {
            debug!("stored name {stored} does not resolve: {e}");
            return false;
        }
    };
    if !md.file_type().is_block_device() {
        return false;
    }
    let rdev = md.rdev() as libc::dev_t;
    libc::major(rdev) as u32 == dev.major && libc::minor(rdev) as u32 == dev.minor
}
