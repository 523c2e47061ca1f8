// Take a look at the license at the top of the repository in the LICENSE file.

//! On-disk layout of the devices file.
//!
//! The format is line-oriented ASCII: `#` comments, two header lines
//! (`SYSTEMID=`, `VERSION=major.minor.counter`), then one `KEY=VALUE ...`
//! line per entry. Readers accept fields in any order; the writer emits
//! the fixed order `IDTYPE IDNAME DEVNAME PVID [PART]`. A literal `.`
//! in any field means "absent".
//!
//! Writes go through an atomic replace (sibling temp file, `rename`, then
//! an fsync of the directory) so a crash leaves either the old content or
//! the new content, never a mixture.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::config::Config;
use crate::idkind::IdKind;
use crate::lock::DevicesLock;
use crate::registry::{Registry, UseEntry, Version};
use crate::{Error, Result};

/// Highest on-disk major version this implementation writes. A file with a
/// larger major is readable, but writes to it are refused so an older tool
/// cannot corrupt a newer layout.
pub const DEVICES_FILE_MAJOR: u32 = 1;

const DEVICES_FILE_MINOR: u32 = 1;

fn none_if_dot(v: &str) -> Option<String> {
    if v == "." || v.is_empty() {
        None
    } else {
        Some(v.to_string())
    }
}

pub(crate) fn read(cfg: &Config, path: &Path) -> Result<Registry> {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(Error::FileMissing {
                path: path.to_path_buf(),
            });
        }
        Err(e) => return Err(Error::io(path, e)),
    };
    let mut reg = Registry::empty(path.to_path_buf());
    parse_into(&mut reg, &content, cfg);
    Ok(reg)
}

pub(crate) fn parse_into(reg: &mut Registry, content: &str, cfg: &Config) {
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if let Some(v) = line.strip_prefix("SYSTEMID=") {
            let v = v.split_whitespace().next().unwrap_or("");
            reg.system_id = none_if_dot(v);
            if let (Some(file_id), Some(local)) = (reg.system_id.as_deref(), cfg.system_id.as_deref())
            {
                if file_id != local {
                    warn!(
                        "devices file {} was written by system {file_id}, local system is {local}",
                        reg.path.display()
                    );
                    reg.needs_refresh = true;
                }
            }
            continue;
        }

        if let Some(v) = line.strip_prefix("VERSION=") {
            let v = v.split_whitespace().next().unwrap_or("");
            match v.parse::<Version>() {
                Ok(version) => {
                    reg.version = version;
                    if version.major > DEVICES_FILE_MAJOR {
                        warn!(
                            "devices file {} has version {version}, newer than supported major {DEVICES_FILE_MAJOR}; it will not be rewritten",
                            reg.path.display()
                        );
                    }
                }
                Err(()) => {
                    warn!(
                        "devices file {} has unparseable version {v:?}; it will not be rewritten",
                        reg.path.display()
                    );
                    reg.unparseable = true;
                }
            }
            continue;
        }

        if let Some(entry) = parse_entry(line) {
            reg.entries.push(entry);
        }
    }
}

/// Parse one entry line. Returns `None` (after a warning) for lines that
/// do not carry both an identity type and an identity name.
fn parse_entry(line: &str) -> Option<UseEntry> {
    let mut idtype: Option<&str> = None;
    let mut idname: Option<String> = None;
    let mut saw_idname = false;
    let mut devname: Option<String> = None;
    let mut pvid: Option<String> = None;
    let mut part: u32 = 0;

    for token in line.split_whitespace() {
        let Some((key, value)) = token.split_once('=') else {
            debug!("ignoring stray token {token:?} in devices file");
            continue;
        };
        match key {
            "IDTYPE" => idtype = Some(value),
            "IDNAME" => {
                saw_idname = true;
                idname = none_if_dot(value);
            }
            "DEVNAME" => devname = none_if_dot(value),
            "PVID" => pvid = none_if_dot(value),
            "PART" => match value.parse() {
                Ok(p) => part = p,
                Err(_) => debug!("ignoring unparseable PART={value:?}"),
            },
            other => debug!("ignoring unknown devices file field {other}"),
        }
    }

    let Some(tag) = idtype else {
        warn!("ignoring devices file line without IDTYPE: {line}");
        return None;
    };
    if !saw_idname {
        warn!("ignoring devices file line without IDNAME: {line}");
        return None;
    }
    let Some(idtype) = IdKind::from_tag(tag) else {
        warn!("ignoring devices file entry with unsupported IDTYPE={tag}");
        return None;
    };

    let mut entry = UseEntry::new(idtype);
    entry.idname = idname;
    entry.devname = devname;
    entry.pvid = pvid;
    entry.part = part;
    Some(entry)
}

fn render(reg: &Registry, cfg: &Config, version: Version) -> String {
    let system_id = cfg
        .system_id
        .as_deref()
        .or(reg.system_id.as_deref());
    let mut out = String::new();
    out.push_str("# Block devices the volume manager on this host may use.\n");
    out.push_str("# Managed by devreg; edit under the devices file lock.\n");
    out.push_str(&format!("SYSTEMID={}\n", system_id.unwrap_or(".")));
    out.push_str(&format!("VERSION={version}\n"));
    for entry in &reg.entries {
        out.push_str(&entry.to_string());
        out.push('\n');
    }
    out
}

/// Read just the version header of a devices file, for the concurrent
/// update re-check. `None` when the file or the header is missing.
pub(crate) fn read_version(path: &Path) -> Option<Version> {
    let content = fs::read_to_string(path).ok()?;
    for line in content.lines() {
        if let Some(v) = line.trim().strip_prefix("VERSION=") {
            return v.split_whitespace().next().unwrap_or("").parse().ok();
        }
    }
    None
}

pub(crate) fn write(reg: &mut Registry, cfg: &Config) -> Result<()> {
    if reg.list_mode {
        debug!("not writing devices file in device-list mode");
        return Ok(());
    }
    if reg.unparseable {
        return Err(Error::FileUnparseable {
            path: reg.path.clone(),
        });
    }
    if reg.version.major > DEVICES_FILE_MAJOR {
        return Err(Error::VersionTooNew {
            found: reg.version.major,
            supported: DEVICES_FILE_MAJOR,
        });
    }

    let next = Version {
        major: DEVICES_FILE_MAJOR,
        minor: DEVICES_FILE_MINOR,
        counter: reg.version.counter + 1,
    };
    let content = render(reg, cfg, next);

    let dir = reg
        .path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    fs::create_dir_all(&dir).map_err(|e| Error::io(&dir, e))?;

    let tmp = temp_path(&reg.path);
    if let Err(e) = write_temp(&tmp, &content) {
        let _ = fs::remove_file(&tmp);
        return Err(Error::io(&tmp, e));
    }

    // Rename over the final name, then flush the directory so the rename
    // itself is durable.
    if let Err(e) = fs::rename(&tmp, &reg.path) {
        let _ = fs::remove_file(&tmp);
        return Err(Error::io(&reg.path, e));
    }
    let dirf = fs::File::open(&dir).map_err(|e| Error::io(&dir, e))?;
    dirf.sync_all().map_err(|e| Error::io(&dir, e))?;

    reg.version = next;
    reg.dirty = false;
    if cfg.system_id.is_some() {
        reg.system_id = cfg.system_id.clone();
    }
    if reg.added_devs {
        if cfg.is_system_file() {
            // New devices invalidate any previous fruitless rename search.
            let _ = fs::remove_file(cfg.sentinel_path());
        }
        reg.added_devs = false;
    }
    debug!("wrote devices file {} version {next}", reg.path.display());
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push("_new");
    path.with_file_name(name)
}

fn write_temp(tmp: &Path, content: &str) -> io::Result<()> {
    let mut f = fs::File::create(tmp)?;
    f.write_all(content.as_bytes())?;
    f.flush()?;
    Ok(())
}

impl Registry {
    /// Atomically rewrite the devices file from the in-memory state.
    ///
    /// Refused when the header was unparseable or the on-disk major version
    /// is newer than [`DEVICES_FILE_MAJOR`]. On success the version counter
    /// has been incremented and the dirty flag cleared. Callers doing a
    /// read-modify-write hold the exclusive lock across the whole cycle.
    pub fn write(&mut self, cfg: &Config) -> Result<()> {
        write(self, cfg)
    }

    /// Best-effort write used after validation by commands that only held
    /// the shared lock for their initial read.
    ///
    /// Takes the exclusive lock without blocking; on contention, or when a
    /// concurrent writer already bumped the on-disk version counter past
    /// what was first read, the update is abandoned silently. Returns
    /// whether the file was written.
    pub fn try_update(&mut self, cfg: &Config, lock: &mut DevicesLock) -> Result<bool> {
        if !self.dirty {
            return Ok(false);
        }
        if !lock.try_exclusive()? {
            debug!("devices file lock busy, skipping update");
            return Ok(false);
        }
        let result: Result<bool> = (|| {
            if let Some(on_disk) = read_version(&self.path) {
                if on_disk.counter != self.version.counter {
                    debug!(
                        "devices file {} changed underneath (counter {} -> {}), skipping update",
                        self.path.display(),
                        self.version.counter,
                        on_disk.counter
                    );
                    return Ok(false);
                }
            }
            write(self, cfg)?;
            Ok(true)
        })();
        lock.unlock(false);
        result
    }
}
