// Take a look at the license at the top of the repository in the LICENSE file.

//! `devreg` is a crate volume-management tools use to decide, stably across
//! reboots, renames, and hotplug events, which block devices on a host they
//! are allowed to touch.
//!
//! Operators list a device once; every later command recognises it through a
//! stable identity (WWID, serial, DM or MD UUID, loop backing file) even if
//! its kernel name changed, detects impostors that reuse an old name with
//! different content, and refuses to operate on anything unlisted.
//!
//! The listed devices live in a small line-oriented file (the *devices
//! file*), mirrored in memory by [`Registry`]. A command's life cycle is:
//!
//! 1. [`Registry::load`] parses the file under the advisory lock.
//! 2. [`Registry::match_devices`] pairs entries against a [`DeviceCache`]
//!    populated by the caller's device enumeration.
//! 3. The caller scans labels and stores each device's PVID on its record.
//! 4. [`Registry::validate_ids`] reconciles entries against what the scan
//!    actually read, unmatching impostors.
//! 5. [`Registry::search_renamed`] re-pairs entries whose unstable
//!    device-name identity went stale.
//! 6. If anything changed, [`Registry::write`] atomically replaces the file.
//!
//! ```no_run
//! use devreg::{Config, DeviceCache, DevicesLock, LockMode, Registry};
//!
//! let cfg = Config::default();
//! let mut lock = DevicesLock::new(&cfg);
//! let mut held = false;
//! lock.lock(LockMode::Shared, &mut held)?;
//! let mut reg = Registry::load(&cfg)?;
//! lock.unlock(held);
//!
//! let mut cache = DeviceCache::new(&cfg);
//! // ... caller enumerates block devices into `cache` ...
//! reg.match_devices(&mut cache);
//! for entry in reg.entries() {
//!     println!("{entry}");
//! }
//! # Ok::<(), devreg::Error>(())
//! ```

#![deny(missing_docs)]
#![allow(clippy::upper_case_acronyms)]

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

mod config;
mod devcache;
mod file;
mod filter;
mod idkind;
mod label;
mod lock;
mod matcher;
mod mpath;
mod registry;
mod validate;

pub use crate::config::{
    Config, ExternalInfo, SEARCHED_DEVNAMES, SYSTEM_DEVICES_FILE, SearchMode, SystemPaths,
};
pub use crate::devcache::{DeviceCache, DeviceId, DeviceRecord, Majors};
pub use crate::file::DEVICES_FILE_MAJOR;
pub use crate::filter::{AcceptAll, FilterChain, FilterStage, is_listed};
pub use crate::idkind::IdKind;
pub use crate::label::read_pvid;
pub use crate::lock::{DevicesLock, LockMode};
pub use crate::mpath::{MultipathDetector, mpath_group_wwid};
pub use crate::registry::{AddOptions, Registry, UseEntry, Version};
pub use crate::validate::{RenameReport, ValidateReport};

/// Errors surfaced by the registry and its helpers.
///
/// Parse problems inside entry lines and validation mismatches are recovered
/// locally (with warnings) and never reach this type; what does reach it is
/// the conditions a caller has to act on.
#[derive(Debug, Error)]
pub enum Error {
    /// The registry file does not exist. Readers treat this as "feature
    /// disabled on this host" unless the implicit-creation rule applies.
    #[error("devices file {path} does not exist", path = .path.display())]
    FileMissing {
        /// Path that was looked up.
        path: PathBuf,
    },

    /// The file header was malformed. Reading continued entry-wise, but the
    /// in-memory registry refuses to write itself back.
    #[error("devices file {path} has a malformed header", path = .path.display())]
    FileUnparseable {
        /// Path of the malformed file.
        path: PathBuf,
    },

    /// The on-disk major version is newer than this implementation writes.
    /// Reads proceed; writes are refused to avoid corrupting a newer layout.
    #[error("devices file version {found}.x.y is newer than supported major {supported}")]
    VersionTooNew {
        /// Major version found in the file.
        found: u32,
        /// Highest major this implementation writes.
        supported: u32,
    },

    /// The advisory lock is held by another process.
    #[error("devices file lock {path} is busy", path = .path.display())]
    LockBusy {
        /// Path of the lockfile.
        path: PathBuf,
    },

    /// An add operation collides with an existing entry on PVID or
    /// identity, and the caller did not pass `yes`.
    #[error("device conflicts with listed entry: {reason}")]
    IdentityConflict {
        /// Human-readable description of the colliding entry.
        reason: String,
    },

    /// I/O failure with the path it happened on.
    #[error("{path}: {source}", path = .path.display())]
    Io {
        /// Path being accessed.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
}

impl Error {
    pub(crate) fn io(path: &Path, source: io::Error) -> Self {
        Error::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Convenience alias used across the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;
