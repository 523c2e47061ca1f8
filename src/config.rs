// Take a look at the license at the top of the repository in the LICENSE file.

use std::path::PathBuf;

/// Name of the registry file used when no alternate name is configured.
pub const SYSTEM_DEVICES_FILE: &str = "system.devices";

/// Sentinel touched in the run directory after a rename search found
/// nothing, so that later commands skip the (expensive) device reads.
pub const SEARCHED_DEVNAMES: &str = "searched_devnames";

/// How widely the rename search (`search_for_devnames`) is allowed to look
/// for devices whose kernel name changed since the registry was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SearchMode {
    /// Never search.
    None,
    /// Search only for the system devices file, and skip devices that
    /// already carry a stable identity.
    #[default]
    Auto,
    /// Search for any registry file and consider every candidate device.
    All,
}

/// Where device information beyond sysfs may come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExternalInfo {
    /// Sysfs only.
    #[default]
    None,
    /// Also consult udev properties (requires the `udev` cargo feature).
    Udev,
}

/// Filesystem roots the crate reads from.
///
/// Everything the crate touches outside the registry file itself goes
/// through these paths, so tests can point them at scratch directories.
#[derive(Debug, Clone)]
pub struct SystemPaths {
    /// Root of the sysfs mount, normally `/sys`.
    pub sysfs: PathBuf,
    /// Root of the device node tree, normally `/dev`.
    pub devfs: PathBuf,
    /// Root of the procfs mount, normally `/proc`.
    pub procfs: PathBuf,
    /// Runtime state directory, normally `/run/lvm`-like; holds the
    /// rename-search sentinel.
    pub run_dir: PathBuf,
    /// Directory holding `multipath.conf` and `multipath/conf.d/`.
    pub etc_dir: PathBuf,
}

impl Default for SystemPaths {
    fn default() -> Self {
        Self {
            sysfs: PathBuf::from("/sys"),
            devfs: PathBuf::from("/dev"),
            procfs: PathBuf::from("/proc"),
            run_dir: PathBuf::from("/run/devreg"),
            etc_dir: PathBuf::from("/etc"),
        }
    }
}

impl SystemPaths {
    /// Sysfs directory for a device node, `<sysfs>/dev/block/<major>:<minor>`.
    pub fn sys_dev_block(&self, major: u32, minor: u32) -> PathBuf {
        self.sysfs.join(format!("dev/block/{major}:{minor}"))
    }

    /// Sysfs directory for a whole-disk kernel name, `<sysfs>/block/<name>`.
    pub fn sys_block(&self, name: &str) -> PathBuf {
        self.sysfs.join("block").join(name)
    }
}

/// Configuration for the registry and its helpers.
///
/// The defaults mirror a production host; tests relocate [`Config::paths`]
/// and the directories below into tempdirs.
#[derive(Debug, Clone)]
pub struct Config {
    /// Master switch. When off, [`crate::Registry::load`] reports the
    /// feature as disabled instead of reading anything.
    pub enable_devices_file: bool,
    /// Directory holding the registry file.
    pub devices_dir: PathBuf,
    /// Alternate file name. `None` selects [`SYSTEM_DEVICES_FILE`]; naming
    /// any other file disables system-file-only optimisations such as the
    /// rename-search sentinel.
    pub devices_file: Option<String>,
    /// Directory for the sibling lockfile.
    pub lock_dir: PathBuf,
    /// Rename-search scope.
    pub search_for_devnames: SearchMode,
    /// Permit identities backed by LVM logical volumes (`LVM-` DM UUIDs).
    pub scan_lvs: bool,
    /// Path of the multipath wwids file. `None` disables WWID-based
    /// multipath-component detection.
    pub multipath_wwids_file: Option<PathBuf>,
    /// Source of device information beyond sysfs.
    pub external_info: ExternalInfo,
    /// Identifier of the local host, compared against the file header.
    pub system_id: Option<String>,
    /// Filesystem roots.
    pub paths: SystemPaths,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enable_devices_file: true,
            devices_dir: PathBuf::from("/etc/devreg/devices"),
            devices_file: None,
            lock_dir: PathBuf::from("/run/lock/devreg"),
            search_for_devnames: SearchMode::default(),
            scan_lvs: false,
            multipath_wwids_file: Some(PathBuf::from("/etc/multipath/wwids")),
            external_info: ExternalInfo::default(),
            system_id: None,
            paths: SystemPaths::default(),
        }
    }
}

impl Config {
    /// Full path of the registry file.
    pub fn file_path(&self) -> PathBuf {
        let name = self.devices_file.as_deref().unwrap_or(SYSTEM_DEVICES_FILE);
        self.devices_dir.join(name)
    }

    /// Whether the configured file is the system devices file (as opposed
    /// to an operator-named alternate).
    pub fn is_system_file(&self) -> bool {
        self.devices_file.is_none()
    }

    /// Path of the advisory lockfile, `D_<basename>` under the lock dir.
    pub fn lockfile_path(&self) -> PathBuf {
        let name = self.devices_file.as_deref().unwrap_or(SYSTEM_DEVICES_FILE);
        self.lock_dir.join(format!("D_{name}"))
    }

    /// Path of the rename-search sentinel.
    pub fn sentinel_path(&self) -> PathBuf {
        self.paths.run_dir.join(SEARCHED_DEVNAMES)
    }
}
