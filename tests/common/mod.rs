// Take a look at the license at the top of the repository in the LICENSE file.

//! Shared scaffolding: a config whose filesystem roots all live in a
//! tempdir, plus builders for fake sysfs attributes and labelled devices.

// Not every test binary uses every helper.
#![allow(dead_code)]

use std::fs;
use std::path::PathBuf;

use devreg::{Config, DeviceCache, DeviceRecord};
use tempfile::TempDir;

pub const PVID_LEN: usize = 32;

pub struct TestEnv {
    // Dropping the TempDir removes the whole tree; keep it alive with the
    // config that points into it.
    _tmp: TempDir,
    pub cfg: Config,
}

pub fn test_env() -> TestEnv {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path();

    let mut cfg = Config::default();
    cfg.paths.sysfs = root.join("sys");
    cfg.paths.devfs = root.join("dev");
    cfg.paths.procfs = root.join("proc");
    cfg.paths.run_dir = root.join("run");
    cfg.paths.etc_dir = root.join("etc");
    cfg.devices_dir = root.join("devices");
    cfg.lock_dir = root.join("lock");
    cfg.multipath_wwids_file = None;

    fs::create_dir_all(&cfg.paths.devfs).unwrap();
    fs::create_dir_all(&cfg.paths.procfs).unwrap();
    fs::create_dir_all(&cfg.devices_dir).unwrap();
    fs::write(
        cfg.paths.procfs.join("devices"),
        "Character devices:\n  1 mem\n\nBlock devices:\n  7 loop\n  8 sd\n  9 md\n253 device-mapper\n259 blkext\n",
    )
    .unwrap();

    TestEnv { _tmp: tmp, cfg }
}

pub fn pvid(fill: char) -> String {
    std::iter::repeat_n(fill, PVID_LEN).collect()
}

/// A 4 KiB header carrying a volume label with the given PVID.
pub fn labelled_header(pvid: &str) -> Vec<u8> {
    assert_eq!(pvid.len(), PVID_LEN);
    let mut buf = vec![0u8; 4096];
    let offset = 32u32;
    buf[0..8].copy_from_slice(b"LABELONE");
    buf[20..24].copy_from_slice(&offset.to_le_bytes());
    buf[24..32].copy_from_slice(b"LVM2 001");
    buf[32..32 + PVID_LEN].copy_from_slice(pvid.as_bytes());
    buf
}

/// Register a `device/wwid` sysfs attribute for a device node.
pub fn add_wwid(cfg: &Config, major: u32, minor: u32, name: &str, wwid: &str) {
    for dir in [
        cfg.paths.sysfs.join(format!("dev/block/{major}:{minor}/device")),
        cfg.paths.sysfs.join(format!("block/{name}/device")),
    ] {
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("wwid"), format!("{wwid}\n")).unwrap();
    }
}

/// A device whose node is a plain file in the scratch devfs, optionally
/// holding a labelled header so the rename search can read a PVID off it.
pub fn fake_dev(
    cfg: &Config,
    name: &str,
    major: u32,
    minor: u32,
    label: Option<&str>,
) -> DeviceRecord {
    let path = cfg.paths.devfs.join(name);
    match label {
        Some(pvid) => fs::write(&path, labelled_header(pvid)).unwrap(),
        None => fs::write(&path, b"").unwrap(),
    }
    DeviceRecord::new(name, path, major, minor)
}

pub fn dev_path(cfg: &Config, name: &str) -> String {
    cfg.paths.devfs.join(name).to_string_lossy().into_owned()
}

pub fn empty_cache(cfg: &Config) -> DeviceCache {
    DeviceCache::new(cfg)
}

pub fn write_devices_file(cfg: &Config, content: &str) -> PathBuf {
    let path = cfg.file_path();
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(&path, content).unwrap();
    path
}
