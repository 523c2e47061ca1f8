// Take a look at the license at the top of the repository in the LICENSE file.

//! Persistence behaviour observable through real files: version
//! monotonicity, refusal rules that protect foreign content, and the
//! try-update race between two registry holders.

mod common;

use std::fs;

use common::{add_wwid, empty_cache, fake_dev, pvid, test_env, write_devices_file};
use devreg::{AddOptions, DevicesLock, Error, LockMode, Registry};

#[test]
fn every_write_increments_the_counter() {
    let env = test_env();
    let cfg = &env.cfg;
    let mut cache = empty_cache(cfg);
    add_wwid(cfg, 8, 16, "sdb", "naa.count");
    let idx = cache.push(fake_dev(cfg, "sdb", 8, 16, None));

    let mut reg = Registry::load_for_create(cfg, true, false).unwrap();
    reg.add_device(&mut cache, idx, cfg, &AddOptions::default()).unwrap();
    reg.write(cfg).unwrap();
    assert_eq!(reg.version().counter, 1);

    let p = pvid('9');
    for expected in 2..5 {
        let mut reg = Registry::load(cfg).unwrap();
        // Any edit will do; toggle a pvid through add with yes.
        reg.add_device(
            &mut cache,
            idx,
            cfg,
            &AddOptions {
                yes: true,
                pvid: Some(&p),
                ..Default::default()
            },
        )
        .unwrap();
        reg.write(cfg).unwrap();
        assert_eq!(reg.version().counter, expected);
        assert_eq!(Registry::load(cfg).unwrap().version().counter, expected);
    }
}

#[test]
fn refused_writes_leave_the_file_untouched() {
    let env = test_env();
    let cfg = &env.cfg;

    for content in [
        "VERSION=5.0.3\nIDTYPE=sys_wwid IDNAME=naa.future DEVNAME=/dev/sda PVID=.\n",
        "VERSION=not-a-version\nIDTYPE=sys_wwid IDNAME=naa.odd DEVNAME=/dev/sda PVID=.\n",
    ] {
        let path = write_devices_file(cfg, content);
        let mut reg = Registry::load(cfg).unwrap();
        assert_eq!(reg.entries().len(), 1, "entries are still readable");
        let err = reg.write(cfg).unwrap_err();
        assert!(matches!(
            err,
            Error::VersionTooNew { .. } | Error::FileUnparseable { .. }
        ));
        assert_eq!(fs::read_to_string(&path).unwrap(), content);
    }
}

#[test]
fn missing_file_means_disabled_except_for_first_pv_creation() {
    let env = test_env();
    let cfg = &env.cfg;

    assert!(matches!(
        Registry::load(cfg),
        Err(Error::FileMissing { .. })
    ));
    // Not a first-PV creation: still disabled.
    assert!(matches!(
        Registry::load_for_create(cfg, false, false),
        Err(Error::FileMissing { .. })
    ));
    // First-PV creation, but the host already has PVs: still disabled.
    assert!(matches!(
        Registry::load_for_create(cfg, true, true),
        Err(Error::FileMissing { .. })
    ));
    // First-PV creation on a clean host: empty registry, file appears on
    // the first write.
    let reg = Registry::load_for_create(cfg, true, false).unwrap();
    assert!(reg.entries().is_empty());
    assert!(!cfg.file_path().exists());
}

#[test]
fn master_switch_disables_even_an_existing_file() {
    let env = test_env();
    let mut cfg = env.cfg.clone();
    write_devices_file(&cfg, "VERSION=1.1.1\n");
    cfg.enable_devices_file = false;
    assert!(matches!(Registry::load(&cfg), Err(Error::FileMissing { .. })));
}

#[test]
fn try_update_abandons_after_concurrent_write() {
    let env = test_env();
    let cfg = &env.cfg;

    write_devices_file(
        cfg,
        "VERSION=1.1.5\n\
         IDTYPE=sys_wwid IDNAME=naa.first DEVNAME=/dev/sda PVID=.\n\
         IDTYPE=sys_wwid IDNAME=naa.second DEVNAME=/dev/sdb PVID=.\n",
    );

    // A and B both read at counter 5.
    let mut reg_a = Registry::load(cfg).unwrap();
    let mut reg_b = Registry::load(cfg).unwrap();

    // A edits under the exclusive lock and bumps the counter to 6.
    let mut lock_a = DevicesLock::new(cfg);
    let mut held = false;
    lock_a.lock(LockMode::Exclusive, &mut held).unwrap();
    assert!(reg_a.remove_by_devname(None, "/dev/sda"));
    reg_a.write(cfg).unwrap();
    lock_a.unlock(held);
    assert_eq!(reg_a.version().counter, 6);

    // B's best-effort update sees the counter moved and gives up without
    // an error.
    let mut lock_b = DevicesLock::new(cfg);
    assert!(reg_b.remove_by_devname(None, "/dev/sdb"));
    let written = reg_b.try_update(cfg, &mut lock_b).unwrap();
    assert!(!written);

    let content = fs::read_to_string(cfg.file_path()).unwrap();
    assert!(content.contains("VERSION=1.1.6\n"));
    assert!(content.contains("naa.second"), "B's stale edit never landed");
    assert!(!content.contains("naa.first"));
}

#[test]
fn try_update_writes_when_nothing_raced() {
    let env = test_env();
    let cfg = &env.cfg;

    write_devices_file(
        cfg,
        "VERSION=1.1.8\nIDTYPE=sys_wwid IDNAME=naa.solo DEVNAME=/dev/sda PVID=.\n",
    );
    let mut reg = Registry::load(cfg).unwrap();
    assert!(reg.remove_by_devname(None, "/dev/sda"));

    let mut lock = DevicesLock::new(cfg);
    assert!(reg.try_update(cfg, &mut lock).unwrap());
    assert_eq!(reg.version().counter, 9);
    assert!(!reg.is_dirty());

    // Clean registries do not write at all.
    let mut reg = Registry::load(cfg).unwrap();
    assert!(!reg.try_update(cfg, &mut lock).unwrap());
    assert_eq!(Registry::load(cfg).unwrap().version().counter, 9);
}

#[test]
fn try_update_skips_while_the_lock_is_held() {
    let env = test_env();
    let cfg = &env.cfg;

    write_devices_file(
        cfg,
        "VERSION=1.1.2\nIDTYPE=sys_wwid IDNAME=naa.busy DEVNAME=/dev/sda PVID=.\n",
    );
    let mut holder = DevicesLock::new(cfg);
    let mut held = false;
    holder.lock(LockMode::Exclusive, &mut held).unwrap();

    let mut reg = Registry::load(cfg).unwrap();
    assert!(reg.remove_by_devname(None, "/dev/sda"));
    let mut lock = DevicesLock::new(cfg);
    assert!(!reg.try_update(cfg, &mut lock).unwrap());
    holder.unlock(held);

    // The file still has the entry.
    assert!(fs::read_to_string(cfg.file_path()).unwrap().contains("naa.busy"));
}
