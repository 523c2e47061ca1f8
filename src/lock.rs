// Take a look at the license at the top of the repository in the LICENSE file.

//! Advisory whole-file lock serialising edits of the devices file.
//!
//! The lock lives on a sibling lockfile `D_<basename>` in the configured
//! lock directory, taken with `flock(2)`. Editing commands hold it
//! exclusive across their whole read-modify-write; readers take it shared
//! around the parse only; validation updates try-lock at the end and give
//! up silently when someone else is writing.

use std::fs;
use std::io;
use std::os::unix::fs::DirBuilderExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::PathBuf;

use log::debug;

use crate::config::Config;
use crate::{Error, Result};

/// Lock mode for [`DevicesLock::lock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Shared among readers; excludes the exclusive lock.
    Shared,
    /// Exclusive; excludes everything, including shared holders.
    Exclusive,
}

/// Handle on the devices file lock.
///
/// Dropping the handle closes the lockfile descriptor, which releases any
/// lock still held.
pub struct DevicesLock {
    path: PathBuf,
    file: Option<fs::File>,
    mode: Option<LockMode>,
}

impl DevicesLock {
    /// A lock handle for the configured devices file. Nothing is opened or
    /// locked until the first acquisition.
    pub fn new(cfg: &Config) -> Self {
        Self {
            path: cfg.lockfile_path(),
            file: None,
            mode: None,
        }
    }

    fn open(&mut self) -> io::Result<RawFd> {
        if let Some(file) = &self.file {
            return Ok(file.as_raw_fd());
        }
        if let Some(dir) = self.path.parent() {
            if !dir.exists() {
                fs::DirBuilder::new().recursive(true).mode(0o700).create(dir)?;
            }
        }
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)?;
        let fd = file.as_raw_fd();
        self.file = Some(file);
        Ok(fd)
    }

    fn flock(&mut self, op: libc::c_int) -> io::Result<()> {
        let fd = self.open()?;
        loop {
            let rc = unsafe { libc::flock(fd, op) };
            if rc == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                return Err(err);
            }
        }
    }

    /// Take the lock, blocking until it is granted.
    ///
    /// Re-entering at the mode already held is permitted: `held` is set so
    /// the caller knows its paired [`DevicesLock::unlock`] must be a no-op,
    /// leaving the outer acquisition in force.
    pub fn lock(&mut self, mode: LockMode, held: &mut bool) -> Result<()> {
        if self.mode == Some(mode) {
            *held = true;
            return Ok(());
        }
        *held = false;
        let op = match mode {
            LockMode::Shared => libc::LOCK_SH,
            LockMode::Exclusive => libc::LOCK_EX,
        };
        self.flock(op).map_err(|e| {
            if e.raw_os_error() == Some(libc::EWOULDBLOCK) {
                Error::LockBusy {
                    path: self.path.clone(),
                }
            } else {
                Error::io(&self.path, e)
            }
        })?;
        self.mode = Some(mode);
        Ok(())
    }

    /// Try to take the exclusive lock without blocking.
    ///
    /// Returns whether it was granted; contention is not an error, it is
    /// how best-effort updates find out they should do nothing.
    pub fn try_exclusive(&mut self) -> Result<bool> {
        if self.mode == Some(LockMode::Exclusive) {
            return Ok(true);
        }
        match self.flock(libc::LOCK_EX | libc::LOCK_NB) {
            Ok(()) => {
                self.mode = Some(LockMode::Exclusive);
                Ok(true)
            }
            Err(e) if e.raw_os_error() == Some(libc::EWOULDBLOCK) => {
                debug!("devices file lock {} is busy", self.path.display());
                Ok(false)
            }
            Err(e) => Err(Error::io(&self.path, e)),
        }
    }

    /// Release the lock. With `held` set (a nested acquisition), this is a
    /// no-op and the outer holder keeps the lock.
    pub fn unlock(&mut self, held: bool) {
        if held {
            return;
        }
        if let Some(file) = &self.file {
            let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_UN) };
            if rc != 0 {
                debug!(
                    "unlock of {} failed: {}",
                    self.path.display(),
                    io::Error::last_os_error()
                );
            }
        }
        self.mode = None;
    }

    /// The mode currently held, if any.
    pub fn mode(&self) -> Option<LockMode> {
        self.mode
    }
}
