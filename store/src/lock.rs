use crate::prelude::*;
use nix::{
  errno::Errno,
  fcntl::{flock, FlockArg},
};
use std::{
  fs::File,
  os::unix::io::{AsRawFd, RawFd},
  path::{Path, PathBuf},
};

/// An exclusive `flock(2)` held for as long as the value lives. Serializes
/// the production of one store path across threads and processes.
#[derive(Debug)]
pub struct PathLock {
  _fd: File,
  path: PathBuf,
}

impl PathLock {
  pub fn try_lock<P: AsRef<Path>>(path: P) -> Result<Option<Self>> {
    let path = path.as_ref();
    let file = open(path)?;
    if lock_file(file.as_raw_fd(), FlockArg::LockExclusiveNonblock)? {
      Ok(Some(Self {
        _fd: file,
        path: path.to_owned(),
      }))
    } else {
      Ok(None)
    }
  }

  pub fn lock<P: AsRef<Path>>(path: P) -> Result<Self> {
    let path = path.as_ref();
    let file = open(path)?;
    lock_file(file.as_raw_fd(), FlockArg::LockExclusive)
      .with_context(|| format!("while locking `{}'", path.display()))?;
    Ok(Self {
      _fd: file,
      path: path.to_owned(),
    })
  }

  pub fn path(&self) -> &Path {
    &self.path
  }
}

fn open(path: &Path) -> Result<File> {
  if let Some(parent) = path.parent() {
    std::fs::create_dir_all(parent)?;
  }
  File::create(path).with_context(|| format!("while creating lock file `{}'", path.display()))
}

fn lock_file(fd: RawFd, ty: FlockArg) -> Result<bool> {
  loop {
    match flock(fd, ty) {
      Ok(()) => return Ok(true),
      Err(Errno::EWOULDBLOCK) => return Ok(false),
      Err(Errno::EINTR) => continue,
      Err(e) => return Err(e.into()),
    }
  }
}
