use crate::prelude::*;
use nix::{
  mount::{mount, umount2, MntFlags, MsFlags},
  sched::{unshare, CloneFlags},
  sys::statvfs::statvfs,
  unistd::{chdir, chroot, getgid, getuid, pivot_root},
};
use std::{
  fs, io,
  os::unix::process::CommandExt,
  path::{Component, Path, PathBuf},
  process::Command,
};

const NULL: Option<&'static str> = None;

/// Mount flags a remount inside a user namespace has to keep.
fn locked() -> MsFlags {
  MsFlags::MS_NOSUID
    | MsFlags::MS_NODEV
    | MsFlags::MS_NOEXEC
    | MsFlags::MS_NOATIME
    | MsFlags::MS_NODIRATIME
    | MsFlags::MS_RELATIME
}

#[derive(Debug, Clone)]
struct Bind {
  source: PathBuf,
  target: PathBuf,
  writable: bool,
}

/// Private filesystem root for one build. Host paths appear at the same
/// location inside it; everything else is absent.
#[derive(Debug)]
pub(super) struct Chroot {
  root: PathBuf,
  work_dir: PathBuf,
  binds: Vec<Bind>,
}

/// `path` relocated under `root`.
fn inside(root: &Path, path: &Path) -> PathBuf {
  let mut out = root.to_path_buf();
  out.extend(path.components().filter(|c| matches!(c, Component::Normal(_))));
  out
}

fn os(e: nix::Error) -> io::Error {
  io::Error::from_raw_os_error(e as i32)
}

impl Chroot {
  /// Lays out an empty root at `root`. Its store directory is a plain
  /// writable directory, which is where the builder creates `$out`.
  pub(super) fn new(root: &Path, store_dir: &Path, work_dir: &Path) -> Result<Self> {
    fs::create_dir(root)?;
    fs::create_dir(root.join("real-root"))?;
    fs::create_dir_all(inside(root, store_dir))?;
    Ok(Self {
      root: root.to_path_buf(),
      work_dir: work_dir.to_path_buf(),
      binds: vec![],
    })
  }

  /// Makes `source` visible inside the root. A missing `optional` source is
  /// left out.
  pub(super) fn bind(&mut self, source: &Path, writable: bool, optional: bool) -> Result<()> {
    let meta = match fs::metadata(source) {
      Ok(m) => m,
      Err(e) if optional && e.kind() == io::ErrorKind::NotFound => return Ok(()),
      Err(e) => {
        return Err(e).with_context(|| format!("unable to expose `{}' to the build", source.display()))
      }
    };
    let target = inside(&self.root, source);
    if meta.is_dir() {
      fs::create_dir_all(&target)?;
    } else {
      if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
      }
      fs::write(&target, "")?;
    }
    trace!("bind mounting"; "source" => %source.display(), "target" => %target.display());
    self.binds.push(Bind {
      source: source.to_path_buf(),
      target,
      writable,
    });
    Ok(())
  }

  /// Where `path`, as the builder sees it, lives on the host.
  pub(super) fn host_path(&self, path: &Path) -> PathBuf {
    inside(&self.root, path)
  }

  /// Makes the child enter fresh user and mount namespaces and pivot into
  /// the root before it runs the builder, mapping the calling user onto
  /// itself. With `private_network` it also gets a network namespace with
  /// nothing in it.
  pub(super) fn confine(&self, cmd: &mut Command, private_network: bool) {
    let uid_map = format!("{} {} 1", getuid(), getuid());
    let gid_map = format!("{} {} 1", getgid(), getgid());
    let mut flags = CloneFlags::CLONE_NEWUSER | CloneFlags::CLONE_NEWNS;
    if private_network {
      flags |= CloneFlags::CLONE_NEWNET;
    }
    let root = self.root.clone();
    let work_dir = self.work_dir.clone();
    let binds = self.binds.clone();

    let enter = move || -> io::Result<()> {
      unshare(flags).map_err(os)?;
      fs::write("/proc/self/setgroups", "deny")?;
      fs::write("/proc/self/uid_map", &uid_map)?;
      fs::write("/proc/self/gid_map", &gid_map)?;

      mount(NULL, "/", NULL, MsFlags::MS_PRIVATE | MsFlags::MS_REC, NULL).map_err(os)?;
      mount(Some(root.as_path()), root.as_path(), NULL, MsFlags::MS_BIND, NULL).map_err(os)?;
      for bind in &binds {
        mount(
          Some(bind.source.as_path()),
          bind.target.as_path(),
          NULL,
          MsFlags::MS_BIND | MsFlags::MS_REC,
          NULL,
        )
        .map_err(os)?;
        if !bind.writable {
          let current = statvfs(bind.target.as_path()).map_err(os)?.flags().bits();
          let keep = MsFlags::from_bits_truncate(current) & locked();
          mount(
            NULL,
            bind.target.as_path(),
            NULL,
            MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY | keep,
            NULL,
          )
          .map_err(os)?;
        }
      }

      chdir(root.as_path()).map_err(os)?;
      pivot_root(".", "real-root").map_err(os)?;
      chroot(".").map_err(os)?;
      umount2("real-root", MntFlags::MNT_DETACH).map_err(os)?;
      fs::remove_dir("real-root")?;
      chdir(work_dir.as_path()).map_err(os)?;
      Ok(())
    };

    // runs in the forked child, which has a single thread as unshare(2) wants
    unsafe {
      cmd.pre_exec(enter);
    }
  }
}
