use super::{builtins, sys};
use crate::{
  prelude::*,
  settings::{BuildMode, SandboxMode, Settings},
};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::{
  collections::{BTreeMap, HashMap},
  fmt::Display,
  fs::{self, File},
  io::{self, BufRead, BufReader, Write},
  os::unix::{fs::PermissionsExt, process::ExitStatusExt},
  path::Path,
  process::{Child, Command, ExitStatus, Stdio},
  sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
  },
  time::{Duration, Instant},
};

const LOG_EXCERPT_LINES: usize = 10;
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Host files a fixed-output builder needs to reach the network.
const NETWORK_FILES: &[&str] = &[
  "/etc/resolv.conf",
  "/etc/hosts",
  "/etc/services",
  "/etc/nsswitch.conf",
  "/etc/ssl/certs",
];

type Outcome = std::result::Result<StoreObject, Arc<anyhow::Error>>;

/// One build and everybody waiting for it. The build stops only once every
/// waiter has been cancelled.
#[derive(Default)]
struct InFlight {
  outcome: OnceCell<Outcome>,
  waiters: Mutex<Vec<Cancel>>,
}

impl InFlight {
  fn abandoned(&self) -> bool {
    self.waiters.lock().iter().all(Cancel::is_cancelled)
  }

  fn check(&self) -> Result<()> {
    if self.abandoned() {
      Err(Error::Cancelled.into())
    } else {
      Ok(())
    }
  }
}

/// Runs derivations and commits their outputs to the store.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Builder {
  #[derivative(Debug = "ignore")]
  store: Arc<dyn Store>,
  settings: Arc<Settings>,
  #[derivative(Debug = "ignore")]
  in_flight: Mutex<HashMap<DrvId, Arc<InFlight>>>,
  started: AtomicUsize,
}

impl Builder {
  pub fn new(store: Arc<dyn Store>, settings: Arc<Settings>) -> Self {
    Self {
      store,
      settings,
      in_flight: Default::default(),
      started: AtomicUsize::new(0),
    }
  }

  pub fn store(&self) -> &Arc<dyn Store> {
    &self.store
  }

  pub fn settings(&self) -> &Settings {
    &self.settings
  }

  /// How many times a builder was actually started.
  pub fn builds_started(&self) -> usize {
    self.started.load(Ordering::SeqCst)
  }

  /// Produces the output of `drv`, whose inputs must already be built and
  /// listed in `inputs`. Callers asking for the same derivation at the same
  /// time share one build and its result, failure included. The build is
  /// stopped when all of them are cancelled; a caller arriving after that
  /// starts it again.
  pub fn build(
    &self,
    drv: &Derivation,
    inputs: &BTreeMap<DrvId, StoreObject>,
    cancel: &Cancel,
  ) -> Result<StoreObject> {
    let flight = self.in_flight.lock().entry(drv.id).or_default().clone();
    flight.waiters.lock().push(cancel.clone());

    let outcome = flight.outcome.get_or_try_init(|| {
      match self.build_uncached(drv, inputs, &flight) {
        Ok(obj) => Ok(Ok(obj)),
        Err(e) if Error::find(&e) == Some(&Error::Cancelled) => Err(e),
        Err(e) => Ok(Err(Arc::new(e))),
      }
    });

    {
      let mut in_flight = self.in_flight.lock();
      if in_flight.get(&drv.id).map_or(false, |f| Arc::ptr_eq(f, &flight)) {
        in_flight.remove(&drv.id);
      }
    }

    match outcome? {
      Ok(obj) => Ok(obj.clone()),
      Err(e) => Err(replay(e)),
    }
  }

  fn build_uncached(
    &self,
    drv: &Derivation,
    inputs: &BTreeMap<DrvId, StoreObject>,
    flight: &InFlight,
  ) -> Result<StoreObject> {
    let store = &*self.store;
    let out = drv.out_path();
    let check = self.settings.build_mode() == BuildMode::Check;

    for (path, dep) in &drv.input_derivations {
      let ready = match inputs.get(&dep.id) {
        Some(obj) => obj.path == *path && store.is_valid_path(path)?,
        None => false,
      };
      if !ready {
        return Err(
          Error::MissingBuiltOutput {
            attribute: dep.name.clone(),
            path: store.print_store_path(path),
          }
          .into(),
        );
      }
    }

    flight.check()?;
    let _lock = store.lock_path(out)?;
    let existing = store.query_path_info(out)?;
    if let Some(obj) = &existing {
      if !check {
        debug!("output already valid"; "derivation" => %drv.id, "path" => %out);
        return Ok(obj.clone());
      }
    }

    let real = store.to_real_path(out);
    let tmp = store.temp_dir()?;

    // when checking, the registered output steps aside so the rebuild sees the
    // same `$out`; it is put back whatever happens
    let saved = match &existing {
      Some(_) => {
        let saved = tmp.path().join("registered");
        fs::rename(&real, &saved)?;
        Some(saved)
      }
      None => {
        rm_rf::ensure_removed(&real)?;
        None
      }
    };
    let _restore = scopeguard::guard(saved, |saved| {
      if let Some(saved) = saved {
        if let Err(e) = rm_rf::ensure_removed(&real).map_err(anyhow::Error::from).and_then(|_| {
          fs::rename(&saved, &real)?;
          Ok(())
        }) {
          error!("unable to restore output"; "path" => %real.display(), "error" => %e);
        }
      }
    });

    self.started.fetch_add(1, Ordering::SeqCst);
    info!("building"; "derivation" => %drv.id, "name" => &drv.name);

    let log_path = store.build_log_path(out);
    if let Some(parent) = log_path.parent() {
      fs::create_dir_all(parent)?;
    }
    let mut log = File::create(&log_path)?;
    let timeout = drv.timeout.or_else(|| self.settings.build_timeout());

    let result = if builtins::is_builtin(&drv.builder) {
      let limit = timeout.unwrap_or_else(|| self.settings.fetch_options().timeout);
      builtins::run(drv, &real, &mut log, limit).map_err(|e| {
        let _ = writeln!(log, "error: {:#}", e);
        failure(drv, format!("{:#}", e), &log_path)
      })
    } else {
      self.run_builder(drv, &real, tmp.path(), &log, &log_path, timeout, flight)
    };

    let result = result.and_then(|_| {
      if fs::symlink_metadata(&real).is_err() {
        return Err(failure(drv, "builder did not produce `$out'".into(), &log_path));
      }
      canonicalise(&real)?;
      verify_fixed_output(drv, &real)
    });
    if let Err(e) = result {
      rm_rf::ensure_removed(&real)?;
      return Err(e);
    }

    let (nar_hash, nar_size) = nar::hash_path(&real, HashType::SHA256)?;

    if let Some(existing) = existing {
      if existing.nar_hash != nar_hash {
        return Err(
          Error::NonDeterministicBuild {
            derivation: drv.id.to_string(),
            path: store.print_store_path(out),
            expected: existing.nar_hash.to_string(),
            actual: nar_hash.to_string(),
          }
          .into(),
        );
      }
      debug!("rebuild matches"; "derivation" => %drv.id, "path" => %out);
      return Ok(existing);
    }

    let info = StoreObject::new(
      out.clone(),
      nar_hash,
      nar_size as u64,
      Producer::Derivation(drv.id),
    )
    .with_refs(drv.input_paths());
    let obj = store.register_valid_path(info)?;
    info!("built"; "derivation" => %drv.id, "path" => %out, "size" => obj.nar_size);
    Ok(obj)
  }

  #[allow(clippy::too_many_arguments)]
  fn run_builder(
    &self,
    drv: &Derivation,
    out: &Path,
    tmp: &Path,
    log: &File,
    log_path: &Path,
    timeout: Option<Duration>,
    flight: &InFlight,
  ) -> Result<()> {
    if drv.platform != std::env::consts::ARCH {
      return Err(
        Error::UnsupportedArchitecture {
          architecture: drv.platform.clone(),
          attribute: Some(drv.name.clone()),
        }
        .into(),
      );
    }

    let store = &*self.store;
    let build_dir = tmp.join("build");
    fs::create_dir(&build_dir)?;
    let build_dir_str = build_dir.display().to_string();

    let mut env = drv.env.clone();
    let path = drv
      .input_derivations
      .keys()
      .map(|p| store.to_real_path(p).join("bin"))
      .filter(|p| p.is_dir())
      .map(|p| p.display().to_string())
      .collect::<Vec<_>>();
    env.insert(
      "PATH".into(),
      if path.is_empty() {
        "/path-not-set".into()
      } else {
        path.join(":")
      },
    );
    env.insert("HOME".into(), "/homeless-shelter".into());
    env.insert("NIX_STORE".into(), store.store_path().display().to_string());
    env.insert(
      "NIX_BUILD_CORES".into(),
      self.settings.effective_build_cores().to_string(),
    );
    env.insert("NIX_BUILD_TOP".into(), build_dir_str.clone());
    for var in ["TMPDIR", "TEMPDIR", "TMP", "TEMP", "PWD"] {
      env.insert(var.into(), build_dir_str.clone());
    }
    env.insert("out".into(), out.display().to_string());

    let command = || -> Result<Command> {
      let mut cmd = Command::new(&drv.builder);
      cmd
        .args(&drv.args)
        .env_clear()
        .envs(&env)
        .current_dir(&build_dir)
        .stdin(Stdio::null())
        .stdout(log.try_clone()?)
        .stderr(log.try_clone()?);
      Ok(cmd)
    };
    let cannot_start = |e: &dyn Display| {
      failure(
        drv,
        format!("unable to start builder `{}': {}", drv.builder, e),
        log_path,
      )
    };

    debug!("executing builder"; "builder" => &drv.builder, "args" => ?drv.args);
    let (mut child, chroot) = match self.settings.sandbox() {
      SandboxMode::Off => (command()?.spawn().map_err(|e| cannot_start(&e))?, None),
      mode => match self.spawn_confined(drv, tmp, &build_dir, command()?) {
        Ok((child, chroot)) => (child, Some(chroot)),
        Err(e) if mode == SandboxMode::Relaxed => {
          warn!("building without a sandbox"; "derivation" => %drv.id, "error" => %e);
          (command()?.spawn().map_err(|e| cannot_start(&e))?, None)
        }
        Err(e) => return Err(cannot_start(&format!("{:#}", e))),
      },
    };

    let started = Instant::now();
    let status = loop {
      if let Some(status) = child.try_wait()? {
        break status;
      }
      if flight.abandoned() {
        kill(&mut child);
        warn!("build cancelled"; "derivation" => %drv.id);
        return Err(Error::Cancelled.into());
      }
      if let Some(limit) = timeout {
        if started.elapsed() >= limit {
          kill(&mut child);
          return Err(failure(drv, format!("timed out after {:?}", limit), log_path));
        }
      }
      std::thread::sleep(POLL_INTERVAL);
    };

    if !status.success() {
      return Err(failure(drv, describe(status), log_path));
    }
    if let Some(chroot) = chroot {
      let built = chroot.host_path(out);
      if fs::symlink_metadata(&built).is_ok() {
        fs::rename(&built, out)?;
      }
    }
    Ok(())
  }

  /// Starts the builder inside a root holding only its build directory, the
  /// closure of its inputs and the configured sandbox paths.
  fn spawn_confined(
    &self,
    drv: &Derivation,
    tmp: &Path,
    build_dir: &Path,
    mut cmd: Command,
  ) -> Result<(Child, sys::Chroot)> {
    let store = &*self.store;
    let mut chroot = sys::Chroot::new(&tmp.join("root"), store.store_path(), build_dir)?;
    chroot.bind(build_dir, true, false)?;

    let mut closure = StorePathSet::new();
    for path in drv.input_paths() {
      store.compute_fs_closure(&path, &mut closure)?;
    }
    for path in &closure {
      chroot.bind(&store.to_real_path(path), false, false)?;
    }
    for entry in self.settings.sandbox_paths().iter() {
      chroot.bind(&entry.path, false, entry.optional)?;
    }
    chroot.bind(Path::new("/dev/null"), true, false)?;
    if drv.is_fixed_output() {
      for path in NETWORK_FILES {
        chroot.bind(Path::new(path), false, true)?;
      }
    }

    chroot.confine(&mut cmd, !drv.is_fixed_output());
    Ok((cmd.spawn()?, chroot))
  }
}

/// Rebuilds a typed error shared between callers of the same build.
fn replay(e: &anyhow::Error) -> anyhow::Error {
  match Error::find(e) {
    Some(typed) => typed.clone().into(),
    None => anyhow!("{:#}", e),
  }
}

fn kill(child: &mut Child) {
  let _ = child.kill();
  let _ = child.wait();
}

fn describe(status: ExitStatus) -> String {
  match (status.code(), status.signal()) {
    (Some(code), _) => format!("exited with code {}", code),
    (None, Some(signal)) => format!("killed by signal {}", signal),
    (None, None) => status.to_string(),
  }
}

fn log_excerpt(path: &Path) -> String {
  let lines = match File::open(path) {
    Ok(f) => BufReader::new(f)
      .lines()
      .filter_map(|l| l.ok())
      .collect::<Vec<_>>(),
    Err(_) => vec![],
  };
  lines[lines.len().saturating_sub(LOG_EXCERPT_LINES)..].join("\n")
}

fn failure(drv: &Derivation, status: String, log_path: &Path) -> anyhow::Error {
  Error::BuildFailure {
    derivation: drv.id.to_string(),
    name: drv.name.clone(),
    status,
    log_excerpt: log_excerpt(log_path),
  }
  .into()
}

/// Makes every file under `path` read-only, keeping the executable bit.
fn canonicalise(path: &Path) -> Result<()> {
  let meta = fs::symlink_metadata(path)?;
  if meta.is_dir() {
    for entry in fs::read_dir(path)? {
      canonicalise(&entry?.path())?;
    }
  } else if meta.is_file() {
    let mode = if meta.permissions().mode() & 0o100 != 0 {
      0o555
    } else {
      0o444
    };
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
  }
  Ok(())
}

fn verify_fixed_output(drv: &Derivation, out: &Path) -> Result<()> {
  let fixed = match drv.output.as_fixed() {
    Some(f) => f,
    None => return Ok(()),
  };
  let ty = fixed.hash.ty();
  let actual = match fixed.method {
    FileIngestionMethod::Flat => {
      ensure!(
        fs::symlink_metadata(out)?.is_file(),
        "output of flat fixed-output derivation `{}' is not a regular file",
        drv.name
      );
      let mut sink = HashSink::hasher(ty);
      io::copy(&mut File::open(out)?, &mut sink)?;
      sink.finish().1
    }
    FileIngestionMethod::Recursive => nar::hash_path(out, ty)?.0,
  };
  if actual != fixed.hash {
    return Err(
      Error::IntegrityViolation {
        name: drv.name.clone(),
        revision: drv.id.to_string(),
        expected: fixed.hash.to_string(),
        actual: actual.to_string(),
      }
      .into(),
    );
  }
  Ok(())
}
