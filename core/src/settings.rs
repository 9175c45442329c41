use envix_settings_macro::Settings;
use std::{
  fmt::{self, Display},
  path::{Path, PathBuf},
  str::FromStr,
  time::Duration,
};

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum SandboxMode {
  On,
  Off,
  Relaxed,
}

impl Default for SandboxMode {
  fn default() -> Self {
    cfg_if::cfg_if! {
      if #[cfg(target_os = "linux")] {
        Self::Relaxed
      } else {
        Self::Off
      }
    }
  }
}

impl FromStr for SandboxMode {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "on" | "true" | "1" => Ok(Self::On),
      "off" | "false" | "0" => Ok(Self::Off),
      "relaxed" => Ok(Self::Relaxed),
      x => Err(format!("unknown sandbox mode `{}'", x)),
    }
  }
}

impl Display for SandboxMode {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      Self::On => "on",
      Self::Off => "off",
      Self::Relaxed => "relaxed",
    })
  }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum BuildMode {
  Build,
  /// Rebuild outputs that are already valid and compare the results.
  Check,
}

impl Default for BuildMode {
  fn default() -> Self {
    Self::Build
  }
}

impl FromStr for BuildMode {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "build" => Ok(Self::Build),
      "check" => Ok(Self::Check),
      x => Err(format!("unknown build mode `{}'", x)),
    }
  }
}

/// A host path a sandboxed builder may see.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SandboxPath {
  pub path: PathBuf,
  /// Skipped when the host does not have it.
  pub optional: bool,
}

/// Whitespace-separated absolute paths; a trailing `?` marks one as optional.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SandboxPaths(Vec<SandboxPath>);

impl SandboxPaths {
  pub fn iter(&self) -> impl Iterator<Item = &SandboxPath> {
    self.0.iter()
  }
}

impl FromStr for SandboxPaths {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    s.split_ascii_whitespace()
      .map(|entry| {
        let (path, optional) = match entry.strip_suffix('?') {
          Some(path) => (path, true),
          None => (entry, false),
        };
        if !Path::new(path).is_absolute() {
          return Err(format!("sandbox path `{}' is not absolute", path));
        }
        Ok(SandboxPath {
          path: path.into(),
          optional,
        })
      })
      .collect::<Result<_, _>>()
      .map(Self)
  }
}

impl Display for SandboxPaths {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    for (i, p) in self.0.iter().enumerate() {
      if i > 0 {
        f.write_str(" ")?;
      }
      write!(f, "{}{}", p.path.display(), if p.optional { "?" } else { "" })?;
    }
    Ok(())
  }
}

/// The shell and the libraries it loads.
fn default_sandbox_paths() -> SandboxPaths {
  let entry = |path: &str, optional| SandboxPath {
    path: path.into(),
    optional,
  };
  SandboxPaths(vec![
    entry("/bin/sh", false),
    entry("/lib", true),
    entry("/lib64", true),
    entry("/usr/lib", true),
    entry("/usr/lib64", true),
  ])
}

fn default_store_dir() -> PathBuf {
  std::env::var_os("HOME")
    .map(|h| PathBuf::from(h).join(".local/share/envix"))
    .unwrap_or_else(|| PathBuf::from("/var/lib/envix"))
}

fn default_max_jobs() -> usize {
  num_cpus::get()
}

fn default_retries() -> u32 {
  3
}

fn default_backoff_ms() -> u64 {
  500
}

fn default_fetch_timeout() -> u64 {
  300
}

#[derive(Settings, Debug, Clone)]
pub struct Settings {
  /// Root of the store; objects live in `<store_dir>/store`.
  #[setting(get = "deref", default_fn = "default_store_dir", env = "ENVIX_STORE_DIR")]
  store_dir: PathBuf,
  /// Builds allowed to run at the same time.
  #[setting(default_fn = "default_max_jobs", env = "ENVIX_MAX_JOBS")]
  max_jobs: usize,
  /// Passed to builders as `NIX_BUILD_CORES`; 0 means every core.
  #[setting(env = "ENVIX_BUILD_CORES")]
  build_cores: usize,
  #[setting(env = "ENVIX_SANDBOX")]
  sandbox: SandboxMode,
  /// Host paths bind-mounted read-only into every sandboxed build.
  #[setting(get = "ref", default_fn = "default_sandbox_paths", env = "ENVIX_SANDBOX_PATHS")]
  sandbox_paths: SandboxPaths,
  #[setting(env = "ENVIX_BUILD_MODE")]
  build_mode: BuildMode,
  #[setting(default_fn = "default_retries", env = "ENVIX_FETCH_RETRIES")]
  fetch_retries: u32,
  #[setting(default_fn = "default_backoff_ms", env = "ENVIX_FETCH_BACKOFF_MS")]
  fetch_backoff_ms: u64,
  #[setting(default_fn = "default_fetch_timeout", env = "ENVIX_FETCH_TIMEOUT_SECS")]
  fetch_timeout_secs: u64,
  /// Upper bound for a single build, unless the package sets its own; 0
  /// disables it.
  #[setting(env = "ENVIX_BUILD_TIMEOUT_SECS")]
  build_timeout_secs: u64,
}

impl Settings {
  pub fn effective_build_cores(&self) -> usize {
    match self.build_cores {
      0 => num_cpus::get(),
      n => n,
    }
  }

  pub fn fetch_options(&self) -> envix_eval::FetchOptions {
    envix_eval::FetchOptions {
      retries: self.fetch_retries,
      backoff: Duration::from_millis(self.fetch_backoff_ms),
      timeout: Duration::from_secs(self.fetch_timeout_secs),
    }
  }

  pub fn build_timeout(&self) -> Option<Duration> {
    match self.build_timeout_secs {
      0 => None,
      n => Some(Duration::from_secs(n)),
    }
  }

  /// Settings for a throwaway store under `root`, sandbox off.
  pub fn for_store(root: impl Into<PathBuf>) -> Self {
    let mut settings = Self::default();
    settings
      .set_store_dir(root.into())
      .set_sandbox(SandboxMode::Off)
      .set_max_jobs(4)
      .set_fetch_backoff_ms(1);
    settings
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_env_overrides() {
    let s = Settings::from_lookup(|var| match var {
      "ENVIX_STORE_DIR" => Some("/tmp/envix".into()),
      "ENVIX_SANDBOX" => Some("on".into()),
      "ENVIX_MAX_JOBS" => Some("2".into()),
      "ENVIX_BUILD_MODE" => Some("check".into()),
      _ => None,
    })
    .unwrap();
    assert_eq!(s.store_dir(), std::path::Path::new("/tmp/envix"));
    assert_eq!(s.sandbox(), SandboxMode::On);
    assert_eq!(s.max_jobs(), 2);
    assert_eq!(s.build_mode(), BuildMode::Check);
    assert_eq!(s.fetch_retries(), 3);
    assert_eq!(s.build_timeout(), None);
  }

  #[test]
  fn test_bad_values_are_rejected() {
    let e = Settings::from_lookup(|var| (var == "ENVIX_SANDBOX").then(|| "maybe".to_string()))
      .err()
      .unwrap();
    assert!(e.contains("ENVIX_SANDBOX"));
  }

  #[test]
  fn test_every_setting_has_a_variable() {
    assert_eq!(Settings::ENV_VARS.len(), 10);
    assert!(Settings::ENV_VARS.iter().all(|v| v.starts_with("ENVIX_")));
  }

  #[test]
  fn test_sandbox_paths() {
    let s = Settings::from_lookup(|var| {
      (var == "ENVIX_SANDBOX_PATHS").then(|| "/bin/sh  /opt/tools? ".to_string())
    })
    .unwrap();
    let paths = s.sandbox_paths().iter().collect::<Vec<_>>();
    assert_eq!(paths.len(), 2);
    assert_eq!(paths[0].path, Path::new("/bin/sh"));
    assert!(!paths[0].optional);
    assert_eq!(paths[1].path, Path::new("/opt/tools"));
    assert!(paths[1].optional);
    assert_eq!(s.sandbox_paths().to_string(), "/bin/sh /opt/tools?");

    assert!("bin/sh".parse::<SandboxPaths>().is_err());
    assert!(Settings::default().sandbox_paths().iter().any(|p| p.path == Path::new("/bin/sh")));
  }

  #[test]
  fn test_fetch_options() {
    let s = Settings::for_store("/tmp/x");
    let o = s.fetch_options();
    assert_eq!(o.retries, 3);
    assert_eq!(o.backoff, Duration::from_millis(1));
    assert!(s.effective_build_cores() >= 1);
  }
}
