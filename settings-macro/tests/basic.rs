use envix_settings_macro::Settings;
use std::{collections::HashSet, path::PathBuf};

fn four() -> usize {
  4
}

#[derive(Settings)]
pub struct Settings {
  #[setting(get = "deref", default = "/var/lib/thing", env = "THING_DIR")]
  dir: PathBuf,
  /// very nice thing
  #[setting(get = "ref", default_fn = "HashSet::new")]
  thing: HashSet<String>,
  #[setting(default_fn = "four", env = "THING_JOBS")]
  jobs: usize,
}

#[test]
fn test_defaults_and_getters() {
  let s = Settings::default();
  assert_eq!(s.dir(), std::path::Path::new("/var/lib/thing"));
  assert!(s.thing().is_empty());
  assert_eq!(s.jobs(), 4);
}

#[test]
fn test_env_overrides() {
  let s = Settings::from_lookup(|var| match var {
    "THING_JOBS" => Some("12".into()),
    _ => None,
  })
  .unwrap();
  assert_eq!(s.jobs(), 12);
  assert_eq!(s.dir(), std::path::Path::new("/var/lib/thing"));

  let e = Settings::from_lookup(|var| (var == "THING_JOBS").then(|| "many".to_string()))
    .err()
    .unwrap();
  assert!(e.contains("THING_JOBS"), "{}", e);
}

#[test]
fn test_setters() {
  let mut s = Settings::default();
  s.set_jobs(1).set_dir("/tmp/x".into());
  assert_eq!(s.jobs(), 1);
  assert_eq!(s.dir(), std::path::Path::new("/tmp/x"));
}

#[test]
fn test_env_vars_are_listed() {
  assert_eq!(Settings::ENV_VARS, &["THING_DIR", "THING_JOBS"]);
}
