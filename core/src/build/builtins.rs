//! Builders that run inside the envix process instead of as a child.

use crate::prelude::*;
use envix_eval::{fetch::download, FileSpec};
use std::{
  collections::BTreeMap,
  fs,
  io::{self, Write},
  os::unix::fs::PermissionsExt,
  path::{Component, Path},
  time::Duration,
};
use url::Url;

pub const FILES: &str = envix_eval::derivation::BUILTIN_FILES;
pub const FETCHURL: &str = envix_eval::derivation::BUILTIN_FETCHURL;

pub fn is_builtin(builder: &str) -> bool {
  builder.starts_with("builtin:")
}

/// Runs builtin `drv.builder`, producing `out`. Progress goes to `log`.
pub(super) fn run(drv: &Derivation, out: &Path, log: &mut dyn Write, timeout: Duration) -> Result<()> {
  match drv.builder.as_str() {
    FILES => files(drv, out, log),
    FETCHURL => fetchurl(drv, out, log, timeout),
    b => bail!("unsupported builtin builder `{}'", b),
  }
}

fn var<'a>(drv: &'a Derivation, name: &str) -> Result<&'a str> {
  drv
    .env
    .get(name)
    .map(String::as_str)
    .ok_or_else(|| anyhow!("`{}' requires the `{}' attribute", drv.builder, name))
}

fn files(drv: &Derivation, out: &Path, log: &mut dyn Write) -> Result<()> {
  let files: BTreeMap<String, FileSpec> = serde_json::from_str(var(drv, "files")?)?;
  fs::create_dir_all(out)?;
  for (rel, spec) in files {
    let rel_path = Path::new(&rel);
    ensure!(
      rel_path.components().all(|c| matches!(c, Component::Normal(_))),
      "file name `{}' must be a relative path without `..'",
      rel
    );
    let dest = out.join(rel_path);
    if let Some(parent) = dest.parent() {
      fs::create_dir_all(parent)?;
    }
    fs::write(&dest, &spec.text)?;
    let mode = if spec.executable { 0o755 } else { 0o644 };
    fs::set_permissions(&dest, fs::Permissions::from_mode(mode))?;
    writeln!(log, "wrote {}", rel)?;
  }
  Ok(())
}

fn fetchurl(drv: &Derivation, out: &Path, log: &mut dyn Write, timeout: Duration) -> Result<()> {
  let url = Url::parse(var(drv, "url")?)?;
  let fixed = drv
    .output
    .as_fixed()
    .ok_or_else(|| anyhow!("`{}' is only allowed in fixed-output derivations", FETCHURL))?;

  writeln!(log, "downloading `{}'", url)?;
  let mut file = download(&url, timeout).map_err(|e| anyhow!("unable to download `{}': {}", url, e))?;

  match fixed.method {
    FileIngestionMethod::Flat => {
      let mut dest = fs::File::create(out)?;
      io::copy(&mut file, &mut dest)?;
      if drv.env.get("executable").map_or(false, |x| x == "1") {
        fs::set_permissions(out, fs::Permissions::from_mode(0o755))?;
      }
    }
    // a recursive hash covers a whole tree, which travels as an archive
    FileIngestionMethod::Recursive => nar::restore_path(out, io::BufReader::new(file))?,
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  fn drv_with(builder: &str, env: &[(&str, &str)]) -> Derivation {
    let mut drv = Derivation::new("t".into(), "x86_64".into(), builder.into());
    for (k, v) in env {
      drv.env.insert(k.to_string(), v.to_string());
    }
    drv
  }

  #[test]
  fn test_files() {
    let tmp = tempfile::tempdir().unwrap();
    let out = tmp.path().join("out");
    let drv = drv_with(
      FILES,
      &[(
        "files",
        r##"{"bin/tool": {"text": "#!/bin/sh\n", "executable": true}, "share/doc": {"text": "hi"}}"##,
      )],
    );
    let mut log = vec![];
    run(&drv, &out, &mut log, Duration::from_secs(1)).unwrap();
    assert_eq!(fs::read_to_string(out.join("share/doc")).unwrap(), "hi");
    let mode = fs::metadata(out.join("bin/tool")).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o755);
    assert_eq!(String::from_utf8(log).unwrap(), "wrote bin/tool\nwrote share/doc\n");
  }

  #[test]
  fn test_files_rejects_escapes() {
    let tmp = tempfile::tempdir().unwrap();
    let drv = drv_with(FILES, &[("files", r#"{"../evil": {"text": "x"}}"#)]);
    assert!(run(&drv, &tmp.path().join("out"), &mut io::sink(), Duration::from_secs(1)).is_err());
  }

  #[test]
  fn test_fetchurl_needs_fixed_output() {
    let tmp = tempfile::tempdir().unwrap();
    let drv = drv_with(FETCHURL, &[("url", "file:///etc/hostname")]);
    assert!(run(&drv, &tmp.path().join("out"), &mut io::sink(), Duration::from_secs(1)).is_err());
  }

  #[test]
  fn test_unknown_builtin() {
    let tmp = tempfile::tempdir().unwrap();
    let drv = drv_with("builtin:nope", &[]);
    assert!(run(&drv, &tmp.path().join("out"), &mut io::sink(), Duration::from_secs(1)).is_err());
  }
}
