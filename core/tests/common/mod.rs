#![allow(dead_code)]

use envix_core::{Engine, Request, Settings};
use envix_util::{nar, Encoding, Hash, HashType};
use serde_json::{json, Value};
use std::{
  fs,
  path::{Path, PathBuf},
};
use tempfile::TempDir;

pub const HOST: &str = std::env::consts::ARCH;

/// A source tree pinned in a registry file, and a store to build it into,
/// all under one temporary directory.
pub struct Fixture {
  pub tmp: TempDir,
  pub registry: PathBuf,
}

impl Fixture {
  /// Pins `packages` as the `toolchain` source at `rev1`, served straight
  /// from the working tree through a `file://` locator.
  pub fn new(packages: Value) -> Self {
    let tmp = tempfile::tempdir().unwrap();
    let tree = tmp.path().join("toolchain").join("rev1");
    fs::create_dir_all(&tree).unwrap();
    write_manifest(&tree, packages);

    let locator = format!("file://{}/{{rev}}", tmp.path().join("toolchain").display());
    let registry = write_registry(tmp.path(), &locator, &nar_hash(&tree));
    Self { tmp, registry }
  }

  pub fn store_dir(&self) -> PathBuf {
    self.tmp.path().join("store")
  }

  pub fn engine(&self) -> Engine {
    Engine::open(Settings::for_store(self.store_dir())).unwrap()
  }

  pub fn request(&self, architecture: &str, packages: &[&str]) -> Request {
    Request {
      registry: self.registry.clone(),
      source: "toolchain".into(),
      architecture: Some(architecture.into()),
      packages: packages.iter().map(|p| p.to_string()).collect(),
      gc_root: None,
    }
  }
}

pub fn write_manifest(tree: &Path, packages: Value) {
  let manifest = json!({
    "architectures": ["x86_64", "aarch64", HOST],
    "packages": packages,
  });
  fs::write(
    tree.join("packages.json"),
    serde_json::to_string_pretty(&manifest).unwrap(),
  )
  .unwrap();
}

pub fn nar_of(path: &Path) -> Vec<u8> {
  let mut nar = vec![];
  nar::dump_path(path, &mut nar).unwrap();
  nar
}

pub fn nar_hash(path: &Path) -> String {
  Hash::hash(&nar_of(path), HashType::SHA256).encode(Encoding::SRI)
}

pub fn write_registry(dir: &Path, locator: &str, hash: &str) -> PathBuf {
  let registry = json!({
    "version": 1,
    "sources": {
      "toolchain": {"locator": locator, "revision": "rev1", "hash": hash},
    },
  });
  let path = dir.join("registry.json");
  fs::write(&path, registry.to_string()).unwrap();
  path
}

/// A package whose output is a directory of literal files.
pub fn files(files: Value) -> Value {
  json!({"version": "1.0", "files": files})
}

/// A package built by running `script` with the host's `/bin/sh`.
pub fn sh(script: &str, inputs: &[&str]) -> Value {
  json!({
    "builder": "/bin/sh",
    "args": ["-c", script],
    "inputs": inputs,
    "platforms": [HOST],
  })
}
