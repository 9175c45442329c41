#[macro_use] extern crate slog_scope;

use parking_lot::Mutex;
use prelude::*;
use recipes::Manifest;
use std::{
  collections::{BTreeMap, BTreeSet},
  sync::Arc,
};

pub mod derivation;
pub mod fetch;
mod recipes;
pub mod registry;

pub use fetch::{FetchOptions, Fetcher};
pub use recipes::FileSpec;
pub use registry::{PinEntry, Registry};

mod prelude {
  pub use envix_store::{
    Derivation, DrvId, EnvContribution, FileIngestionMethod, FixedOutputHash, LocalStore,
    Producer, Store, StoreObject, StorePath, StorePathSet,
  };
  pub use envix_util::*;
}

/// File at the root of a source tree listing its packages.
pub const MANIFEST: &str = "packages.json";

enum Slot {
  Computing,
  Done(Arc<Derivation>),
}

/// The packages of one source tree, evaluated for one architecture.
///
/// Nothing is instantiated up front: [`PackageSet::get`] instantiates an
/// attribute and its inputs the first time it is asked for, and remembers
/// the result.
pub struct PackageSet {
  store: Arc<dyn Store>,
  source: StoreObject,
  architecture: String,
  manifest: Manifest,
  memo: Mutex<BTreeMap<String, Slot>>,
}

/// Reads the package manifest of `source`. Fails if the tree does not
/// declare support for `architecture`.
pub fn evaluate(store: Arc<dyn Store>, source: &StoreObject, architecture: &str) -> Result<PackageSet> {
  let path = store.to_real_path(&source.path).join(MANIFEST);
  let text = std::fs::read_to_string(&path)
    .with_context(|| format!("while reading `{}'", path.display()))?;
  let manifest =
    Manifest::parse(&text).with_context(|| format!("while parsing `{}'", path.display()))?;

  if !manifest.architectures.iter().any(|a| a == architecture) {
    return Err(
      Error::UnsupportedArchitecture {
        architecture: architecture.to_string(),
        attribute: None,
      }
      .into(),
    );
  }

  debug!("evaluating package set";
    "source" => %source.path, "architecture" => architecture,
    "packages" => manifest.packages.len());

  Ok(PackageSet {
    store,
    source: source.clone(),
    architecture: architecture.to_string(),
    manifest,
    memo: Default::default(),
  })
}

impl PackageSet {
  pub fn architecture(&self) -> &str {
    &self.architecture
  }

  pub fn source(&self) -> &StoreObject {
    &self.source
  }

  /// Every attribute the source tree declares.
  pub fn attributes(&self) -> impl Iterator<Item = &str> {
    self.manifest.packages.keys().map(String::as_str)
  }

  /// Attributes instantiated so far.
  pub fn forced(&self) -> BTreeSet<String> {
    self
      .memo
      .lock()
      .iter()
      .filter(|(_, slot)| matches!(slot, Slot::Done(_)))
      .map(|(k, _)| k.clone())
      .collect()
  }

  pub fn get(&self, attr: &str) -> Result<Arc<Derivation>> {
    let mut memo = self.memo.lock();
    self.force(&mut memo, attr, &mut vec![])
  }

  fn force(
    &self,
    memo: &mut BTreeMap<String, Slot>,
    attr: &str,
    stack: &mut Vec<String>,
  ) -> Result<Arc<Derivation>> {
    match memo.get(attr) {
      Some(Slot::Done(drv)) => return Ok(drv.clone()),
      Some(Slot::Computing) => {
        let start = stack.iter().position(|a| a == attr).unwrap_or(0);
        let mut cycle = stack[start..].to_vec();
        cycle.push(attr.to_string());
        return Err(Error::CyclicDependency { cycle }.into());
      }
      None => {}
    }

    memo.insert(attr.to_string(), Slot::Computing);
    stack.push(attr.to_string());
    let result = self.instantiate(memo, attr, stack);
    stack.pop();

    match result {
      Ok(drv) => {
        let drv = Arc::new(drv);
        memo.insert(attr.to_string(), Slot::Done(drv.clone()));
        Ok(drv)
      }
      Err(e) => {
        memo.remove(attr);
        Err(e)
      }
    }
  }

  fn instantiate(
    &self,
    memo: &mut BTreeMap<String, Slot>,
    attr: &str,
    stack: &mut Vec<String>,
  ) -> Result<Derivation> {
    let recipe = self
      .manifest
      .recipe(attr, &self.architecture)?
      .ok_or_else(|| Error::AttributeNotFound {
        attribute: attr.to_string(),
      })?;

    if let Some(platforms) = &recipe.platforms {
      if !platforms.iter().any(|p| p == &self.architecture) {
        return Err(
          Error::UnsupportedArchitecture {
            architecture: self.architecture.clone(),
            attribute: Some(attr.to_string()),
          }
          .into(),
        );
      }
    }

    let mut inputs = Vec::with_capacity(recipe.inputs.len());
    for input in &recipe.inputs {
      inputs.push((input.clone(), self.force(memo, input, stack)?));
    }

    derivation::instantiate(
      &*self.store,
      &self.source,
      &self.architecture,
      attr,
      recipe,
      inputs,
    )
  }
}

#[cfg(test)]
pub(crate) mod tests {
  use super::*;
  use maplit::btreeset;

  /// Adds a source tree holding `manifest` to `store`.
  pub(crate) fn source_with(store: &dyn Store, manifest: &str) -> StoreObject {
    let tree = tempfile::tempdir().unwrap();
    std::fs::write(tree.path().join(MANIFEST), manifest).unwrap();
    let mut nar = vec![];
    nar::dump_path(tree.path(), &mut nar).unwrap();
    let hash = Hash::hash(&nar, HashType::SHA256);
    let path = store
      .make_fixed_output_path(FileIngestionMethod::Recursive, hash, "source")
      .unwrap();
    let info = StoreObject::new(path, hash, nar.len() as u64, Producer::Fetched);
    store.add_to_store(info, &mut &nar[..]).unwrap()
  }

  const TOOLCHAIN: &str = r##"{
    "architectures": ["x86_64", "aarch64"],
    "packages": {
      "libc": {"version": "2.0", "files": {"lib/libc.so": {"text": "libc"}}},
      "compiler": {
        "version": "1.0",
        "files": {"bin/cc": {"text": "#!/bin/sh\n", "executable": true}},
        "inputs": ["libc"],
        "contribution": {"searchPaths": {"PATH": ["bin"]}}
      },
      "linker": {
        "version": "1.0",
        "files": {"bin/ld": {"text": "#!/bin/sh\n", "executable": true}},
        "platforms": ["x86_64"]
      },
      "formatter": {"version": "1.0", "files": {"bin/fmt": {"text": "x"}}},
      "a": {"builder": "/bin/sh", "inputs": ["b"]},
      "b": {"builder": "/bin/sh", "inputs": ["c"]},
      "c": {"builder": "/bin/sh", "inputs": ["a"]},
      "uses-cycle": {"builder": "/bin/sh", "inputs": ["a"]},
      "dangling": {"builder": "/bin/sh", "inputs": ["nope"]}
    }
  }"##;

  fn setup(arch: &str) -> (tempfile::TempDir, PackageSet) {
    let tmp = tempfile::tempdir().unwrap();
    let store: Arc<dyn Store> = Arc::new(LocalStore::open(tmp.path()).unwrap());
    let source = source_with(&*store, TOOLCHAIN);
    let set = evaluate(store, &source, arch).unwrap();
    (tmp, set)
  }

  #[test]
  fn test_evaluation_is_lazy() {
    let (_tmp, set) = setup("x86_64");
    assert!(set.forced().is_empty());
    assert_eq!(set.attributes().count(), 9);

    let compiler = set.get("compiler").unwrap();
    assert_eq!(compiler.name, "compiler-1.0");
    assert_eq!(set.forced(), btreeset! {"compiler".to_string(), "libc".to_string()});

    let libc = set.get("libc").unwrap();
    assert!(compiler.input_derivations.contains_key(libc.out_path()));
    assert!(Arc::ptr_eq(&compiler, &set.get("compiler").unwrap()));
  }

  #[test]
  fn test_unknown_architecture() {
    let tmp = tempfile::tempdir().unwrap();
    let store: Arc<dyn Store> = Arc::new(LocalStore::open(tmp.path()).unwrap());
    let source = source_with(&*store, TOOLCHAIN);
    let e = evaluate(store, &source, "riscv64").err().unwrap();
    assert_eq!(
      Error::find(&e),
      Some(&Error::UnsupportedArchitecture {
        architecture: "riscv64".into(),
        attribute: None
      })
    );
  }

  #[test]
  fn test_package_excluding_architecture() {
    let (_tmp, set) = setup("aarch64");
    set.get("compiler").unwrap();
    let e = set.get("linker").unwrap_err();
    assert_eq!(
      Error::find(&e),
      Some(&Error::UnsupportedArchitecture {
        architecture: "aarch64".into(),
        attribute: Some("linker".into())
      })
    );
  }

  #[test]
  fn test_unknown_attribute() {
    let (_tmp, set) = setup("x86_64");
    for (attr, missing) in [("nope", "nope"), ("dangling", "nope")] {
      let e = set.get(attr).unwrap_err();
      assert_eq!(
        Error::find(&e),
        Some(&Error::AttributeNotFound {
          attribute: missing.into()
        })
      );
    }
    assert!(set.forced().is_empty());
  }

  #[test]
  fn test_cycles_are_reported() {
    let (_tmp, set) = setup("x86_64");
    let e = set.get("uses-cycle").unwrap_err();
    assert_eq!(
      Error::find(&e),
      Some(&Error::CyclicDependency {
        cycle: vec!["a".into(), "b".into(), "c".into(), "a".into()]
      })
    );
    // nothing half-computed is left behind
    assert!(set.forced().is_empty());
    assert!(set.get("b").is_err());
    assert!(set.get("compiler").is_ok());
  }

  #[test]
  fn test_evaluation_is_deterministic() {
    let (_tmp1, one) = setup("x86_64");
    let (_tmp2, two) = setup("x86_64");
    let a = one.get("compiler").unwrap();
    let b = two.get("compiler").unwrap();
    // different store roots give different paths, but each is stable
    assert_eq!(a.id, one.get("compiler").unwrap().id);
    assert_eq!(a.name, b.name);

    let (_tmp3, arm) = setup("aarch64");
    assert_ne!(arm.get("compiler").unwrap().id, a.id);
  }

  #[test]
  fn test_same_store_same_ids() {
    let tmp = tempfile::tempdir().unwrap();
    let store: Arc<dyn Store> = Arc::new(LocalStore::open(tmp.path()).unwrap());
    let source = source_with(&*store, TOOLCHAIN);
    let one = evaluate(store.clone(), &source, "x86_64").unwrap();
    let two = evaluate(store, &source, "x86_64").unwrap();
    for attr in ["libc", "compiler", "linker", "formatter"] {
      assert_eq!(one.get(attr).unwrap().id, two.get(attr).unwrap().id);
    }
  }
}
