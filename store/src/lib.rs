#[macro_use] extern crate derivative;
#[macro_use] extern crate derive_more;
#[macro_use] extern crate lazy_static;
#[macro_use] extern crate slog_scope;

use prelude::*;
use std::{
  collections::BTreeSet,
  io::Read,
  path::{Path, PathBuf},
};

pub mod derivation;
pub mod gc;
pub mod local;
mod lock;
mod object;
pub mod path;
mod prelude;

pub use derivation::{Derivation, DrvId, EnvContribution, FixedOutputHash, Output};
pub use local::LocalStore;
pub use lock::PathLock;
pub use object::{Producer, StoreObject};
pub use prelude::{FileIngestionMethod, StorePath};

pub type StorePathSet = BTreeSet<StorePath>;

/// An append-only, content-addressed object store.
///
/// Every object lives at a path that is a function of its content (fetched
/// sources, fixed outputs) or of the derivation that produces it. Objects
/// are never modified once registered; they disappear only through garbage
/// collection.
pub trait Store: Send + Sync {
  fn store_path(&self) -> &Path;

  fn parse_store_path(&self, path: &Path) -> Result<StorePath> {
    if path.parent() != Some(self.store_path()) {
      bail!(
        "path `{}' is not a direct descendant of the store",
        path.display()
      );
    }

    StorePath::from_base_name(
      path
        .file_name()
        .and_then(|x| x.to_str())
        .ok_or_else(|| anyhow!("invalid filepath `{}'", path.display()))?,
    )
  }

  fn print_store_path(&self, path: &StorePath) -> String {
    self.to_real_path(path).display().to_string()
  }

  fn to_real_path(&self, path: &StorePath) -> PathBuf {
    self.store_path().join(path.to_string())
  }

  fn is_in_store(&self, path: &Path) -> bool {
    path.starts_with(self.store_path())
  }

  fn make_store_path(&self, path_type: &str, hash: Hash, name: &str) -> Result<StorePath> {
    let ident = format!(
      "{}:{}:{}:{}",
      path_type,
      hash.encode_with_type(Encoding::Base16),
      self.store_path().display(),
      name
    );
    let hash = Hash::hash(&ident, HashType::SHA256).truncate(20);
    StorePath::from_parts(hash.as_bytes(), name)
  }

  fn make_output_path(&self, id: &str, hash: Hash, name: &str) -> Result<StorePath> {
    if id == "out" {
      self.make_store_path(&format!("output:{}", id), hash, name)
    } else {
      self.make_store_path(&format!("output:{}", id), hash, &format!("{}-{}", name, id))
    }
  }

  fn make_fixed_output_path(
    &self,
    method: FileIngestionMethod,
    hash: Hash,
    name: &str,
  ) -> Result<StorePath> {
    if hash.ty() == HashType::SHA256 && method == FileIngestionMethod::Recursive {
      self.make_store_path("source", hash, name)
    } else {
      self.make_store_path(
        "output:out",
        Hash::hash(
          format!(
            "fixed:out:{prefix}{algo}:{hash}:",
            prefix = method.prefix(),
            algo = hash.ty(),
            hash = hash.encode(Encoding::Base16)
          ),
          HashType::SHA256,
        ),
        name,
      )
    }
  }

  fn query_path_info(&self, path: &StorePath) -> Result<Option<StoreObject>>;

  fn is_valid_path(&self, path: &StorePath) -> Result<bool> {
    Ok(self.query_path_info(path)?.is_some())
  }

  fn valid_paths(&self) -> Result<StorePathSet>;

  /// Takes the lock that serializes producing `path`.
  fn lock_path(&self, path: &StorePath) -> Result<PathLock>;

  /// Unpacks the archive read from `source` at `info.path` and registers it,
  /// checking the archive against `info.nar_hash`. Returns the registered
  /// object, which is the existing one if the path was already valid.
  fn add_to_store(&self, info: StoreObject, source: &mut dyn Read) -> Result<StoreObject>;

  /// Registers an object whose contents are already in place. Registering a
  /// path that is already valid leaves the existing registration alone.
  fn register_valid_path(&self, info: StoreObject) -> Result<StoreObject>;

  /// Unregisters `path` and deletes its contents.
  fn delete_path(&self, path: &StorePath) -> Result<()>;

  /// A scratch directory on the same filesystem as the store.
  fn temp_dir(&self) -> Result<tempfile::TempDir>;

  fn build_log_path(&self, path: &StorePath) -> PathBuf;

  fn add_root(&self, name: &str, paths: &StorePathSet) -> Result<()>;

  fn remove_root(&self, name: &str) -> Result<()>;

  fn roots(&self) -> Result<StorePathSet>;

  fn compute_fs_closure(&self, path: &StorePath, closure: &mut StorePathSet) -> Result<()> {
    let mut todo = vec![path.clone()];
    while let Some(p) = todo.pop() {
      if !closure.insert(p.clone()) {
        continue;
      }
      let info = self
        .query_path_info(&p)?
        .ok_or_else(|| anyhow!("path `{}' is not valid", self.print_store_path(&p)))?;
      todo.extend(info.refs.into_iter().filter(|r| !closure.contains(r)));
    }
    Ok(())
  }
}
