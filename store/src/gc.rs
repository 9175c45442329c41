//! Deletion of objects no root can reach.

use crate::prelude::*;

/// Deletes every valid path outside the closure of the store's roots and
/// returns what was deleted. References are followed through the index, so
/// anything a live object refers to survives with it.
pub fn collect_garbage<S: Store + ?Sized>(store: &S) -> Result<Vec<StorePath>> {
  let mut alive = StorePathSet::new();
  for root in store.roots()? {
    if store.is_valid_path(&root)? {
      store.compute_fs_closure(&root, &mut alive)?;
    } else {
      warn!("gc root refers to an invalid path"; "path" => %root);
    }
  }

  let mut deleted = vec![];
  for path in store.valid_paths()? {
    if alive.contains(&path) {
      continue;
    }
    debug!("deleting unreachable path"; "path" => %path);
    store.delete_path(&path)?;
    deleted.push(path);
  }

  info!("garbage collection finished"; "alive" => alive.len(), "deleted" => deleted.len());
  Ok(deleted)
}
