//! Merging the contributions of built packages into one environment.

use crate::prelude::*;
use envix_eval::PackageSet;
use serde::Serialize;
use std::{
  collections::BTreeMap,
  path::{Path, PathBuf},
};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentDescriptor {
  /// Output of every selected package in selection order, each once.
  pub search_paths: Vec<PathBuf>,
  pub variables: BTreeMap<String, String>,
  /// Path-like variables (`PATH`, `MANPATH`, …) assembled from the packages'
  /// subdirectories, in selection order, each entry once.
  pub path_variables: BTreeMap<String, Vec<PathBuf>>,
}

impl EnvironmentDescriptor {
  /// The variables a session gets. Path variables are joined with `:`; a
  /// plain variable of the same name is appended after the entries.
  pub fn to_env(&self) -> BTreeMap<String, String> {
    let mut env = self.variables.clone();
    for (name, entries) in &self.path_variables {
      let mut value = entries
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(":");
      if let Some(plain) = self.variables.get(name) {
        value = format!("{}:{}", value, plain);
      }
      env.insert(name.clone(), value);
    }
    env
  }
}

fn push_unique(list: &mut Vec<PathBuf>, path: PathBuf) {
  if !list.contains(&path) {
    list.push(path);
  }
}

fn subdir(root: &Path, sub: &str) -> PathBuf {
  match sub {
    "" | "." => root.to_path_buf(),
    sub => root.join(sub),
  }
}

/// Merges the contributions of `selected`, in order. A variable keeps the
/// value of the first package that sets it, unless a later package is marked
/// as overriding; among overriding packages the last one wins.
///
/// Every selected package must already be built.
pub fn compose(store: &dyn Store, set: &PackageSet, selected: &[String]) -> Result<EnvironmentDescriptor> {
  let mut env = EnvironmentDescriptor::default();

  for attr in selected {
    let drv = set.get(attr)?;
    let obj = store.query_path_info(drv.out_path())?.ok_or_else(|| {
      Error::MissingBuiltOutput {
        attribute: attr.clone(),
        path: store.print_store_path(drv.out_path()),
      }
    })?;
    let root = store.to_real_path(&obj.path);
    let contribution = &drv.contribution;

    push_unique(&mut env.search_paths, root.clone());

    for (var, subdirs) in &contribution.search_paths {
      let entries = env.path_variables.entry(var.clone()).or_default();
      for sub in subdirs {
        push_unique(entries, subdir(&root, sub));
      }
    }

    for (name, value) in &contribution.variables {
      if contribution.overrides || !env.variables.contains_key(name) {
        if let Some(old) = env.variables.insert(name.clone(), value.clone()) {
          debug!("variable overridden"; "name" => name, "by" => attr, "old" => old);
        }
      } else {
        trace!("variable already set"; "name" => name, "ignored" => attr);
      }
    }
  }

  Ok(env)
}
