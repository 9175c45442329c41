use crate::{
  prelude::*,
  recipes::{OutputHashMode, Recipe},
};
use std::{
  path::{Component, Path},
  sync::Arc,
  time::Duration,
};

pub const BUILTIN_FILES: &str = "builtin:files";
pub const BUILTIN_FETCHURL: &str = "builtin:fetchurl";

/// Name of the variable an input's output path is passed in.
pub fn input_var(attr: &str) -> String {
  attr
    .chars()
    .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
    .collect()
}

fn check_subpath(attr: &str, sub: &str) -> Result<()> {
  for c in Path::new(sub).components() {
    match c {
      Component::Normal(_) | Component::CurDir => {}
      _ => bail!(
        "`src' of `{}' must be a relative path inside the source tree, not `{}'",
        attr,
        sub
      ),
    }
  }
  Ok(())
}

/// Turns the recipe for `attr` into a sealed derivation. `inputs` holds the
/// already instantiated derivation of every attribute in `recipe.inputs`.
pub(crate) fn instantiate(
  store: &dyn Store,
  source: &StoreObject,
  architecture: &str,
  attr: &str,
  recipe: Recipe,
  inputs: Vec<(String, Arc<Derivation>)>,
) -> Result<Derivation> {
  let mut name = recipe.name.unwrap_or_else(|| attr.to_string());
  if let Some(v) = &recipe.version {
    name = format!("{}-{}", name, v);
  }

  let builder = match recipe.builder {
    Some(b) => b,
    None if !recipe.files.is_empty() => BUILTIN_FILES.to_string(),
    None => bail!("required attribute `builder' missing in `{}'", attr),
  };

  let mut drv = Derivation::new(name.clone(), architecture.to_string(), builder.clone());
  drv.args = recipe.args;
  drv.env = recipe.env;
  drv.env.insert("name".into(), name);
  drv.env.insert("system".into(), architecture.to_string());
  drv.env.insert("builder".into(), builder.clone());
  drv.timeout = recipe.timeout.map(Duration::from_secs);

  for (input, dep) in inputs {
    drv
      .env
      .insert(input_var(&input), store.print_store_path(dep.out_path()));
    drv.input_derivations.insert(dep.out_path().clone(), dep);
  }

  if let Some(sub) = &recipe.src {
    check_subpath(attr, sub)?;
    let root = store.to_real_path(&source.path);
    let src = if sub.is_empty() { root } else { root.join(sub) };
    drv.env.insert("src".into(), src.display().to_string());
    drv.input_sources.insert(source.path.clone());
  }

  if !recipe.files.is_empty() {
    drv
      .env
      .insert("files".into(), serde_json::to_string(&recipe.files)?);
  }

  let fixed = match &recipe.output_hash {
    Some(h) => {
      let hash = Hash::parse(h, None).map_err(|e| Error::HashFormatInvalid {
        name: attr.to_string(),
        hash: h.clone(),
        reason: e.to_string(),
      })?;
      Some(FixedOutputHash {
        method: recipe.output_hash_mode.unwrap_or(OutputHashMode::Flat).into(),
        hash,
      })
    }
    None if builder == BUILTIN_FETCHURL => {
      bail!("`{}' uses `{}' but declares no `outputHash'", attr, BUILTIN_FETCHURL)
    }
    None => None,
  };

  drv
    .seal(store, fixed)
    .with_context(|| format!("while instantiating `{}'", attr))?;

  let out = store.print_store_path(drv.out_path());
  drv.contribution = EnvContribution {
    search_paths: recipe.contribution.search_paths,
    variables: recipe
      .contribution
      .variables
      .into_iter()
      .map(|(k, v)| (k, v.replace("@out@", &out)))
      .collect(),
    overrides: recipe.contribution.overrides,
  };

  trace!("instantiated"; "attribute" => attr, "id" => %drv.id, "path" => &out);
  Ok(drv)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::recipes::Manifest;

  fn recipe(json: &str) -> Recipe {
    let manifest = format!(r#"{{"architectures": ["x86_64"], "packages": {{"p": {}}}}}"#, json);
    Manifest::parse(&manifest)
      .unwrap()
      .recipe("p", "x86_64")
      .unwrap()
      .unwrap()
  }

  fn fake_source(store: &LocalStore) -> StoreObject {
    let h = Hash::hash("source", HashType::SHA256);
    let path = store
      .make_fixed_output_path(FileIngestionMethod::Recursive, h, "source")
      .unwrap();
    StoreObject::new(path, h, 0, Producer::Fetched)
  }

  #[test]
  fn test_input_var() {
    assert_eq!(input_var("compiler"), "compiler");
    assert_eq!(input_var("c++-runtime.2"), "c___runtime_2");
  }

  #[test]
  fn test_names_and_env() {
    let tmp = tempfile::tempdir().unwrap();
    let store = LocalStore::open(tmp.path()).unwrap();
    let source = fake_source(&store);
    let drv = instantiate(
      &store,
      &source,
      "x86_64",
      "p",
      recipe(
        r#"{"version": "1.0", "builder": "/bin/sh", "src": "p",
            "contribution": {"variables": {"P_HOME": "@out@/share"}}}"#,
      ),
      vec![],
    )
    .unwrap();

    assert_eq!(drv.name, "p-1.0");
    assert_eq!(drv.platform, "x86_64");
    assert_eq!(drv.env["system"], "x86_64");
    let out = store.print_store_path(drv.out_path());
    assert_eq!(drv.env["out"], out);
    assert_eq!(drv.contribution.variables["P_HOME"], format!("{}/share", out));
    assert!(drv.env["src"].ends_with("-source/p"));
    assert!(drv.input_sources.contains(&source.path));
  }

  #[test]
  fn test_src_must_stay_inside_source() {
    let tmp = tempfile::tempdir().unwrap();
    let store = LocalStore::open(tmp.path()).unwrap();
    let source = fake_source(&store);
    for sub in ["../etc", "/etc"] {
      let r = recipe(&format!(r#"{{"builder": "/bin/sh", "src": "{}"}}"#, sub));
      assert!(instantiate(&store, &source, "x86_64", "p", r, vec![]).is_err());
    }
  }

  #[test]
  fn test_files_default_to_builtin_builder() {
    let tmp = tempfile::tempdir().unwrap();
    let store = LocalStore::open(tmp.path()).unwrap();
    let drv = instantiate(
      &store,
      &fake_source(&store),
      "x86_64",
      "p",
      recipe(r#"{"files": {"bin/p": {"text": "hi", "executable": true}}}"#),
      vec![],
    )
    .unwrap();
    assert_eq!(drv.builder, BUILTIN_FILES);
    assert_eq!(
      drv.env["files"],
      r#"{"bin/p":{"text":"hi","executable":true}}"#
    );
  }

  #[test]
  fn test_output_hash() {
    let tmp = tempfile::tempdir().unwrap();
    let store = LocalStore::open(tmp.path()).unwrap();
    let source = fake_source(&store);

    let missing = recipe(r#"{"builder": "builtin:fetchurl", "env": {"url": "https://x/y"}}"#);
    assert!(instantiate(&store, &source, "x86_64", "p", missing, vec![]).is_err());

    let bad = recipe(r#"{"builder": "builtin:fetchurl", "outputHash": "sha256:zz"}"#);
    let e = instantiate(&store, &source, "x86_64", "p", bad, vec![]).unwrap_err();
    assert!(matches!(
      Error::find(&e),
      Some(Error::HashFormatInvalid { name, .. }) if name == "p"
    ));

    let h = Hash::hash("payload", HashType::SHA256);
    let good = recipe(&format!(
      r#"{{"builder": "builtin:fetchurl", "outputHash": "{}", "outputHashMode": "recursive"}}"#,
      h.encode(Encoding::SRI)
    ));
    let drv = instantiate(&store, &source, "x86_64", "p", good, vec![]).unwrap();
    assert_eq!(
      drv.output.as_fixed(),
      Some(&FixedOutputHash {
        method: FileIngestionMethod::Recursive,
        hash: h
      })
    );
  }
}
