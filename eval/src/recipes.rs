//! The package manifest (`packages.json`) at the root of a source tree.
//!
//! Recipes are kept as raw JSON until somebody asks for them, so a broken
//! recipe only fails the evaluations that need it.

use crate::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
pub(crate) struct Manifest {
  pub architectures: Vec<String>,
  #[serde(default)]
  pub packages: BTreeMap<String, Value>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub(crate) struct Recipe {
  pub name: Option<String>,
  pub version: Option<String>,
  pub builder: Option<String>,
  #[serde(default)]
  pub args: Vec<String>,
  #[serde(default)]
  pub env: BTreeMap<String, String>,
  #[serde(default)]
  pub inputs: Vec<String>,
  /// Subdirectory of the source tree handed to the builder as `$src`.
  pub src: Option<String>,
  #[serde(default)]
  pub files: BTreeMap<String, FileSpec>,
  pub output_hash: Option<String>,
  pub output_hash_mode: Option<OutputHashMode>,
  pub platforms: Option<Vec<String>>,
  /// Seconds.
  pub timeout: Option<u64>,
  #[serde(default)]
  pub contribution: ContributionSpec,
  #[serde(default)]
  pub variants: BTreeMap<String, Value>,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct FileSpec {
  pub text: String,
  #[serde(default)]
  pub executable: bool,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub(crate) enum OutputHashMode {
  Flat,
  Recursive,
}

impl From<OutputHashMode> for FileIngestionMethod {
  fn from(m: OutputHashMode) -> Self {
    match m {
      OutputHashMode::Flat => Self::Flat,
      OutputHashMode::Recursive => Self::Recursive,
    }
  }
}

#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub(crate) struct ContributionSpec {
  #[serde(default)]
  pub search_paths: BTreeMap<String, Vec<String>>,
  #[serde(default)]
  pub variables: BTreeMap<String, String>,
  #[serde(default, rename = "override")]
  pub overrides: bool,
}

impl Manifest {
  pub fn parse(text: &str) -> Result<Self> {
    Ok(serde_json::from_str(text)?)
  }

  /// The recipe for `attr` with the variant for `architecture` laid over it.
  pub fn recipe(&self, attr: &str, architecture: &str) -> Result<Option<Recipe>> {
    let raw = match self.packages.get(attr) {
      Some(v) => v,
      None => return Ok(None),
    };
    let mut base = raw
      .as_object()
      .cloned()
      .ok_or_else(|| anyhow!("recipe `{}' is not an object", attr))?;

    if let Some(Value::Object(variants)) = base.remove("variants") {
      if let Some(variant) = variants.get(architecture) {
        let variant = variant
          .as_object()
          .ok_or_else(|| anyhow!("variant `{}' of `{}' is not an object", architecture, attr))?;
        overlay(&mut base, variant);
      }
    }

    let recipe = serde_json::from_value(Value::Object(base))
      .with_context(|| format!("while reading the recipe for `{}'", attr))?;
    Ok(Some(recipe))
  }
}

/// Merges `patch` into `base`; nested objects merge key by key, anything else
/// is replaced.
fn overlay(base: &mut Map<String, Value>, patch: &Map<String, Value>) {
  for (key, value) in patch {
    match (base.get_mut(key), value) {
      (Some(Value::Object(b)), Value::Object(p)) => overlay(b, p),
      _ => {
        base.insert(key.clone(), value.clone());
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const MANIFEST: &str = r##"{
    "architectures": ["x86_64", "aarch64"],
    "packages": {
      "compiler": {
        "version": "1.0",
        "builder": "builtin:files",
        "env": {"FLAVOR": "generic", "KEEP": "yes"},
        "files": {"bin/cc": {"text": "#!/bin/sh\n", "executable": true}},
        "contribution": {"searchPaths": {"PATH": ["bin"]}},
        "variants": {
          "aarch64": {"env": {"FLAVOR": "arm"}, "args": ["--arm"]}
        }
      },
      "broken": {"builder": 3}
    }
  }"##;

  #[test]
  fn test_variant_overlay() {
    let m = Manifest::parse(MANIFEST).unwrap();
    let base = m.recipe("compiler", "x86_64").unwrap().unwrap();
    assert_eq!(base.env["FLAVOR"], "generic");
    assert!(base.args.is_empty());
    assert_eq!(base.contribution.search_paths["PATH"], vec!["bin"]);
    assert!(base.files["bin/cc"].executable);

    let arm = m.recipe("compiler", "aarch64").unwrap().unwrap();
    assert_eq!(arm.env["FLAVOR"], "arm");
    assert_eq!(arm.env["KEEP"], "yes");
    assert_eq!(arm.args, vec!["--arm"]);
  }

  #[test]
  fn test_broken_recipes_fail_only_when_read() {
    let m = Manifest::parse(MANIFEST).unwrap();
    assert!(m.recipe("broken", "x86_64").is_err());
    assert!(m.recipe("compiler", "x86_64").is_ok());
    assert!(m.recipe("missing", "x86_64").unwrap().is_none());
  }

  #[test]
  fn test_rejects_unknown_fields() {
    assert!(Manifest::parse(r#"{"architectures": [], "extra": 1}"#).is_err());
    let m = Manifest::parse(r#"{"architectures": [], "packages": {"a": {"bulider": "x"}}}"#).unwrap();
    assert!(m.recipe("a", "x86_64").is_err());
  }
}
