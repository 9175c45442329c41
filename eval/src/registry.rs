//! Named, pinned external sources.
//!
//! ```json
//! {
//!   "version": 1,
//!   "sources": {
//!     "toolchain": {
//!       "locator": "https://example.org/toolchain/{rev}.nar",
//!       "revision": "rev1",
//!       "hash": "sha256-ungWv48Bz+pBQUDeXa4iI7ADYaOWF3qctBD/YfIAFa0=",
//!       "algo": "sha256"
//!     }
//!   }
//! }
//! ```

use crate::prelude::*;
use serde::Deserialize;
use serde_json::Value;
use std::{collections::BTreeMap, path::Path};
use url::Url;

const VERSION: u64 = 1;
const ROOT_KEY: &str = "<root>";

/// An immutable reference to one revision of an external source and the hash
/// its archive must have.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinEntry {
  pub name: String,
  pub locator: Url,
  pub revision: String,
  pub content_hash: Hash,
}

impl PinEntry {
  /// The locator with `{rev}` replaced by the pinned revision.
  pub fn resolved_locator(&self) -> Result<Url> {
    let raw = self.locator.as_str().replace("%7Brev%7D", "{rev}");
    let resolved = raw.replace("{rev}", &self.revision);
    Url::parse(&resolved).map_err(|e| {
      Error::MalformedRegistry {
        key: self.name.clone(),
        reason: format!("locator `{}' is not a valid URL: {}", resolved, e),
      }
      .into()
    })
  }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPin {
  locator: String,
  revision: String,
  hash: String,
  #[serde(default)]
  algo: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Registry {
  sources: BTreeMap<String, PinEntry>,
}

fn malformed(key: &str, reason: impl ToString) -> anyhow::Error {
  Error::MalformedRegistry {
    key: key.to_string(),
    reason: reason.to_string(),
  }
  .into()
}

impl Registry {
  pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
      .with_context(|| format!("while reading registry `{}'", path.display()))?;
    Self::parse(&text).with_context(|| format!("while loading registry `{}'", path.display()))
  }

  pub fn parse(text: &str) -> Result<Self> {
    let doc: Value = serde_json::from_str(text).map_err(|e| malformed(ROOT_KEY, e))?;
    let root = doc
      .as_object()
      .ok_or_else(|| malformed(ROOT_KEY, "expected an object"))?;

    for key in root.keys() {
      if key != "version" && key != "sources" {
        return Err(malformed(key, "unknown field"));
      }
    }

    match root.get("version").and_then(Value::as_u64) {
      Some(VERSION) => {}
      Some(v) => return Err(malformed("version", format!("unsupported version {}", v))),
      None => return Err(malformed("version", "expected a version number")),
    }

    let sources = root
      .get("sources")
      .ok_or_else(|| malformed("sources", "missing"))?
      .as_object()
      .ok_or_else(|| malformed("sources", "expected an object"))?;

    let mut registry = Self::default();
    for (name, value) in sources {
      let pin = parse_pin(name, value.clone())?;
      trace!("loaded pin"; "name" => name, "revision" => &pin.revision);
      registry.sources.insert(name.clone(), pin);
    }
    Ok(registry)
  }

  pub fn resolve(&self, name: &str) -> Result<&PinEntry> {
    self.sources.get(name).ok_or_else(|| {
      Error::UnknownSource {
        name: name.to_string(),
      }
      .into()
    })
  }

  pub fn names(&self) -> impl Iterator<Item = &str> {
    self.sources.keys().map(String::as_str)
  }
}

fn parse_pin(name: &str, value: Value) -> Result<PinEntry> {
  if name.is_empty() {
    return Err(malformed(name, "source names cannot be empty"));
  }
  let raw: RawPin = serde_json::from_value(value).map_err(|e| malformed(name, e))?;
  if raw.revision.is_empty() {
    return Err(malformed(name, "empty revision"));
  }
  let locator = Url::parse(&raw.locator)
    .map_err(|e| malformed(name, format!("locator `{}' is not a URL: {}", raw.locator, e)))?;

  let bad_hash = |reason: String| -> anyhow::Error {
    Error::HashFormatInvalid {
      name: name.to_string(),
      hash: raw.hash.clone(),
      reason,
    }
    .into()
  };

  let algo = raw
    .algo
    .as_deref()
    .map(str::parse::<HashType>)
    .transpose()
    .map_err(|e| bad_hash(e.to_string()))?;
  let content_hash = Hash::parse(&raw.hash, algo).map_err(|e| bad_hash(e.to_string()))?;

  Ok(PinEntry {
    name: name.to_string(),
    locator,
    revision: raw.revision,
    content_hash,
  })
}
