use thiserror::Error;

/// Coarse grouping of [`Error`]s, used by front ends to pick an exit status.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FailureClass {
  /// Registry, hash syntax, architecture, attribute and cycle errors.
  Resolution,
  Fetch,
  Integrity,
  Build,
  Composition,
  Interrupted,
}

impl FailureClass {
  pub fn exit_code(self) -> u8 {
    match self {
      Self::Resolution => 2,
      Self::Integrity => 3,
      Self::Build => 4,
      Self::Fetch => 5,
      Self::Composition => 6,
      Self::Interrupted => 130,
    }
  }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
  #[error("source `{name}' is not defined in the registry")]
  UnknownSource { name: String },

  #[error("malformed registry entry `{key}': {reason}")]
  MalformedRegistry { key: String, reason: String },

  #[error("invalid content hash `{hash}' for source `{name}': {reason}")]
  HashFormatInvalid {
    name: String,
    hash: String,
    reason: String,
  },

  #[error("transient error while fetching `{name}' at `{revision}': {reason}")]
  TransientFetchError {
    name: String,
    revision: String,
    reason: String,
  },

  #[error("unable to fetch `{name}' at `{revision}' after {attempts} attempt(s): {reason}")]
  FetchFailure {
    name: String,
    revision: String,
    attempts: u32,
    reason: String,
  },

  #[error(
    "hash mismatch for `{name}' at `{revision}';\n  specified: {expected}\n  got:       {actual}"
  )]
  IntegrityViolation {
    name: String,
    revision: String,
    expected: String,
    actual: String,
  },

  #[error("architecture `{architecture}' is not supported{}", by_attribute(.attribute))]
  UnsupportedArchitecture {
    architecture: String,
    attribute: Option<String>,
  },

  #[error("attribute `{attribute}' does not exist in the package set")]
  AttributeNotFound { attribute: String },

  #[error("cyclic dependency: {}", .cycle.join(" -> "))]
  CyclicDependency { cycle: Vec<String> },

  #[error("builder for `{name}' ({derivation}) failed: {status}\nlast log lines:\n{log_excerpt}")]
  BuildFailure {
    derivation: String,
    name: String,
    status: String,
    log_excerpt: String,
  },

  #[error(
    "derivation {derivation} may not be deterministic: output `{path}' differs\n  registered: {expected}\n  rebuilt:    {actual}"
  )]
  NonDeterministicBuild {
    derivation: String,
    path: String,
    expected: String,
    actual: String,
  },

  #[error("attribute `{attribute}' has no built output `{path}' in the store")]
  MissingBuiltOutput { attribute: String, path: String },

  #[error("operation cancelled")]
  Cancelled,
}

fn by_attribute(attribute: &Option<String>) -> String {
  attribute
    .as_ref()
    .map(|a| format!(" by `{}'", a))
    .unwrap_or_default()
}

impl Error {
  pub fn class(&self) -> FailureClass {
    match self {
      Self::UnknownSource { .. }
      | Self::MalformedRegistry { .. }
      | Self::HashFormatInvalid { .. }
      | Self::UnsupportedArchitecture { .. }
      | Self::AttributeNotFound { .. }
      | Self::CyclicDependency { .. } => FailureClass::Resolution,
      Self::TransientFetchError { .. } | Self::FetchFailure { .. } => FailureClass::Fetch,
      Self::IntegrityViolation { .. } => FailureClass::Integrity,
      Self::BuildFailure { .. } | Self::NonDeterministicBuild { .. } => FailureClass::Build,
      Self::MissingBuiltOutput { .. } => FailureClass::Composition,
      Self::Cancelled => FailureClass::Interrupted,
    }
  }

  /// Finds the first typed error in the context chain of `err`.
  pub fn find(err: &anyhow::Error) -> Option<&Error> {
    err.chain().find_map(|e| e.downcast_ref::<Error>())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use anyhow::Context as _;

  #[test]
  fn finds_typed_error_under_context() {
    let err = Err::<(), _>(anyhow::Error::from(Error::AttributeNotFound {
      attribute: "formatter".into(),
    }))
    .context("while composing environment")
    .unwrap_err();

    assert_eq!(
      Error::find(&err),
      Some(&Error::AttributeNotFound {
        attribute: "formatter".into()
      })
    );
    assert_eq!(Error::find(&err).unwrap().class().exit_code(), 2);
  }

  #[test]
  fn untyped_errors_have_no_class() {
    let err = anyhow::anyhow!("disk on fire");
    assert!(Error::find(&err).is_none());
  }

  #[test]
  fn display_includes_context() {
    let e = Error::CyclicDependency {
      cycle: vec!["a".into(), "b".into(), "a".into()],
    };
    assert_eq!(e.to_string(), "cyclic dependency: a -> b -> a");

    let e = Error::UnsupportedArchitecture {
      architecture: "riscv64".into(),
      attribute: Some("compiler".into()),
    };
    assert_eq!(
      e.to_string(),
      "architecture `riscv64' is not supported by `compiler'"
    );
  }
}
