pub use crate::{
  derivation::{Derivation, DrvId, EnvContribution, FixedOutputHash, Output},
  object::{Producer, StoreObject},
  path::{Hash as StorePathHash, Path as StorePath},
  Store, StorePathSet,
};
pub use envix_util::*;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum FileIngestionMethod {
  Flat,
  Recursive,
}

impl FileIngestionMethod {
  pub fn prefix(&self) -> &'static str {
    match self {
      Self::Flat => "",
      Self::Recursive => "r:",
    }
  }
}
