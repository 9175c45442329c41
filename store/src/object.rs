use crate::prelude::*;
use std::time::SystemTime;

/// What put an object into the store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Producer {
  Fetched,
  Derivation(DrvId),
}

#[derive(Derivative, Clone)]
#[derivative(Debug)]
pub struct StoreObject {
  pub path: StorePath,
  pub nar_hash: Hash,
  pub nar_size: u64,
  pub producer: Producer,
  pub refs: StorePathSet,
  pub registration_time: Option<SystemTime>,
  // for sqlite
  #[derivative(Debug = "ignore")]
  pub(crate) id: i64,
}

impl StoreObject {
  pub fn new(path: StorePath, nar_hash: Hash, nar_size: u64, producer: Producer) -> Self {
    Self {
      path,
      nar_hash,
      nar_size,
      producer,
      refs: Default::default(),
      registration_time: None,
      id: 0,
    }
  }

  pub fn with_refs(mut self, refs: StorePathSet) -> Self {
    self.refs = refs;
    self
  }

  pub(crate) fn registration_time_sql(&self) -> i64 {
    self
      .registration_time
      .unwrap_or_else(SystemTime::now)
      .duration_since(SystemTime::UNIX_EPOCH)
      .map_or(0, |d| d.as_secs() as i64)
  }
}

impl PartialEq for StoreObject {
  fn eq(&self, other: &Self) -> bool {
    self.path == other.path && self.nar_hash == other.nar_hash && self.refs == other.refs
  }
}

impl Eq for StoreObject {}

impl std::hash::Hash for StoreObject {
  fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
    self.nar_hash.hash(state)
  }
}
