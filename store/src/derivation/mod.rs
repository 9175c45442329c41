use crate::{path::DUMMY, prelude::*, FileIngestionMethod};
pub use print::Print;
use std::{
  collections::BTreeMap,
  fmt::{self, Display},
  sync::Arc,
  time::Duration,
};

mod print;

/// Identity of a derivation: the hash of its canonical serialization with its
/// own output masked. Every input's output path is part of that
/// serialization, so ids chain through the whole dependency graph.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct DrvId(Hash);

impl DrvId {
  pub fn hash(&self) -> Hash {
    self.0
  }

  pub fn parse(s: &str) -> Result<Self> {
    Ok(Self(Hash::decode_with_type(s, HashType::SHA256, false)?))
  }
}

impl Display for DrvId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0.encode(Encoding::Base32))
  }
}

#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub struct FixedOutputHash {
  pub method: FileIngestionMethod,
  pub hash: Hash,
}

impl FixedOutputHash {
  pub fn method_algo(&self) -> String {
    format!("{}{}", self.method.prefix(), self.hash.ty())
  }

  pub fn store_path<S: Store + ?Sized>(&self, store: &S, name: &str) -> Result<StorePath> {
    store.make_fixed_output_path(self.method, self.hash, name)
  }
}

#[derive(Debug, Eq, PartialEq, Clone)]
pub enum Output {
  InputAddressed(StorePath),
  Fixed(FixedOutputHash, StorePath),
}

impl Output {
  pub fn path(&self) -> &StorePath {
    match self {
      Self::InputAddressed(p) | Self::Fixed(_, p) => p,
    }
  }

  pub fn as_fixed(&self) -> Option<&FixedOutputHash> {
    match self {
      Self::Fixed(h, _) => Some(h),
      Self::InputAddressed(_) => None,
    }
  }
}

/// What a package adds to an environment it is composed into.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvContribution {
  /// Path-like variable → subdirectories of the output to append to it.
  pub search_paths: BTreeMap<String, Vec<String>>,
  /// Plain variables, `@out@` already replaced by the output path.
  pub variables: BTreeMap<String, String>,
  /// Replace variables set by earlier packages instead of yielding to them.
  pub overrides: bool,
}

#[derive(Debug, Clone)]
pub struct Derivation {
  pub id: DrvId,
  pub name: String,
  pub platform: String,
  pub builder: String,
  pub args: Vec<String>,
  pub env: BTreeMap<String, String>,
  pub input_sources: StorePathSet,
  /// Output path of each input derivation.
  pub input_derivations: BTreeMap<StorePath, Arc<Derivation>>,
  pub output: Output,
  pub contribution: EnvContribution,
  pub timeout: Option<Duration>,
}

impl Derivation {
  /// A derivation with no inputs whose output is not computed yet; see
  /// [`Derivation::seal`].
  pub fn new(name: String, platform: String, builder: String) -> Self {
    Self {
      id: DrvId(Hash::hash("", HashType::SHA256)),
      name,
      platform,
      builder,
      args: vec![],
      env: Default::default(),
      input_sources: Default::default(),
      input_derivations: Default::default(),
      output: Output::InputAddressed(DUMMY.clone()),
      contribution: Default::default(),
      timeout: None,
    }
  }

  /// Fills in the output path, `$out` and the id once everything else is
  /// final. Input-addressed outputs are named after the hash of the
  /// derivation with the output masked, fixed outputs after their content.
  pub fn seal<S: Store + ?Sized>(&mut self, store: &S, fixed: Option<FixedOutputHash>) -> Result<()> {
    let path = match fixed {
      Some(hash) => {
        let path = hash.store_path(store, &self.name)?;
        self.output = Output::Fixed(hash, path.clone());
        path
      }
      None => {
        self.env.insert("out".into(), String::new());
        self.output = Output::InputAddressed(DUMMY.clone());
        let masked = Hash::hash(self.print(store, true).to_string(), HashType::SHA256);
        let path = store.make_output_path("out", masked, &self.name)?;
        self.output = Output::InputAddressed(path.clone());
        path
      }
    };
    self
      .env
      .insert("out".into(), store.print_store_path(&path));
    self.id = self.compute_id(store);
    Ok(())
  }

  pub fn out_path(&self) -> &StorePath {
    self.output.path()
  }

  pub fn is_fixed_output(&self) -> bool {
    self.output.as_fixed().is_some()
  }

  /// Computes the id of a derivation whose `output` and `$out` are already
  /// filled in. Fixed-output derivations are identified by what they
  /// produce, so changing how the content is obtained does not change it.
  pub fn compute_id<S: Store + ?Sized>(&self, store: &S) -> DrvId {
    let text = match &self.output {
      Output::Fixed(hash, path) => format!(
        "fixed:out:{method}:{hash}:{path}",
        method = hash.method_algo(),
        hash = hash.hash.encode(Encoding::Base16),
        path = store.print_store_path(path)
      ),
      Output::InputAddressed(_) => self.print(store, true).to_string(),
    };
    DrvId(Hash::hash(text, HashType::SHA256))
  }

  /// Every store path the builder may read.
  pub fn input_paths(&self) -> StorePathSet {
    let mut paths = self.input_sources.clone();
    paths.extend(self.input_derivations.keys().cloned());
    paths
  }
}
