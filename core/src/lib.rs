#[macro_use] extern crate derivative;
#[macro_use] extern crate slog_scope;

pub mod build;
pub mod compose;
pub mod engine;
pub mod session;
pub mod settings;

pub use build::{Builder, Worker};
pub use compose::{compose, EnvironmentDescriptor};
pub use engine::{Engine, Request};
pub use settings::{BuildMode, SandboxMode, Settings};

mod prelude {
  pub use envix_store::{
    Derivation, DrvId, FileIngestionMethod, FixedOutputHash, LocalStore, Producer, Store,
    StoreObject, StorePath, StorePathSet,
  };
  pub use envix_util::*;
}
