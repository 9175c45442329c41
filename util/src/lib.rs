#[macro_use] extern crate derive_more;
#[macro_use] extern crate lazy_static;
#[macro_use] extern crate slog_scope;

#[doc(no_inline)] pub use anyhow::{anyhow, bail, ensure, Context as _, Result};
pub use cancel::Cancel;
pub use error::{Error, FailureClass};
pub use hash::{Context as HashContext, Encoding, Hash, HashType, Sink as HashSink};
#[doc(no_inline)] pub use rusqlite::{named_params, params, OptionalExtension as _};
pub use sqlite::Sqlite;
use std::process::{ExitCode, Termination};

pub mod base32;
pub mod cancel;
pub mod error;
pub mod hash;
pub mod logger;
pub mod nar;
pub mod sqlite;

/// Return type for `main`. `Ok(code)` exits with `code` (so a spawned
/// session's status can be passed through); an error is printed to stderr and
/// mapped to the exit code of its [`FailureClass`], or 1 when the error chain
/// carries no typed [`Error`].
pub struct Exit(pub Result<u8>);

impl Termination for Exit {
  fn report(self) -> ExitCode {
    match self.0 {
      Ok(code) => ExitCode::from(code),
      Err(e) => {
        eprintln!("error: {:#}", e);
        let code = Error::find(&e).map_or(1, |typed| typed.class().exit_code());
        ExitCode::from(code)
      }
    }
  }
}

impl From<Result<u8>> for Exit {
  fn from(r: Result<u8>) -> Self {
    Self(r)
  }
}
