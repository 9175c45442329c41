use std::sync::{Mutex, Once};

use anyhow::Result;
use slog::{Drain, FilterLevel, FnValue, Record};

static INIT: Once = Once::new();

/// Installs the global logger. `verbosity` picks the default level (0 = warnings,
/// 1 = info, 2 = debug, more = trace); `ENVIX_LOG` overrides it with
/// env_logger-style directives. Only the first call has any effect.
pub fn init(verbosity: u8) -> Result<()> {
  let mut result = Ok(());
  INIT.call_once(|| result = install(verbosity));
  result
}

fn install(verbosity: u8) -> Result<()> {
  let level = match verbosity {
    0 => FilterLevel::Warning,
    1 => FilterLevel::Info,
    2 => FilterLevel::Debug,
    _ => FilterLevel::Trace,
  };

  let mut builder = slog_envlogger::LogBuilder::new(slog_term::term_full()).filter(None, level);
  if let Ok(directives) = std::env::var("ENVIX_LOG") {
    builder = builder.parse(&directives);
  }

  let logger = slog::Logger::root(
    Mutex::new(builder.build().fuse()).fuse(),
    slog::o!("location" => FnValue(move |r: &Record| {
      format!("{}:{}", r.location().file, r.location().line)
    })),
  );

  let log_guard = slog_scope::set_global_logger(logger);
  std::mem::forget(log_guard);

  slog_stdlog::init()?;

  Ok(())
}
