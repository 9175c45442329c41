//! Running programs inside a composed environment.

use crate::{compose::EnvironmentDescriptor, prelude::*};
use std::{
  ffi::OsStr,
  os::unix::process::ExitStatusExt,
  process::{Command, ExitStatus},
};

/// `program` with the environment's variables and nothing from the host.
pub fn command<S: AsRef<OsStr>>(env: &EnvironmentDescriptor, program: S) -> Command {
  let mut cmd = Command::new(program);
  cmd.env_clear().envs(env.to_env());
  cmd
}

/// Exit code of a finished session; death by signal `n` maps to `128 + n`
/// the way shells report it.
pub fn exit_code(status: ExitStatus) -> u8 {
  match (status.code(), status.signal()) {
    (Some(code), _) => code as u8,
    (None, Some(signal)) => 128u8.saturating_add(signal as u8),
    (None, None) => 1,
  }
}

/// Runs `program` with `args` in the environment and waits for it.
pub fn run<S: AsRef<OsStr>>(env: &EnvironmentDescriptor, program: S, args: &[S]) -> Result<u8> {
  let program = program.as_ref();
  debug!("starting session"; "program" => %program.to_string_lossy());
  let status = command(env, program)
    .args(args)
    .status()
    .with_context(|| format!("unable to run `{}'", program.to_string_lossy()))?;
  Ok(exit_code(status))
}

/// Runs the user's shell in the environment.
pub fn shell(env: &EnvironmentDescriptor) -> Result<u8> {
  let shell = std::env::var_os("SHELL").unwrap_or_else(|| "/bin/sh".into());
  run(env, shell.as_os_str(), &[])
}
