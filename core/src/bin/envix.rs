use clap::{ArgAction, Args, Parser, Subcommand};
use envix_core::{session, Engine, Request, SandboxMode, Settings};
use envix_util::{anyhow, logger, Cancel, Exit, Result};
use std::path::PathBuf;

#[macro_use] extern crate slog_scope;

/// Builds pinned packages and runs programs in the environment they make up.
#[derive(Parser, Debug)]
#[command(name = "envix", version)]
struct Cli {
  /// More output; repeat for more.
  #[arg(short, long, action = ArgAction::Count, global = true)]
  verbose: u8,

  /// Store directory.
  #[arg(long, global = true, env = "ENVIX_STORE_DIR")]
  store: Option<PathBuf>,

  /// on, relaxed or off.
  #[arg(long, global = true)]
  sandbox: Option<SandboxMode>,

  /// Builds to run at the same time.
  #[arg(short = 'j', long, global = true)]
  max_jobs: Option<usize>,

  /// Rebuild outputs that already exist and fail if they come out different.
  #[arg(long, global = true)]
  check: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Args, Debug)]
struct Selection {
  /// Registry file pinning the sources.
  #[arg(long, env = "ENVIX_REGISTRY")]
  registry: PathBuf,

  /// Registry entry holding the packages.
  #[arg(long)]
  source: String,

  /// Defaults to the host architecture.
  #[arg(long)]
  arch: Option<String>,

  /// Keep the packages alive across garbage collections under this name.
  #[arg(long)]
  root: Option<String>,

  /// Packages, in order of precedence.
  #[arg(required = true)]
  packages: Vec<String>,
}

impl Selection {
  fn request(self) -> Request {
    Request {
      registry: self.registry,
      source: self.source,
      architecture: self.arch,
      packages: self.packages,
      gc_root: self.root,
    }
  }
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Print the composed environment as JSON.
  PrintEnv(Selection),
  /// Run a command in the composed environment.
  Run {
    #[command(flatten)]
    selection: Selection,
    #[arg(last = true, required = true)]
    command: Vec<String>,
  },
  /// Start $SHELL in the composed environment.
  Shell(Selection),
  /// Delete store objects no root refers to.
  Gc,
}

fn settings(cli: &Cli) -> Result<Settings> {
  let mut settings = Settings::from_env().map_err(|e| anyhow!(e))?;
  if let Some(store) = &cli.store {
    settings.set_store_dir(store.clone());
  }
  if let Some(mode) = cli.sandbox {
    settings.set_sandbox(mode);
  }
  if let Some(jobs) = cli.max_jobs {
    settings.set_max_jobs(jobs);
  }
  if cli.check {
    settings.set_build_mode(envix_core::BuildMode::Check);
  }
  Ok(settings)
}

fn run(cli: Cli) -> Result<u8> {
  logger::init(cli.verbose)?;
  let settings = settings(&cli)?;
  debug!("settings"; "settings" => ?settings);

  let cancel = Cancel::new();
  {
    let cancel = cancel.clone();
    ctrlc::set_handler(move || {
      warn!("interrupted, stopping");
      cancel.cancel();
    })?;
  }

  let engine = Engine::open(settings)?;

  match cli.command {
    Command::PrintEnv(selection) => {
      let env = engine.compose(&selection.request(), &cancel)?;
      println!("{}", serde_json::to_string_pretty(&env)?);
      Ok(0)
    }
    Command::Run { selection, command } => {
      let env = engine.compose(&selection.request(), &cancel)?;
      let (program, args) = command
        .split_first()
        .ok_or_else(|| anyhow!("no command given"))?;
      session::run(&env, program.as_str(), &args.iter().map(String::as_str).collect::<Vec<_>>())
    }
    Command::Shell(selection) => {
      let env = engine.compose(&selection.request(), &cancel)?;
      session::shell(&env)
    }
    Command::Gc => {
      let deleted = engine.collect_garbage()?;
      println!("{} store objects deleted", deleted.len());
      Ok(0)
    }
  }
}

fn main() -> Exit {
  Exit(run(Cli::parse()))
}
