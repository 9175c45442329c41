use crate::{prelude::*, settings::BuildMode};
use crossbeam::thread::Scope;
use dep_queue::DependencyQueue;
use queue::Queue;
use std::{
  collections::{BTreeMap, HashMap},
  sync::Arc,
  time::Duration,
};

pub use builder::Builder;

mod builder;
pub mod builtins;
mod dep_queue;
mod queue;

cfg_if::cfg_if! {
  if #[cfg(target_os = "linux")] {
    mod linux;
    use self::linux as sys;
  } else {
    mod sys {
      use crate::prelude::*;
      use std::{
        path::{Path, PathBuf},
        process::Command,
      };

      pub(super) struct Chroot;

      impl Chroot {
        pub(super) fn new(_: &Path, _: &Path, _: &Path) -> Result<Self> {
          bail!("sandboxed builds are only supported on Linux")
        }

        pub(super) fn bind(&mut self, _: &Path, _: bool, _: bool) -> Result<()> {
          Ok(())
        }

        pub(super) fn host_path(&self, path: &Path) -> PathBuf {
          path.to_path_buf()
        }

        pub(super) fn confine(&self, _: &mut Command, _: bool) {}
      }
    }
  }
}

#[derive(Debug)]
enum Message {
  Finish {
    job_id: usize,
    result: Result<StoreObject>,
  },
}

/// Builds the closure of a set of derivations, running independent builds
/// in parallel up to the configured number of jobs.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Worker {
  queue: DependencyQueue<DrvId, Arc<Derivation>>,
  pending: Vec<(DrvId, Arc<Derivation>)>,
  active: HashMap<usize, DrvId>,
  messages: Arc<Queue<Message>>,
  next_id: usize,
  built: BTreeMap<DrvId, StoreObject>,
  #[derivative(Debug = "ignore")]
  builder: Arc<Builder>,
  cancel: Cancel,
}

impl Worker {
  pub fn new(builder: Arc<Builder>, cancel: Cancel) -> Self {
    Self {
      queue: Default::default(),
      pending: Default::default(),
      active: Default::default(),
      messages: Default::default(),
      next_id: 0,
      built: Default::default(),
      builder,
      cancel,
    }
  }

  /// Queues `drv` and whatever it needs that is not in the store yet.
  pub fn add_needed(&mut self, drv: &Arc<Derivation>) -> Result<()> {
    if self.built.contains_key(&drv.id) || self.queue.contains(&drv.id) {
      return Ok(());
    }

    if self.builder.settings().build_mode() != BuildMode::Check {
      if let Some(obj) = self.builder.store().query_path_info(drv.out_path())? {
        trace!("already built"; "derivation" => %drv.id, "path" => %obj.path);
        self.built.insert(drv.id, obj);
        return Ok(());
      }
    }

    for dep in drv.input_derivations.values() {
      self.add_needed(dep)?;
    }
    self.queue.enqueue(
      drv.id,
      drv.clone(),
      drv.input_derivations.values().map(|d| d.id),
    );
    Ok(())
  }

  fn spawn_if_possible(&mut self, scope: &Scope) {
    while let Some(job) = self.queue.dequeue() {
      self.pending.push(job);
    }

    while !self.pending.is_empty() && self.has_slots() {
      let (id, drv) = self.pending.remove(0);
      self.run(id, drv, scope);
    }
  }

  fn has_slots(&self) -> bool {
    self.active.len() < self.builder.settings().max_jobs().max(1)
  }

  fn wait_for_events(&mut self) -> Vec<Message> {
    let mut events = self.messages.try_pop_all();
    while events.is_empty() {
      match self.messages.pop(Duration::from_millis(100)) {
        Some(message) => events.push(message),
        None if self.cancel.is_cancelled() => break,
        None => trace!("waiting for events"),
      }
    }
    events
  }

  fn drain(&mut self, scope: &Scope) -> Result<()> {
    let mut error = None;

    loop {
      if error.is_none() && self.cancel.is_cancelled() {
        error = Some(Error::Cancelled.into());
      }

      if error.is_none() {
        self.spawn_if_possible(scope);
      }

      if self.active.is_empty() {
        break;
      }

      for event in self.wait_for_events() {
        if let Err(e) = self.handle_event(event) {
          self.handle_error(&mut error, e);
        }
      }
    }

    if let Some(e) = error {
      Err(e)
    } else if self.queue.is_empty() && self.pending.is_empty() {
      Ok(())
    } else {
      bail!("internal error: some jobs left in queue")
    }
  }

  fn handle_error(&self, some_error: &mut Option<anyhow::Error>, error: anyhow::Error) {
    if some_error.is_some() {
      warn!("{:#}", error);
    } else {
      if !self.active.is_empty() {
        warn!("{:#}", error);
        warn!("build failed, waiting for others to finish"; "running" => self.active.len());
      }
      *some_error = Some(error);
    }
  }

  fn handle_event(&mut self, event: Message) -> Result<()> {
    match event {
      Message::Finish { job_id, result } => {
        let id = self
          .active
          .remove(&job_id)
          .ok_or_else(|| anyhow!("internal error: unknown job {}", job_id))?;
        let obj = result?;
        debug!("build finished"; "derivation" => %id, "path" => %obj.path);
        self.built.insert(id, obj);
        self.queue.finish(&id);
      }
    }
    Ok(())
  }

  fn run(&mut self, id: DrvId, drv: Arc<Derivation>, scope: &Scope) {
    let job_id = self.next_id;
    self.next_id += 1;
    self.active.insert(job_id, id);

    let inputs = drv
      .input_derivations
      .values()
      .filter_map(|d| self.built.get(&d.id).map(|o| (d.id, o.clone())))
      .collect::<BTreeMap<_, _>>();
    let messages = Arc::clone(&self.messages);
    let builder = Arc::clone(&self.builder);
    let cancel = self.cancel.clone();

    debug!("starting build"; "derivation" => %id, "name" => &drv.name);
    scope.spawn(move |_| {
      let result = builder.build(&drv, &inputs, &cancel);
      messages.push(Message::Finish { job_id, result });
    });
  }

  /// Runs every queued build. Returns the output of every derivation that
  /// was added, built now or before.
  pub fn build(mut self) -> Result<BTreeMap<DrvId, StoreObject>> {
    if let Err(cycle) = self.queue.queue_finished() {
      let cycle = cycle
        .iter()
        .map(|id| self.queue.get(id).map_or_else(|| id.to_string(), |d| d.name.clone()))
        .collect();
      return Err(Error::CyclicDependency { cycle }.into());
    }

    debug!("building closure"; "queued" => self.queue.len(), "present" => self.built.len());

    crossbeam::thread::scope(|s| self.drain(s))
      .map_err(|_| anyhow!("a build thread panicked"))??;
    Ok(self.built)
  }
}
