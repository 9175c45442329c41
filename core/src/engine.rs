use crate::{
  build::{Builder, Worker},
  compose::{self, EnvironmentDescriptor},
  prelude::*,
  settings::Settings,
};
use envix_eval::{
  fetch::{Transport, Transports},
  Fetcher, PackageSet, Registry,
};
use std::{collections::BTreeMap, path::PathBuf, sync::Arc};

/// One composition: which packages of which pinned source, built for which
/// architecture.
#[derive(Debug, Clone)]
pub struct Request {
  pub registry: PathBuf,
  pub source: String,
  /// Defaults to the architecture envix runs on.
  pub architecture: Option<String>,
  pub packages: Vec<String>,
  /// Registers the composed packages as a GC root under this name.
  pub gc_root: Option<String>,
}

impl Request {
  pub fn architecture(&self) -> &str {
    self
      .architecture
      .as_deref()
      .unwrap_or(std::env::consts::ARCH)
  }
}

/// Everything a run shares: the store, the fetcher and the builder, so
/// concurrent requests share fetches and builds too.
pub struct Engine {
  settings: Arc<Settings>,
  store: Arc<dyn Store>,
  fetcher: Fetcher,
  builder: Arc<Builder>,
}

impl Engine {
  pub fn open(settings: Settings) -> Result<Self> {
    Self::with_transport(settings, Arc::new(Transports::default()))
  }

  pub fn with_transport(settings: Settings, transport: Arc<dyn Transport>) -> Result<Self> {
    let settings = Arc::new(settings);
    let store: Arc<dyn Store> = Arc::new(
      LocalStore::open(settings.store_dir())
        .with_context(|| format!("while opening store `{}'", settings.store_dir().display()))?,
    );
    let fetcher = Fetcher::new(store.clone(), transport, settings.fetch_options());
    let builder = Arc::new(Builder::new(store.clone(), settings.clone()));
    Ok(Self {
      settings,
      store,
      fetcher,
      builder,
    })
  }

  pub fn settings(&self) -> &Settings {
    &self.settings
  }

  pub fn store(&self) -> &Arc<dyn Store> {
    &self.store
  }

  pub fn fetcher(&self) -> &Fetcher {
    &self.fetcher
  }

  pub fn builder(&self) -> &Builder {
    &self.builder
  }

  /// Fetches the source the request names and reads its package set.
  pub fn evaluate(&self, request: &Request, cancel: &Cancel) -> Result<PackageSet> {
    let registry = Registry::load(&request.registry)?;
    let pin = registry.resolve(&request.source)?;
    let source = self.fetcher.fetch(pin, cancel)?;
    envix_eval::evaluate(self.store.clone(), &source, request.architecture())
  }

  /// Builds `packages` and everything they need. All of them are
  /// instantiated before the first build starts.
  pub fn realise(
    &self,
    set: &PackageSet,
    packages: &[String],
    cancel: &Cancel,
  ) -> Result<BTreeMap<DrvId, StoreObject>> {
    let drvs = packages
      .iter()
      .map(|attr| set.get(attr))
      .collect::<Result<Vec<_>>>()?;

    let mut worker = Worker::new(self.builder.clone(), cancel.clone());
    for drv in &drvs {
      worker.add_needed(drv)?;
    }
    worker.build()
  }

  pub fn compose(&self, request: &Request, cancel: &Cancel) -> Result<EnvironmentDescriptor> {
    let set = self.evaluate(request, cancel)?;
    self.realise(&set, &request.packages, cancel)?;
    let env = compose::compose(&*self.store, &set, &request.packages)?;

    if let Some(name) = &request.gc_root {
      let mut roots = StorePathSet::new();
      roots.insert(set.source().path.clone());
      for attr in &request.packages {
        roots.insert(set.get(attr)?.out_path().clone());
      }
      self.store.add_root(name, &roots)?;
    }

    info!("environment composed";
      "source" => &request.source, "architecture" => request.architecture(),
      "packages" => request.packages.len());
    Ok(env)
  }

  /// Deletes everything no GC root keeps alive. Must not run while another
  /// process is building into the same store.
  pub fn collect_garbage(&self) -> Result<Vec<StorePath>> {
    envix_store::gc::collect_garbage(&*self.store)
  }
}
