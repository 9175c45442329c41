//! Turning pins into verified store objects.

use crate::{prelude::*, registry::PinEntry};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::{
  collections::HashMap,
  io::{self, Seek, SeekFrom},
  sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
  },
  time::Duration,
};
pub use transport::{
  download, CurlTransport, FileTransport, Transport, TransportError, TransportResult, Transports,
};

pub mod transport;

/// Longest wait between two attempts, however large the backoff grows.
pub const MAX_BACKOFF: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Copy)]
pub struct FetchOptions {
  /// How often a transient failure is retried before giving up.
  pub retries: u32,
  /// Delay before the first retry; doubled for every retry after it, up to
  /// `MAX_BACKOFF`.
  pub backoff: Duration,
  pub timeout: Duration,
}

impl Default for FetchOptions {
  fn default() -> Self {
    Self {
      retries: 3,
      backoff: Duration::from_millis(500),
      timeout: Duration::from_secs(300),
    }
  }
}

/// Delay before retry number `attempt` (1-based).
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
  base
    .checked_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
    .map_or(MAX_BACKOFF, |d| d.min(MAX_BACKOFF))
}

/// The object a pin resolved to and the content hash it was checked against.
type Fetched = (StoreObject, Hash);

pub struct Fetcher {
  store: Arc<dyn Store>,
  transport: Arc<dyn Transport>,
  options: FetchOptions,
  in_flight: Mutex<HashMap<(String, String), Arc<OnceCell<Fetched>>>>,
  transfers: AtomicUsize,
}

impl Fetcher {
  pub fn new(store: Arc<dyn Store>, transport: Arc<dyn Transport>, options: FetchOptions) -> Self {
    Self {
      store,
      transport,
      options,
      in_flight: Default::default(),
      transfers: AtomicUsize::new(0),
    }
  }

  /// Number of transfers started so far, retries included.
  pub fn transfers(&self) -> usize {
    self.transfers.load(Ordering::SeqCst)
  }

  /// Where the object for `pin` lives once fetched.
  pub fn path_for(&self, pin: &PinEntry) -> Result<StorePath> {
    self
      .store
      .make_fixed_output_path(FileIngestionMethod::Recursive, pin.content_hash, &pin.name)
  }

  /// Fetches `pin` at most once per `(locator, revision)`. Concurrent callers
  /// for the same key wait for the first; a failed attempt is not
  /// remembered, so the next caller starts over.
  pub fn fetch(&self, pin: &PinEntry, cancel: &Cancel) -> Result<StoreObject> {
    let key = (pin.locator.to_string(), pin.revision.clone());
    let cell = self.in_flight.lock().entry(key).or_default().clone();

    let (object, verified) = cell.get_or_try_init(|| self.fetch_uncached(pin, cancel))?;

    if *verified != pin.content_hash {
      return Err(
        Error::IntegrityViolation {
          name: pin.name.clone(),
          revision: pin.revision.clone(),
          expected: pin.content_hash.to_string(),
          actual: verified.to_string(),
        }
        .into(),
      );
    }
    Ok(object.clone())
  }

  fn fetch_uncached(&self, pin: &PinEntry, cancel: &Cancel) -> Result<Fetched> {
    let path = self.path_for(pin)?;
    if let Some(object) = self.store.query_path_info(&path)? {
      debug!("source already in store"; "name" => &pin.name, "path" => %path);
      return Ok((object, pin.content_hash));
    }

    let locator = pin.resolved_locator()?;
    info!("fetching source"; "name" => &pin.name, "revision" => &pin.revision, "url" => %locator);

    let mut attempts = 0;
    let mut archive = loop {
      cancel.check()?;
      attempts += 1;
      self.transfers.fetch_add(1, Ordering::SeqCst);
      match self.transport.fetch(&locator, self.options.timeout) {
        Ok(f) => break f,
        Err(TransportError::Transient(reason)) if attempts <= self.options.retries => {
          let delay = backoff_delay(self.options.backoff, attempts);
          let e = Error::TransientFetchError {
            name: pin.name.clone(),
            revision: pin.revision.clone(),
            reason,
          };
          warn!("{}, retrying", e; "attempt" => attempts, "delay_ms" => delay.as_millis() as u64);
          cancel.sleep(delay)?;
        }
        Err(e) => {
          return Err(
            Error::FetchFailure {
              name: pin.name.clone(),
              revision: pin.revision.clone(),
              attempts,
              reason: e.to_string(),
            }
            .into(),
          )
        }
      }
    };

    let mut content = HashSink::new(pin.content_hash.ty(), HashSink::hasher(HashType::SHA256));
    io::copy(&mut archive, &mut content)?;
    let (nar, actual, size) = content.finish();
    let (_, nar_hash, _) = nar.finish();

    if actual != pin.content_hash {
      return Err(
        Error::IntegrityViolation {
          name: pin.name.clone(),
          revision: pin.revision.clone(),
          expected: pin.content_hash.to_string(),
          actual: actual.to_string(),
        }
        .into(),
      );
    }

    cancel.check()?;
    archive.seek(SeekFrom::Start(0))?;
    let info = StoreObject::new(path, nar_hash, size as u64, Producer::Fetched);
    let object = self
      .store
      .add_to_store(info, &mut archive)
      .with_context(|| format!("while unpacking source `{}'", pin.name))?;

    info!("fetched source"; "name" => &pin.name, "path" => %object.path, "attempts" => attempts);
    Ok((object, actual))
  }
}
