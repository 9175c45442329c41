//! Moving source archives from wherever a locator points to a local file.

use crate::prelude::*;
use curl::easy::{Easy, HttpVersion};
use slog::{Drain, Level};
use std::{
  fs::File,
  io::{self, Seek, SeekFrom, Write},
  time::{Duration, Instant},
};
use thiserror::Error;
use url::Url;

/// Why a transfer failed, and whether trying again could help.
#[derive(Debug, Error)]
pub enum TransportError {
  #[error("{0}")]
  Transient(String),
  #[error("{0}")]
  Permanent(String),
}

impl TransportError {
  pub fn is_transient(&self) -> bool {
    matches!(self, Self::Transient(_))
  }

  fn from_io(e: io::Error) -> Self {
    match e.kind() {
      io::ErrorKind::TimedOut
      | io::ErrorKind::Interrupted
      | io::ErrorKind::ConnectionReset
      | io::ErrorKind::ConnectionAborted => Self::Transient(e.to_string()),
      _ => Self::Permanent(e.to_string()),
    }
  }
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Retrieves the canonical archive of the source tree `locator` points to.
/// The returned file is positioned at its start.
pub trait Transport: Send + Sync {
  fn fetch(&self, locator: &Url, timeout: Duration) -> TransportResult<File>;
}

/// Fails writes once `deadline` has passed.
struct Bounded<W> {
  inner: W,
  deadline: Option<Instant>,
}

impl<W: Write> Write for Bounded<W> {
  fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
    if self.deadline.map_or(false, |d| Instant::now() >= d) {
      return Err(io::Error::new(io::ErrorKind::TimedOut, "archiving timed out"));
    }
    self.inner.write(buf)
  }

  fn flush(&mut self) -> io::Result<()> {
    self.inner.flush()
  }
}

/// `file://` locators: directories and plain files are archived on the fly
/// within `timeout`, `*.nar` files are taken as archives already.
#[derive(Debug, Default)]
pub struct FileTransport;

impl Transport for FileTransport {
  fn fetch(&self, locator: &Url, timeout: Duration) -> TransportResult<File> {
    let path = locator
      .to_file_path()
      .map_err(|_| TransportError::Permanent(format!("`{}' is not a local path", locator)))?;

    if !path.exists() {
      return Err(TransportError::Permanent(format!(
        "`{}' does not exist",
        path.display()
      )));
    }

    if path.extension().map_or(false, |e| e == "nar") && path.is_file() {
      return File::open(&path).map_err(TransportError::from_io);
    }

    let mut out = tempfile::tempfile().map_err(TransportError::from_io)?;
    let sink = Bounded {
      inner: &mut out,
      deadline: Instant::now().checked_add(timeout),
    };
    nar::dump_path(&path, sink).map_err(|e| {
      match e.chain().find_map(|c| c.downcast_ref::<io::Error>()) {
        Some(io) => TransportError::from_io(io::Error::new(io.kind(), format!("{:#}", e))),
        None => TransportError::Permanent(format!("{:#}", e)),
      }
    })?;
    out
      .seek(SeekFrom::Start(0))
      .map_err(TransportError::from_io)?;
    Ok(out)
  }
}

/// `http://` and `https://` locators, downloaded with libcurl.
#[derive(Debug, Default)]
pub struct CurlTransport;

impl Transport for CurlTransport {
  fn fetch(&self, locator: &Url, timeout: Duration) -> TransportResult<File> {
    curl(locator.as_str(), timeout).map_err(|e| {
      debug!("download failed"; "url" => %locator, "error" => %e);
      e
    })
  }
}

fn classify(e: curl::Error) -> TransportError {
  if e.is_couldnt_connect()
    || e.is_couldnt_resolve_host()
    || e.is_couldnt_resolve_proxy()
    || e.is_operation_timedout()
    || e.is_recv_error()
    || e.is_send_error()
    || e.is_partial_file()
    || e.is_got_nothing()
  {
    TransportError::Transient(e.to_string())
  } else {
    TransportError::Permanent(e.to_string())
  }
}

fn curl(url: &str, timeout: Duration) -> TransportResult<File> {
  let mut easy = Easy::new();

  let setup = |easy: &mut Easy| -> Result<(), curl::Error> {
    if slog_scope::logger().is_enabled(Level::Trace) {
      easy.verbose(true)?;
      easy.debug_function(|_, bytes| trace!("curl: {:?}", String::from_utf8_lossy(bytes)))?;
    }
    easy.url(url)?;
    easy.follow_location(true)?;
    easy.max_redirections(10)?;
    easy.signal(false)?;
    easy.useragent(&format!(
      "curl/{} envix/{}",
      curl::Version::get().version(),
      env!("CARGO_PKG_VERSION")
    ))?;
    easy.http_version(HttpVersion::V11)?;
    easy.fail_on_error(false)?;
    easy.connect_timeout(timeout)?;
    easy.timeout(timeout)?;
    easy.low_speed_limit(1)?;
    easy.low_speed_time(timeout)?;
    Ok(())
  };
  setup(&mut easy).map_err(classify)?;

  let mut output = tempfile::tempfile().map_err(TransportError::from_io)?;
  let mut write_failed = None;
  let result = {
    let mut tx = easy.transfer();
    tx.write_function(|data| {
      if let Err(e) = output.write_all(data) {
        write_failed = Some(e);
        // a short count makes curl abort the transfer
        return Ok(0);
      }
      Ok(data.len())
    })
    .map_err(classify)?;
    tx.perform()
  };

  if let Some(e) = write_failed {
    return Err(TransportError::Permanent(format!(
      "unable to store download: {}",
      e
    )));
  }
  result.map_err(classify)?;

  let status = easy.response_code().map_err(classify)?;
  match status {
    200..=299 => {}
    408 | 429 | 500..=599 => {
      return Err(TransportError::Transient(format!(
        "server answered HTTP {} for `{}'",
        status, url
      )))
    }
    _ => {
      return Err(TransportError::Permanent(format!(
        "server answered HTTP {} for `{}'",
        status, url
      )))
    }
  }

  output
    .seek(SeekFrom::Start(0))
    .map_err(TransportError::from_io)?;
  Ok(output)
}

/// Downloads `url` byte for byte. Unlike [`FileTransport`], local files are
/// not archived.
pub fn download(url: &Url, timeout: Duration) -> TransportResult<File> {
  match url.scheme() {
    "file" => {
      let path = url
        .to_file_path()
        .map_err(|_| TransportError::Permanent(format!("`{}' is not a local path", url)))?;
      File::open(&path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => {
          TransportError::Permanent(format!("`{}' does not exist", path.display()))
        }
        _ => TransportError::from_io(e),
      })
    }
    "http" | "https" => curl(url.as_str(), timeout),
    s => Err(TransportError::Permanent(format!(
      "unsupported URL scheme `{}'",
      s
    ))),
  }
}

/// Picks a transport by URL scheme.
pub struct Transports {
  file: Box<dyn Transport>,
  http: Box<dyn Transport>,
}

impl Default for Transports {
  fn default() -> Self {
    Self {
      file: Box::new(FileTransport),
      http: Box::new(CurlTransport),
    }
  }
}

impl Transport for Transports {
  fn fetch(&self, locator: &Url, timeout: Duration) -> TransportResult<File> {
    match locator.scheme() {
      "file" => self.file.fetch(locator, timeout),
      "http" | "https" => self.http.fetch(locator, timeout),
      s => Err(TransportError::Permanent(format!(
        "unsupported locator scheme `{}'",
        s
      ))),
    }
  }
}
