use super::{Context, Hash, HashType};
use crate::Result;
use std::io::{self, Seek, SeekFrom, Write};

/// A writer that hashes everything passing through it on the way to `writer`.
pub struct Sink<W> {
  c: Context,
  writer: W,
}

impl Sink<io::Sink> {
  /// A sink that only hashes.
  pub fn hasher(ty: HashType) -> Self {
    Self::new(ty, io::sink())
  }
}

impl<W> Sink<W> {
  pub fn new(ty: HashType, writer: W) -> Self {
    Self {
      c: Context::new(ty),
      writer,
    }
  }

  pub fn finish(self) -> (W, Hash, usize) {
    let (hash, len) = self.c.finish();
    (self.writer, hash, len)
  }
}

impl<W: Seek> Sink<W> {
  /// `Sink::finish`, but seeks to the beginning of the stream before returning.
  pub fn finish_reset(mut self) -> Result<(W, Hash, usize)> {
    self.writer.seek(SeekFrom::Start(0))?;
    Ok(self.finish())
  }
}

impl<W: Write> Write for Sink<W> {
  fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
    let n = self.writer.write(buf)?;
    self.c.input(&buf[..n]);
    Ok(n)
  }

  fn flush(&mut self) -> io::Result<()> {
    self.writer.flush()
  }
}
