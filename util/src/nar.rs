//! The canonical archive format used to hash, ship and unpack store objects.
//!
//! A file tree is written as a sequence of length-prefixed, 8-byte padded
//! strings. Directory entries are sorted by name and only the executable bit
//! of a regular file's mode is kept, so the same tree always produces the
//! same bytes.

use crate::*;
use std::{
  fs::{self, File},
  io::{self, Read, Write},
  os::unix::fs::{symlink, PermissionsExt},
  path::Path,
};

const VERSION_MAGIC: &str = "nix-archive-1";
const MAX_TAG_LEN: u64 = 4096;

pub struct Sink<W> {
  writer: W,
}

impl<W: Write> Sink<W> {
  pub fn tag(&mut self, tag: &str) -> Result<()> {
    self.bytes(tag.as_bytes())
  }

  pub fn tags<'a>(&mut self, tags: impl IntoIterator<Item = &'a str>) -> Result<()> {
    for t in tags {
      self.tag(t)?;
    }
    Ok(())
  }

  fn bytes(&mut self, bytes: &[u8]) -> Result<()> {
    self.write_u64(bytes.len() as u64)?;
    self.writer.write_all(bytes)?;
    self.pad(bytes.len() as u64)
  }

  fn write_u64(&mut self, n: u64) -> Result<()> {
    self.writer.write_all(&n.to_le_bytes())?;
    Ok(())
  }

  fn pad(&mut self, len: u64) -> Result<()> {
    if len % 8 > 0 {
      let zeroes = [0u8; 8];
      self.writer.write_all(&zeroes[..(8 - (len % 8)) as usize])?;
    }
    Ok(())
  }

  fn contents<R: Read>(&mut self, len: u64, source: R) -> Result<()> {
    self.write_u64(len)?;
    let copied = io::copy(&mut source.take(len), &mut self.writer)?;
    ensure!(
      copied == len,
      "file shrank while being archived ({} of {} bytes)",
      copied,
      len
    );
    self.pad(len)
  }

  fn node(&mut self, path: &Path) -> Result<()> {
    let meta = fs::symlink_metadata(path)?;
    let ft = meta.file_type();
    self.tag("(")?;
    if ft.is_file() {
      self.tags(["type", "regular"])?;
      if meta.permissions().mode() & 0o100 != 0 {
        self.tags(["executable", ""])?;
      }
      self.tag("contents")?;
      self.contents(meta.len(), File::open(path)?)?;
    } else if ft.is_dir() {
      self.tags(["type", "directory"])?;
      let mut entries = fs::read_dir(path)?
        .map(|e| e.map(|e| e.file_name()))
        .collect::<io::Result<Vec<_>>>()?;
      entries.sort();
      for name in entries {
        let name_str = name
          .to_str()
          .ok_or_else(|| anyhow!("file name {:?} is not valid UTF-8", name))?;
        self.tags(["entry", "(", "name", name_str, "node"])?;
        self.node(&path.join(&name))?;
        self.tag(")")?;
      }
    } else if ft.is_symlink() {
      let target = fs::read_link(path)?;
      let target = target
        .to_str()
        .ok_or_else(|| anyhow!("symlink target {:?} is not valid UTF-8", target))?;
      self.tags(["type", "symlink", "target", target])?;
    } else {
      bail!("file `{}' has an unsupported type", path.display());
    }
    self.tag(")")
  }
}

/// Archives the tree rooted at `path`.
pub fn dump_path<W: Write>(path: &Path, sink: W) -> Result<()> {
  let mut sink = Sink { writer: sink };
  sink.tag(VERSION_MAGIC)?;
  sink
    .node(path)
    .with_context(|| format!("while archiving `{}'", path.display()))
}

pub fn dump_string<W: Write>(source: &str, sink: W) -> Result<()> {
  dump_with_len(source.len() as u64, source.as_bytes(), sink)
}

/// Archives a single regular file read from `source`.
pub fn dump_with_len<R: Read, W: Write>(len: u64, source: R, sink: W) -> Result<()> {
  let mut sink = Sink { writer: sink };
  sink.tags([VERSION_MAGIC, "(", "type", "regular", "contents"])?;
  sink.contents(len, source)?;
  sink.tag(")")
}

/// Hashes the archive of `path` without keeping it.
pub fn hash_path(path: &Path, ty: HashType) -> Result<(Hash, usize)> {
  let mut sink = HashSink::hasher(ty);
  dump_path(path, &mut sink)?;
  let (_, hash, len) = sink.finish();
  Ok((hash, len))
}

struct Source<R> {
  reader: R,
}

impl<R: Read> Source<R> {
  fn read_u64(&mut self) -> Result<u64> {
    let mut buf = [0u8; 8];
    self.reader.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
  }

  fn skip_padding(&mut self, len: u64) -> Result<()> {
    if len % 8 > 0 {
      let mut zeroes = [0u8; 8];
      let pad = &mut zeroes[..(8 - (len % 8)) as usize];
      self.reader.read_exact(pad)?;
      ensure!(pad.iter().all(|&b| b == 0), "non-zero padding in archive");
    }
    Ok(())
  }

  fn string(&mut self) -> Result<String> {
    let len = self.read_u64()?;
    ensure!(len <= MAX_TAG_LEN, "archive string of {} bytes is too long", len);
    let mut buf = vec![0u8; len as usize];
    self.reader.read_exact(&mut buf)?;
    self.skip_padding(len)?;
    Ok(String::from_utf8(buf)?)
  }

  fn expect(&mut self, tag: &str) -> Result<()> {
    let got = self.string()?;
    ensure!(got == tag, "expected `{}' in archive, got `{}'", tag, got);
    Ok(())
  }

  fn node(&mut self, path: &Path) -> Result<()> {
    self.expect("(")?;
    self.expect("type")?;
    match self.string()?.as_str() {
      "regular" => {
        let mut tag = self.string()?;
        let executable = tag == "executable";
        if executable {
          self.expect("")?;
          tag = self.string()?;
        }
        ensure!(tag == "contents", "expected `contents' in archive, got `{}'", tag);
        let len = self.read_u64()?;
        let mut file = File::create(path)?;
        let copied = io::copy(&mut (&mut self.reader).take(len), &mut file)?;
        ensure!(copied == len, "archive truncated inside `{}'", path.display());
        self.skip_padding(len)?;
        let mode = if executable { 0o555 } else { 0o444 };
        fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
      }
      "directory" => {
        fs::create_dir(path)?;
        let mut prev: Option<String> = None;
        loop {
          match self.string()?.as_str() {
            ")" => return Ok(()),
            "entry" => {}
            x => bail!("unexpected `{}' in archived directory", x),
          }
          self.expect("(")?;
          self.expect("name")?;
          let name = self.string()?;
          ensure!(
            !name.is_empty() && name != "." && name != ".." && !name.contains('/'),
            "invalid file name `{}' in archive",
            name
          );
          if let Some(p) = &prev {
            ensure!(*p < name, "archive entries are not sorted (`{}' after `{}')", name, p);
          }
          self.expect("node")?;
          self.node(&path.join(&name))?;
          self.expect(")")?;
          prev = Some(name);
        }
      }
      "symlink" => {
        self.expect("target")?;
        let target = self.string()?;
        symlink(target, path)?;
      }
      x => bail!("unknown file type `{}' in archive", x),
    }
    self.expect(")")
  }
}

/// Unpacks an archive to `path`, which must not exist yet. Regular files are
/// made read-only.
pub fn restore_path<P: AsRef<Path>, R: Read>(path: P, source: R) -> Result<()> {
  let path = path.as_ref();
  let mut source = Source { reader: source };
  source.expect(VERSION_MAGIC)?;
  source
    .node(path)
    .with_context(|| format!("while unpacking archive to `{}'", path.display()))
}

#[cfg(test)]
mod tests {
  use super::*;

  fn sample_tree(root: &Path) {
    fs::create_dir_all(root.join("bin")).unwrap();
    fs::write(root.join("bin/cc"), "#!/bin/sh\necho cc\n").unwrap();
    fs::set_permissions(root.join("bin/cc"), fs::Permissions::from_mode(0o755)).unwrap();
    fs::write(root.join("README"), "compiler").unwrap();
    symlink("bin/cc", root.join("cc")).unwrap();
  }

  #[test]
  fn test_single_file_layout() {
    let mut buf = Vec::new();
    dump_string("hi", &mut buf).unwrap();
    // magic (24), four one-word tags (16 each), contents (16), `)' (16)
    assert_eq!(buf.len(), 120);
    assert_eq!(&buf[..8], &13u64.to_le_bytes());
  }

  #[test]
  fn test_restore_reproduces_tree() {
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("src");
    sample_tree(&src);

    let mut archive = Vec::new();
    dump_path(&src, &mut archive).unwrap();

    let dst = tmp.path().join("dst");
    restore_path(&dst, archive.as_slice()).unwrap();

    assert_eq!(fs::read_to_string(dst.join("README")).unwrap(), "compiler");
    assert_eq!(fs::read_link(dst.join("cc")).unwrap(), Path::new("bin/cc"));
    let mode = fs::metadata(dst.join("bin/cc")).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o555);

    let (h1, n1) = hash_path(&src, HashType::SHA256).unwrap();
    let (h2, n2) = hash_path(&dst, HashType::SHA256).unwrap();
    assert_eq!((h1, n1), (h2, n2));
    assert_eq!(n1, archive.len());
  }

  #[test]
  fn test_hash_ignores_mode_noise() {
    let tmp = tempfile::tempdir().unwrap();
    let a = tmp.path().join("a");
    fs::create_dir(&a).unwrap();
    fs::write(a.join("f"), "x").unwrap();
    let (before, _) = hash_path(&a, HashType::SHA256).unwrap();
    fs::set_permissions(a.join("f"), fs::Permissions::from_mode(0o600)).unwrap();
    let (after, _) = hash_path(&a, HashType::SHA256).unwrap();
    assert_eq!(before, after);

    fs::set_permissions(a.join("f"), fs::Permissions::from_mode(0o700)).unwrap();
    let (exec, _) = hash_path(&a, HashType::SHA256).unwrap();
    assert_ne!(before, exec);
  }

  #[test]
  fn test_rejects_corrupt_archive() {
    let tmp = tempfile::tempdir().unwrap();
    let mut archive = Vec::new();
    dump_string("hello", &mut archive).unwrap();
    archive[8] = b'X';
    assert!(restore_path(tmp.path().join("out"), archive.as_slice()).is_err());

    let mut truncated = Vec::new();
    dump_string("hello", &mut truncated).unwrap();
    truncated.truncate(truncated.len() - 12);
    assert!(restore_path(tmp.path().join("out2"), truncated.as_slice()).is_err());
  }
}
