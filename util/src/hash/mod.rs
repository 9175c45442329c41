use crate::*;
use sha2::{Digest, Sha256, Sha512};
use std::{
  fmt::{self, Debug, Display},
  hash,
  ops::Deref,
  str::FromStr,
};

mod sink;

pub use sink::Sink;

const MAX_HASH_BYTES: usize = 64;

#[derive(Clone, Copy)]
pub struct Hash {
  data: [u8; MAX_HASH_BYTES],
  len: usize,
  ty: HashType,
}

impl Hash {
  pub fn size(&self) -> usize {
    self.len
  }

  pub fn ty(&self) -> HashType {
    self.ty
  }

  #[inline]
  pub fn as_bytes(&self) -> &[u8] {
    &self.data[..self.len]
  }

  pub fn hash<S: AsRef<[u8]>>(bytes: S, ty: HashType) -> Self {
    let mut c = Context::new(ty);
    c.input(bytes.as_ref());
    c.finish().0
  }

  pub fn from_bytes(bytes: &[u8], ty: HashType) -> Result<Self> {
    ensure!(
      bytes.len() == ty.size(),
      "a {} hash must be {} bytes long, got {}",
      ty,
      ty.size(),
      bytes.len()
    );
    let mut data = [0; MAX_HASH_BYTES];
    data[..bytes.len()].copy_from_slice(bytes);
    Ok(Self {
      data,
      len: bytes.len(),
      ty,
    })
  }

  /// Parses a hash that may carry its own type (`sha256:…`, `sha256-…`), or
  /// a bare digest when `ty` is known from elsewhere. If both are present
  /// they must agree.
  pub fn parse(s: &str, ty: Option<HashType>) -> Result<Self> {
    ensure!(!s.is_empty(), "empty hash");
    match ty {
      Some(ht) => {
        if s.contains(|x| x == ':' || x == '-') {
          let h = Self::decode(s)?;
          ensure!(h.ty() == ht, "expected hash type {}, got {}", ht, h.ty());
          Ok(h)
        } else {
          Self::decode_with_type(s, ht, false)
        }
      }
      None => Self::decode(s),
    }
  }

  pub fn encode(&self, encoding: Encoding) -> String {
    if encoding == Encoding::SRI {
      return self.encode_with_type(encoding);
    }
    let mut s = String::new();
    self.encode_impl(encoding, &mut s);
    s
  }

  pub fn encode_with_type(&self, encoding: Encoding) -> String {
    let mut s = self.ty.to_string();
    if encoding == Encoding::SRI {
      s.push('-');
    } else {
      s.push(':');
    }
    self.encode_impl(encoding, &mut s);
    s
  }

  fn encode_impl(&self, encoding: Encoding, buf: &mut String) {
    let bytes = match encoding {
      Encoding::Base16 => {
        let mut bytes = vec![0; len_base16(self.len)];
        // the output buffer is sized exactly, conversion cannot fail
        let _ = binascii::bin2hex(self.as_bytes(), &mut bytes);
        bytes
      }
      Encoding::Base32 => base32::encode(self.as_bytes()).into_bytes(),
      Encoding::Base64 | Encoding::SRI => {
        base64::encode_config(self.as_bytes(), base64::STANDARD).into_bytes()
      }
    };
    buf.extend(bytes.iter().map(|&b| b as char));
  }

  pub fn decode<S: AsRef<str>>(input: S) -> Result<Self> {
    let input = input.as_ref();
    if let Some((ty, rest)) = input.split_once(':') {
      Self::decode_with_type(rest, ty.parse()?, false)
    } else if let Some((ty, rest)) = input.split_once('-') {
      Self::decode_with_type(rest, ty.parse()?, true)
    } else {
      bail!("untyped hash `{}'", input)
    }
  }

  pub fn decode_with_type(input: &str, ty: HashType, sri: bool) -> Result<Self> {
    let size = ty.size();
    let bytes = if !sri && input.len() == len_base16(size) {
      let mut bytes = vec![0; size];
      binascii::hex2bin(input.as_bytes(), &mut bytes)
        .map_err(|e| anyhow!("invalid base-16 hash `{}': {:?}", input, e))?;
      bytes
    } else if !sri && input.len() == len_base32(size) {
      base32::decode(input.as_bytes())?
    } else if sri || input.len() == len_base64(size) {
      ensure!(
        input.len() == len_base64(size),
        "SRI hash `{}' has the wrong length for {}",
        input,
        ty
      );
      base64::decode_config(input, base64::STANDARD)?
    } else {
      bail!("hash `{}' has the wrong length for {}", input, ty)
    };
    Self::from_bytes(&bytes, ty)
  }

  /// Folds the hash into `new_size` bytes by xor-ing the overflow back in.
  pub fn truncate(&self, new_size: usize) -> Self {
    if new_size >= self.len {
      return *self;
    }
    let mut data = [0; MAX_HASH_BYTES];
    for i in 0..self.len {
      data[i % new_size] ^= self.data[i];
    }
    Self {
      len: new_size,
      data,
      ty: self.ty,
    }
  }
}

impl PartialEq for Hash {
  fn eq(&self, other: &Self) -> bool {
    self.ty == other.ty && self.as_bytes() == other.as_bytes()
  }
}

impl Eq for Hash {}

impl PartialOrd for Hash {
  fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
    Some(self.cmp(other))
  }
}

impl Ord for Hash {
  fn cmp(&self, other: &Self) -> std::cmp::Ordering {
    (self.ty as u8, self.as_bytes()).cmp(&(other.ty as u8, other.as_bytes()))
  }
}

impl hash::Hash for Hash {
  fn hash<H: hash::Hasher>(&self, state: &mut H) {
    self.as_bytes().hash(state)
  }
}

impl Deref for Hash {
  type Target = [u8];

  fn deref(&self) -> &Self::Target {
    self.as_bytes()
  }
}

impl Debug for Hash {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_tuple("Hash")
      .field(&self.encode_with_type(Encoding::Base32))
      .finish()
  }
}

impl Display for Hash {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.encode_with_type(Encoding::Base32))
  }
}

impl FromStr for Hash {
  type Err = anyhow::Error;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Self::decode(s)
  }
}

fn len_base16(size: usize) -> usize {
  size * 2
}

fn len_base32(size: usize) -> usize {
  (size * 8 - 1) / 5 + 1
}

fn len_base64(size: usize) -> usize {
  ((4 * size / 3) + 3) & !3
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Display)]
pub enum HashType {
  #[display(fmt = "sha256")]
  SHA256,
  #[display(fmt = "sha512")]
  SHA512,
}

impl HashType {
  pub fn size(self) -> usize {
    match self {
      Self::SHA256 => 32,
      Self::SHA512 => 64,
    }
  }
}

impl FromStr for HashType {
  type Err = anyhow::Error;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Ok(match s {
      "sha256" => Self::SHA256,
      "sha512" => Self::SHA512,
      "md5" | "sha1" => bail!("hash type `{}' is too weak for content verification", s),
      x => bail!("invalid hash type `{}'", x),
    })
  }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Encoding {
  Base64,
  Base32,
  Base16,
  SRI,
}

/// Incremental hasher that also counts the bytes it has seen.
#[derive(Clone)]
pub struct Context {
  inner: Inner,
  len: usize,
}

#[derive(Clone)]
enum Inner {
  Sha256(Sha256),
  Sha512(Sha512),
}

impl Context {
  pub fn new(ty: HashType) -> Self {
    let inner = match ty {
      HashType::SHA256 => Inner::Sha256(Sha256::new()),
      HashType::SHA512 => Inner::Sha512(Sha512::new()),
    };
    Self { inner, len: 0 }
  }

  pub fn input(&mut self, bytes: &[u8]) {
    self.len += bytes.len();
    match &mut self.inner {
      Inner::Sha256(h) => h.update(bytes),
      Inner::Sha512(h) => h.update(bytes),
    }
  }

  pub fn finish(self) -> (Hash, usize) {
    let mut data = [0; MAX_HASH_BYTES];
    let (ty, len) = match self.inner {
      Inner::Sha256(h) => {
        data[..32].copy_from_slice(&h.finalize());
        (HashType::SHA256, 32)
      }
      Inner::Sha512(h) => {
        data.copy_from_slice(&h.finalize());
        (HashType::SHA512, 64)
      }
    };
    (Hash { data, len, ty }, self.len)
  }
}
