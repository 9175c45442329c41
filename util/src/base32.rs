//! Nix-flavoured base-32: a 32 character alphabet without `e`, `o`, `u` and
//! `t`, written least significant digit last.

use crate::*;

const ALPHABET: &[u8; 32] = b"0123456789abcdfghijklmnpqrsvwxyz";

lazy_static! {
  static ref DIGITS: [u8; 256] = {
    let mut xs = [0xffu8; 256];
    for (n, c) in ALPHABET.iter().enumerate() {
      xs[*c as usize] = n as u8;
    }
    xs
  };
}

pub fn is_base32(c: u8) -> bool {
  DIGITS[c as usize] != 0xff
}

pub fn encoded_len(bytes: usize) -> usize {
  if bytes == 0 {
    0
  } else {
    (bytes * 8 - 1) / 5 + 1
  }
}

fn decoded_len(chars: usize) -> usize {
  chars * 5 / 8
}

pub fn encode(input: &[u8]) -> String {
  let len = encoded_len(input.len());
  let mut out = String::with_capacity(len);
  for n in (0..len).rev() {
    let bit = n * 5;
    let (i, j) = (bit / 8, bit % 8);
    let lo = u16::from(input[i]) >> j;
    let hi = input.get(i + 1).map_or(0, |&b| u16::from(b) << (8 - j));
    out.push(ALPHABET[((lo | hi) & 0x1f) as usize] as char);
  }
  out
}

pub fn decode(input: &[u8]) -> Result<Vec<u8>> {
  let size = decoded_len(input.len());
  ensure!(
    encoded_len(size) == input.len(),
    "base-32 string of length {} is not a valid encoding",
    input.len()
  );

  let mut out = vec![0u8; size];
  for (n, &c) in input.iter().rev().enumerate() {
    let digit = DIGITS[c as usize];
    ensure!(digit != 0xff, "invalid base-32 character `{}'", c as char);
    let bit = n * 5;
    let (i, j) = (bit / 8, bit % 8);
    let wide = u16::from(digit) << j;
    out[i] |= wide as u8;
    let carry = (wide >> 8) as u8;
    if i + 1 < size {
      out[i + 1] |= carry;
    } else {
      ensure!(carry == 0, "base-32 string has trailing bits set");
    }
  }
  Ok(out)
}
