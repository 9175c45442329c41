use crate::prelude::*;
use std::{
  collections::BTreeSet,
  fmt::{self, Display},
};

impl Derivation {
  /// The canonical ATerm serialization. With `mask_outputs` the output path
  /// and `$out` are left empty, which is the form the id is computed from.
  pub fn print<'drv, S: Store + ?Sized>(&'drv self, store: &'drv S, mask_outputs: bool) -> Print<'drv, S> {
    Print {
      store,
      drv: self,
      mask_outputs,
    }
  }
}

struct Unquote<T>(T);

impl<T: Display> Display for Unquote<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "\"{}\"", self.0)
  }
}

struct Quote<T>(T);

impl<T: Display> Display for Quote<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str("\"")?;
    for ch in self.0.to_string().chars() {
      match ch {
        '\"' | '\\' => write!(f, "\\{}", ch)?,
        '\n' => write!(f, "\\n")?,
        '\r' => write!(f, "\\r")?,
        '\t' => write!(f, "\\t")?,
        _ => write!(f, "{}", ch)?,
      }
    }
    f.write_str("\"")
  }
}

pub struct Print<'drv, S: Store + ?Sized + 'drv> {
  store: &'drv S,
  drv: &'drv Derivation,
  mask_outputs: bool,
}

macro_rules! write_strs {
  ($fmt:expr, $items:expr) => {{
    $fmt.write_str("[")?;
    for (ix, item) in $items.iter().enumerate() {
      if ix > 0 {
        $fmt.write_str(",")?;
      }
      write!($fmt, "{}", Unquote(item))?;
    }
    $fmt.write_str("]")
  }};
}

impl<'drv, S: Store + ?Sized + 'drv> Display for Print<'drv, S> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str("Derive([(\"out\"")?;

    let path = if self.mask_outputs {
      String::new()
    } else {
      self.store.print_store_path(self.drv.out_path())
    };
    match &self.drv.output {
      Output::InputAddressed(_) => write!(f, r#",{},"","""#, Unquote(path))?,
      Output::Fixed(hash, _) => write!(
        f,
        r#",{path},{method},{hash}"#,
        path = Unquote(path),
        method = Unquote(hash.method_algo()),
        hash = Unquote(hash.hash.encode(Encoding::Base16))
      )?,
    }

    f.write_str(")],[")?;

    for (ix, path) in self.drv.input_derivations.keys().enumerate() {
      if ix > 0 {
        f.write_str(",")?;
      }
      write!(
        f,
        r#"({},["out"])"#,
        Unquote(self.store.print_store_path(path))
      )?;
    }

    f.write_str("],")?;

    let ordered_paths = self
      .drv
      .input_sources
      .iter()
      .map(|x| self.store.print_store_path(x))
      .collect::<BTreeSet<_>>();

    write_strs!(f, ordered_paths)?;

    write!(
      f,
      ",{},{},[",
      Quote(&self.drv.platform),
      Quote(&self.drv.builder)
    )?;

    for (ix, arg) in self.drv.args.iter().enumerate() {
      if ix > 0 {
        f.write_str(",")?;
      }
      write!(f, "{}", Quote(arg))?;
    }
    f.write_str("],[")?;

    for (ix, (key, val)) in self.drv.env.iter().enumerate() {
      if ix > 0 {
        f.write_str(",")?;
      }
      write!(
        f,
        "({},{})",
        Quote(key),
        Quote(if self.mask_outputs && key == "out" {
          ""
        } else {
          val
        })
      )?;
    }

    f.write_str("])")
  }
}
