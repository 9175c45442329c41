//! `#[derive(Settings)]`: accessors, defaults and environment overrides for a
//! struct of configuration values.
//!
//! ```ignore
//! #[derive(Settings)]
//! pub struct Settings {
//!   /// Where things go.
//!   #[setting(get = "deref", default_fn = "default_dir", env = "APP_DIR")]
//!   dir: PathBuf,
//!   #[setting(env = "APP_JOBS")]
//!   jobs: usize,
//! }
//! ```
//!
//! generates `dir() -> &Path`, `jobs() -> usize`, chaining `set_*` setters, a
//! `Default` impl, `from_env()`, `from_lookup(..)` and `ENV_VARS`.

use darling::{ast::Data, FromDeriveInput, FromField, FromMeta, ToTokens};
use proc_macro2::TokenStream;
use quote::{format_ident, quote};
use syn::{parse_macro_input, DeriveInput, Ident, Lit, Path, Type};

extern crate proc_macro;

#[derive(FromDeriveInput)]
#[darling(supports(struct_named))]
struct SettingsInput {
  ident: Ident,
  data: Data<(), Field>,
}

/// How a getter hands out its field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
  /// By value; the field must be `Copy`.
  Value,
  /// `&<T as Deref>::Target`, e.g. `&Path` for a `PathBuf`.
  Deref,
  Ref,
}

impl Default for Access {
  fn default() -> Self {
    Self::Value
  }
}

impl FromMeta for Access {
  fn from_string(value: &str) -> darling::Result<Self> {
    match value {
      "copy" => Ok(Self::Value),
      "deref" => Ok(Self::Deref),
      "ref" => Ok(Self::Ref),
      x => Err(darling::Error::unknown_value(x)),
    }
  }
}

#[derive(FromField)]
#[darling(attributes(setting), forward_attrs(doc))]
struct Field {
  ident: Option<Ident>,
  ty: Type,
  attrs: Vec<syn::Attribute>,
  #[darling(default)]
  get: Access,
  /// No getter; the value is only reachable through the struct's own code.
  #[darling(default)]
  hidden: bool,
  #[darling(default)]
  default_fn: Option<Path>,
  #[darling(default)]
  default: Option<Lit>,
  #[darling(default)]
  env: Option<String>,
}

impl Field {
  fn name(&self) -> &Ident {
    // named structs only, see `supports` above
    self.ident.as_ref().expect("named field")
  }

  fn docs(&self) -> impl Iterator<Item = &syn::Attribute> {
    self.attrs.iter().filter(|a| a.path.is_ident("doc"))
  }

  fn getter(&self) -> TokenStream {
    if self.hidden {
      return TokenStream::new();
    }
    let (name, ty) = (self.name(), &self.ty);
    let docs = self.docs();
    let (ret, body) = match self.get {
      Access::Value => (ty.to_token_stream(), quote! { self.#name }),
      Access::Deref => (
        quote! { &<#ty as ::core::ops::Deref>::Target },
        quote! { &self.#name },
      ),
      Access::Ref => (quote! { &#ty }, quote! { &self.#name }),
    };
    quote! {
      #(#docs)*
      pub fn #name(&self) -> #ret {
        #body
      }
    }
  }

  fn setter(&self) -> TokenStream {
    let (name, ty) = (self.name(), &self.ty);
    let setter = format_ident!("set_{}", name);
    quote! {
      pub fn #setter(&mut self, value: #ty) -> &mut Self {
        self.#name = value;
        self
      }
    }
  }

  fn initializer(&self) -> TokenStream {
    let (name, ty) = (self.name(), &self.ty);
    match (&self.default, &self.default_fn) {
      (Some(lit), _) => quote! { #name: <#ty>::from(#lit) },
      (None, Some(f)) => quote! { #name: #f() },
      (None, None) => quote! { #name: ::core::default::Default::default() },
    }
  }

  fn override_from(&self) -> TokenStream {
    let var = match &self.env {
      Some(var) => var,
      None => return TokenStream::new(),
    };
    let name = self.name();
    quote! {
      if let ::core::option::Option::Some(raw) = lookup(#var) {
        this.#name = raw
          .parse()
          .map_err(|e| ::std::format!("invalid value `{}' for {}: {}", raw, #var, e))?;
      }
    }
  }
}

#[proc_macro_derive(Settings, attributes(setting))]
pub fn derive_settings(input: proc_macro::TokenStream) -> proc_macro::TokenStream {
  let input = parse_macro_input!(input as DeriveInput);
  match expand(&input) {
    Ok(tokens) => tokens.into(),
    Err(e) => e.write_errors().into(),
  }
}

fn expand(input: &DeriveInput) -> darling::Result<TokenStream> {
  let SettingsInput { ident, data } = SettingsInput::from_derive_input(input)?;
  let fields = data
    .take_struct()
    .ok_or_else(|| darling::Error::unsupported_shape("enum"))?
    .fields;

  let getters = fields.iter().map(Field::getter);
  let setters = fields.iter().map(Field::setter);
  let initializers = fields.iter().map(Field::initializer);
  let overrides = fields.iter().map(Field::override_from);
  let vars = fields.iter().filter_map(|f| f.env.as_deref());

  Ok(quote! {
    impl #ident {
      /// Every environment variable that overrides a setting.
      pub const ENV_VARS: &'static [&'static str] = &[#(#vars),*];

      #(#getters)*

      #(#setters)*

      /// Defaults, overridden by whatever the process environment sets.
      pub fn from_env() -> ::std::result::Result<Self, ::std::string::String> {
        Self::from_lookup(|var| ::std::env::var(var).ok())
      }

      /// Defaults, overridden by the variables `lookup` knows about.
      pub fn from_lookup<F>(lookup: F) -> ::std::result::Result<Self, ::std::string::String>
      where
        F: Fn(&str) -> ::std::option::Option<::std::string::String>,
      {
        let mut this = <Self as ::core::default::Default>::default();
        #(#overrides)*
        ::std::result::Result::Ok(this)
      }
    }

    impl ::core::default::Default for #ident {
      fn default() -> Self {
        Self {
          #(#initializers),*
        }
      }
    }
  })
}
