//! failmail-config
//!
//! The resolved configuration of a failmail process. The binary loads a TOML
//! file (or defaults) into [`Config`] once at startup; the core never
//! reparses options at runtime.

#![doc(html_no_source)]
#![deny(missing_docs)]
//
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
//
#![allow(clippy::doc_markdown)]
#![allow(clippy::use_self)]

mod config;
mod default;
mod rustls_helper;

pub use config::{
    field, Config, Credentials,
};
pub use default::hostname;
pub use rustls_helper::get_rustls_config;
