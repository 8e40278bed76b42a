//! failmail executable

#![doc(html_no_source)]
#![deny(missing_docs)]
#![forbid(unsafe_code)]
//
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
//
#![allow(clippy::doc_markdown)]

mod args;

pub use args::{Args, Commands};

/// Logging initialization for the binary.
pub mod tracing_subscriber;
