//! failmail-common
//!
//! Shared data model of the failmail SMTP buffering relay: the SMTP grammar,
//! reply formatting, the received-message representation, summary compaction
//! and the small helpers (address normalization, rate counting) used by the
//! server crates.

#![doc(html_no_source)]
#![deny(missing_docs)]
//
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
//
#![allow(clippy::doc_markdown)]
#![allow(clippy::use_self)]

mod address;
mod event;
mod keys;
mod rate;
mod reply;
mod summary;

/// Abstraction over the libc calls used for socket inheritance.
pub mod libc_abstraction;
/// RFC822 message parsing and the received-message representation.
pub mod message;

pub use address::{normalize_address, AddressRewriter};
pub use event::{Event, ParseCommandError};
pub use keys::KeyExpr;
pub use rate::RateCounter;
pub use reply::Reply;
pub use summary::{
    compact, plural, summarize, OutgoingMessage, SummaryMessage, UniqueMessage,
};
