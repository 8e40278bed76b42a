//! failmail-server
//!
//! The running pieces of failmail: the SMTP receiver (listener + sessions),
//! the writer that persists incoming messages, the summarizer that batches
//! them into digests, the sender that relays digests upstream, and the
//! runtime that wires them together with graceful shutdown and
//! socket-inheriting reload.

#![doc(html_no_source)]
#![deny(missing_docs)]
//
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
//
#![allow(clippy::doc_markdown)]
#![allow(clippy::use_self)]

mod channel_message;
mod reload;
mod render;
mod sender;
mod server;
mod signals;
mod summarizer;
mod upstream;
mod writer;

/// SMTP session handling for one client connection.
pub mod receiver;

pub use channel_message::{SendRequest, StorageRequest};
pub use reload::{reload_args, respawn};
pub use render::SummaryRenderer;
pub use sender::start as start_sender;
pub use server::Listener;
pub use signals::{handle_signals, TerminationRequest};
pub use summarizer::{start as start_summarizer, MessageBuffer, RecipientKey};
pub use upstream::{build_upstream, DebugUpstream, MaildirUpstream, MultiUpstream, SmtpUpstream, Upstream};
pub use writer::start as start_writer;

mod runtime;
pub use runtime::{socket_bind_anyhow, socket_from_fd, start_runtime};
