//! failmail-store
//!
//! Durable storage of received messages between SMTP ingest and
//! summarization: an on-disk maildir-backed store and an in-memory store
//! behind a common trait.

#![doc(html_no_source)]
#![deny(missing_docs)]
//
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
//
#![allow(clippy::doc_markdown)]
#![allow(clippy::use_self)]

mod disk;
mod maildir;
mod memory;

pub use disk::DiskStore;
pub use maildir::{Maildir, MaildirIdentity};
pub use memory::MemoryStore;

use failmail_common::message::ReceivedMessage;

/// Identifies a message within a store, for the store's lifetime.
///
/// Opaque to callers: ids are returned by [`MessageStore::add`] and fed back
/// to [`MessageStore::remove`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageId {
    /// Monotonic counter, used by the in-memory store.
    Sequence(u64),
    /// Maildir file name, used by the on-disk store.
    Name(String),
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sequence(n) => write!(f, "{n}"),
            Self::Name(name) => f.write_str(name),
        }
    }
}

/// A [`ReceivedMessage`] with its store identity and persisted receive time.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    /// Store-assigned identifier.
    pub id: MessageId,
    /// When the writer persisted the message.
    pub received: std::time::SystemTime,
    /// The message itself.
    pub message: std::sync::Arc<ReceivedMessage>,
}

/// Storage and limited retrieval of received messages, shared between the
/// writer task (sole adder) and the summarizer (sole remover).
#[async_trait::async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a message with its receive time. The message is durable once
    /// this returns.
    ///
    /// # Errors
    ///
    /// * the backing medium rejected the write
    async fn add(
        &self,
        now: std::time::SystemTime,
        message: ReceivedMessage,
    ) -> anyhow::Result<MessageId>;

    /// Remove a message. Removing an id that is already gone is not an
    /// error.
    ///
    /// # Errors
    ///
    /// * the backing medium rejected the removal
    async fn remove(&self, id: &MessageId) -> anyhow::Result<()>;

    /// Every stored message whose receive time is strictly greater than
    /// `after`, ordered by receive time. Unreadable entries are reported in
    /// the second list without failing the whole call.
    async fn messages_newer_than(
        &self,
        after: std::time::SystemTime,
    ) -> (Vec<StoredMessage>, Vec<anyhow::Error>);
}
