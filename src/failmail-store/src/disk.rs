/*
 * Failmail SMTP buffering relay
 * Copyright (C) 2022 the Failmail developers
 *
 * This program is free software: you can redistribute it and/or modify it under
 * the terms of the GNU General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or any later version.
 *
 * This program is distributed in the hope that it will be useful, but WITHOUT
 * ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
 * FOR A PARTICULAR PURPOSE.  See the GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License along with
 * this program. If not, see https://www.gnu.org/licenses/.
 *
*/
use crate::{
    maildir::{remove_if_present, Maildir},
    MessageId, MessageStore, StoredMessage,
};
use anyhow::Context;
use failmail_common::{libc_abstraction::set_file_times, message::ReceivedMessage};

/// The SMTP envelope of a stored message, serialized next to it. The
/// metadata file's mtime records the receive time.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
struct DiskMetadata {
    envelope_from: String,
    envelope_to: Vec<String>,
    redirected_to: Option<Vec<String>>,
}

/// A [`MessageStore`] backed by a [`Maildir`] on disk.
///
/// The content file is written (and fsynced) before the metadata file, and
/// the metadata file is deleted before the content file: the `.meta/`
/// listing is therefore authoritative, and a crash can only ever leave an
/// orphan content file behind. Orphans are ignored and never collected.
#[derive(Debug)]
pub struct DiskStore {
    maildir: Maildir,
}

impl DiskStore {
    /// Open a store over an existing maildir. Messages already present are
    /// picked up by the next [`MessageStore::messages_newer_than`] call, so
    /// a restart resumes where the previous process stopped.
    #[must_use]
    pub const fn new(maildir: Maildir) -> Self {
        Self { maildir }
    }

    fn write_metadata(
        &self,
        name: &str,
        now: std::time::SystemTime,
        metadata: &DiskMetadata,
    ) -> anyhow::Result<()> {
        let path = self.maildir.meta_path(name);
        std::fs::write(&path, serde_json::to_vec(metadata)?)
            .with_context(|| format!("could not write `{}`", path.display()))?;
        set_file_times(&path, now)
            .with_context(|| format!("could not stamp `{}`", path.display()))
    }

    fn read_message(&self, name: &str) -> anyhow::Result<ReceivedMessage> {
        let meta_path = self.maildir.meta_path(name);
        let metadata = serde_json::from_slice::<DiskMetadata>(
            &std::fs::read(&meta_path)
                .with_context(|| format!("could not read `{}`", meta_path.display()))?,
        )
        .with_context(|| format!("could not deserialize `{}`", meta_path.display()))?;

        let data = String::from_utf8(self.maildir.read_bytes(name)?)
            .with_context(|| format!("message `{name}` is not valid utf-8"))?;

        ReceivedMessage::new(
            metadata.envelope_from,
            metadata.envelope_to,
            metadata.redirected_to,
            data,
        )
        .with_context(|| format!("message `{name}` does not parse"))
    }
}

#[async_trait::async_trait]
impl MessageStore for DiskStore {
    async fn add(
        &self,
        now: std::time::SystemTime,
        message: ReceivedMessage,
    ) -> anyhow::Result<MessageId> {
        // content first, metadata last: a message only becomes visible once
        // both files exist
        let name = self.maildir.write(now, message.data.as_bytes())?;

        self.write_metadata(
            &name,
            now,
            &DiskMetadata {
                envelope_from: message.envelope_from.clone(),
                envelope_to: message.envelope_to.clone(),
                redirected_to: message.redirected_to.clone(),
            },
        )?;

        tracing::debug!(target: "store", name, "Message persisted.");
        Ok(MessageId::Name(name))
    }

    async fn remove(&self, id: &MessageId) -> anyhow::Result<()> {
        let MessageId::Name(name) = id else {
            anyhow::bail!("not a disk store id: {id}")
        };

        // metadata first, so a partial removal hides the message
        remove_if_present(&self.maildir.meta_path(name))?;
        self.maildir.remove(name)?;

        tracing::debug!(target: "store", name, "Message removed.");
        Ok(())
    }

    async fn messages_newer_than(
        &self,
        after: std::time::SystemTime,
    ) -> (Vec<StoredMessage>, Vec<anyhow::Error>) {
        let mut entries = match self.maildir.list_meta() {
            Ok(entries) => entries,
            Err(e) => return (Vec::new(), vec![e]),
        };
        entries.sort_by_key(|(_, modified)| *modified);

        let mut result = Vec::new();
        let mut errors = Vec::new();
        for (name, modified) in entries {
            if modified <= after {
                continue;
            }
            match self.read_message(&name) {
                Ok(message) => result.push(StoredMessage {
                    id: MessageId::Name(name),
                    received: modified,
                    message: std::sync::Arc::new(message),
                }),
                Err(e) => errors.push(e),
            }
        }
        (result, errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MaildirIdentity;
    use pretty_assertions::assert_eq;

    fn maildir(root: &std::path::Path) -> Maildir {
        Maildir::create(
            root,
            MaildirIdentity {
                host: "testhost".to_string(),
                pid: 7,
            },
        )
        .unwrap()
    }

    fn received() -> ReceivedMessage {
        ReceivedMessage::new(
            "<test@example.com>".to_string(),
            vec!["<test@example.com>".to_string()],
            None,
            "From: test@example.com\r\nTo: test@example.com\r\nSubject: test\r\n\r\ntest\r\n"
                .to_string(),
        )
        .unwrap()
    }

    fn at(secs: u64) -> std::time::SystemTime {
        std::time::SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(secs)
    }

    #[tokio::test]
    async fn survives_a_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let now = at(1_393_650_000);

        let store = DiskStore::new(maildir(dir.path()));
        store.add(now, received()).await.unwrap();

        // a fresh store over the same directory sees the message, as after
        // a crash and restart
        let reopened = DiskStore::new(maildir(dir.path()));
        let (messages, errors) = reopened.messages_newer_than(at(0)).await;
        assert!(errors.is_empty());
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].received, now);
        assert_eq!(messages[0].message.mail.subject(), "test");
        assert_eq!(messages[0].message.envelope_from, "<test@example.com>");
    }

    #[tokio::test]
    async fn newer_than_is_strict() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::new(maildir(dir.path()));
        let now = at(1_393_650_000);
        store.add(now, received()).await.unwrap();

        assert_eq!(store.messages_newer_than(now).await.0.len(), 0);
        assert_eq!(
            store
                .messages_newer_than(now - std::time::Duration::from_secs(1))
                .await
                .0
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn remove_deletes_both_files_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::new(maildir(dir.path()));
        let id = store.add(at(100), received()).await.unwrap();

        store.remove(&id).await.unwrap();
        store.remove(&id).await.unwrap();

        let (messages, errors) = store.messages_newer_than(at(0)).await;
        assert!(messages.is_empty());
        assert!(errors.is_empty());

        let MessageId::Name(name) = &id else { unreachable!() };
        assert!(!store.maildir.content_path(name).exists());
        assert!(!store.maildir.meta_path(name).exists());
    }

    #[tokio::test]
    async fn orphan_content_files_are_invisible() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::new(maildir(dir.path()));
        let id = store.add(at(100), received()).await.unwrap();

        // simulate a crash between the two removal steps
        let MessageId::Name(name) = &id else { unreachable!() };
        std::fs::remove_file(store.maildir.meta_path(name)).unwrap();

        let (messages, errors) = store.messages_newer_than(at(0)).await;
        assert!(messages.is_empty());
        assert!(errors.is_empty());
    }

    #[tokio::test]
    async fn unreadable_metadata_is_reported_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::new(maildir(dir.path()));
        store.add(at(100), received()).await.unwrap();
        store.add(at(200), received()).await.unwrap();

        // corrupt the first message's metadata
        let (entries, _) = store.messages_newer_than(at(0)).await;
        let MessageId::Name(first) = &entries[0].id else { unreachable!() };
        std::fs::write(store.maildir.meta_path(first), b"not json").unwrap();

        let (messages, errors) = store.messages_newer_than(at(0)).await;
        assert_eq!(messages.len(), 1);
        assert_eq!(errors.len(), 1);
    }
}
