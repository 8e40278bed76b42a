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
use crate::{MessageId, MessageStore, StoredMessage};
use failmail_common::message::ReceivedMessage;

/// A [`MessageStore`] that holds received messages in memory, newest first.
/// Nothing survives a restart; useful for tests and ephemeral deployments.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: std::sync::Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    /// Sorted newest-first by receive time.
    messages: Vec<StoredMessage>,
    counter: u64,
}

impl MemoryStore {
    ///
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl MessageStore for MemoryStore {
    async fn add(
        &self,
        now: std::time::SystemTime,
        message: ReceivedMessage,
    ) -> anyhow::Result<MessageId> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");

        let id = MessageId::Sequence(inner.counter);
        inner.counter += 1;

        let stored = StoredMessage {
            id: id.clone(),
            received: now,
            message: std::sync::Arc::new(message),
        };
        let at = inner
            .messages
            .partition_point(|m| m.received > stored.received);
        inner.messages.insert(at, stored);
        Ok(id)
    }

    async fn remove(&self, id: &MessageId) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        inner.messages.retain(|m| &m.id != id);
        Ok(())
    }

    async fn messages_newer_than(
        &self,
        after: std::time::SystemTime,
    ) -> (Vec<StoredMessage>, Vec<anyhow::Error>) {
        let inner = self.inner.lock().expect("store mutex poisoned");

        let boundary = inner
            .messages
            .partition_point(|m| m.received > after);
        let mut result = inner.messages[..boundary].to_vec();
        result.reverse();
        (result, Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn received(subject: &str) -> ReceivedMessage {
        ReceivedMessage::new(
            "<a@x>".to_string(),
            vec!["<b@y>".to_string()],
            None,
            format!("Subject: {subject}\r\n\r\nbody\r\n"),
        )
        .unwrap()
    }

    fn at(secs: u64) -> std::time::SystemTime {
        std::time::SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(secs)
    }

    #[tokio::test]
    async fn add_then_remove_restores_the_initial_store() {
        let store = MemoryStore::new();
        let id = store.add(at(100), received("one")).await.unwrap();

        store.remove(&id).await.unwrap();
        let (messages, errors) = store.messages_newer_than(at(0)).await;
        assert!(messages.is_empty());
        assert!(errors.is_empty());

        // removal is idempotent
        store.remove(&id).await.unwrap();
    }

    #[tokio::test]
    async fn newer_than_is_strict_and_time_ordered() {
        let store = MemoryStore::new();
        // inserted out of order on purpose
        store.add(at(300), received("late")).await.unwrap();
        store.add(at(100), received("early")).await.unwrap();
        store.add(at(200), received("middle")).await.unwrap();

        let (messages, _) = store.messages_newer_than(at(100)).await;
        assert_eq!(
            messages
                .iter()
                .map(|m| m.message.mail.subject().to_string())
                .collect::<Vec<_>>(),
            ["middle", "late"]
        );

        let (all, _) = store.messages_newer_than(at(0)).await;
        assert_eq!(all.len(), 3);
        assert!(all.windows(2).all(|w| w[0].received <= w[1].received));
    }

    #[tokio::test]
    async fn ids_are_monotonic() {
        let store = MemoryStore::new();
        let first = store.add(at(1), received("a")).await.unwrap();
        let second = store.add(at(2), received("b")).await.unwrap();
        assert!(matches!(
            (first, second),
            (MessageId::Sequence(a), MessageId::Sequence(b)) if b > a
        ));
    }
}
