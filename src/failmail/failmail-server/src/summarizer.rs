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
    channel_message::SendRequest, render::SummaryRenderer, signals::TerminationRequest,
};
use failmail_common::{normalize_address, summarize, KeyExpr};
use failmail_store::{MessageStore, StoredMessage};

/// One batch bucket: `(batch key, normalized recipient)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecipientKey {
    /// Result of the batch expression over the message headers.
    pub key: String,
    /// Normalized recipient address.
    pub recipient: String,
}

#[derive(Debug)]
struct Batch {
    first: std::time::SystemTime,
    last: std::time::SystemTime,
    messages: Vec<StoredMessage>,
}

/// The time-windowed grouping engine.
///
/// Folds stored messages into per-recipient batches and flushes a batch as
/// one digest when it has been idle for `soft_limit` or alive for
/// `hard_limit`. Current time is always passed in, so tests drive the
/// clock.
pub struct MessageBuffer {
    soft_limit: std::time::Duration,
    hard_limit: std::time::Duration,
    batch: KeyExpr,
    group: KeyExpr,
    from: String,
    renderer: SummaryRenderer,
    store: std::sync::Arc<dyn MessageStore>,
    batches: std::collections::HashMap<RecipientKey, Batch>,
    /// Newest receive time already folded; the store is only asked for
    /// strictly newer messages.
    cursor: std::time::SystemTime,
}

impl MessageBuffer {
    ///
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        soft_limit: std::time::Duration,
        hard_limit: std::time::Duration,
        batch: KeyExpr,
        group: KeyExpr,
        from: String,
        renderer: SummaryRenderer,
        store: std::sync::Arc<dyn MessageStore>,
    ) -> Self {
        Self {
            soft_limit,
            hard_limit,
            batch,
            group,
            from,
            renderer,
            store,
            batches: std::collections::HashMap::new(),
            cursor: std::time::SystemTime::UNIX_EPOCH,
        }
    }

    /// Pull messages the store received since the last poll and fold them
    /// into the batch state, in receive-time order. Returns how many new
    /// messages were folded.
    pub async fn poll(&mut self) -> usize {
        let (messages, errors) = self.store.messages_newer_than(self.cursor).await;
        for error in errors {
            tracing::warn!(target: "summarizer", %error, "Skipping an unreadable message.");
        }

        let count = messages.len();
        for stored in messages {
            self.cursor = self.cursor.max(stored.received);
            self.fold(stored);
        }
        count
    }

    /// File one stored message into every batch bucket it belongs to (one
    /// per recipient).
    fn fold(&mut self, stored: StoredMessage) {
        let key = self.batch.eval(&stored.message.mail);
        for recipient in stored.message.batch_recipients() {
            let recipient_key = RecipientKey {
                key: key.clone(),
                recipient: normalize_address(recipient),
            };
            let batch = self
                .batches
                .entry(recipient_key)
                .or_insert_with(|| Batch {
                    first: stored.received,
                    last: stored.received,
                    messages: Vec::new(),
                });
            batch.first = batch.first.min(stored.received);
            batch.last = batch.last.max(stored.received);
            batch.messages.push(stored.clone());
        }
    }

    fn is_due(&self, batch: &Batch, now: std::time::SystemTime) -> bool {
        let since_first = now.duration_since(batch.first).unwrap_or_default();
        let since_last = now.duration_since(batch.last).unwrap_or_default();
        since_first >= self.hard_limit || since_last >= self.soft_limit
    }

    /// Flush every batch that is due at `now` (all of them, when forced):
    /// build the digest, hand it to the sender, await the acknowledgement,
    /// and only then delete the underlying messages. A batch whose send
    /// failed stays whole and is retried on a later flush.
    pub async fn flush(
        &mut self,
        now: std::time::SystemTime,
        force: bool,
        sending: &tokio::sync::mpsc::Sender<SendRequest>,
    ) -> usize {
        let due = self
            .batches
            .iter()
            .filter(|(_, batch)| force || self.is_due(batch, now))
            .map(|(key, _)| key.clone())
            .collect::<Vec<_>>();

        let mut flushed = 0;
        for key in due {
            let Some(batch) = self.batches.remove(&key) else {
                continue;
            };

            let summary = summarize(
                &self.group,
                &self.from,
                &key.recipient,
                batch.messages.iter().map(|m| m.message.clone()).collect(),
                time::OffsetDateTime::from(now),
            );
            let description = summary.subject.clone();
            let outgoing = self.renderer.render(summary);

            let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
            let request = SendRequest {
                message: outgoing,
                reply: reply_tx,
            };
            if sending.send(request).await.is_err() {
                // sender is gone; keep the batch, the messages are safe in
                // the store
                self.batches.insert(key, batch);
                return flushed;
            }

            match reply_rx.await {
                Ok(Ok(())) => {
                    tracing::info!(target: "summarizer", %description, "Summary sent.");
                    for message in &batch.messages {
                        if let Err(error) = self.store.remove(&message.id).await {
                            tracing::warn!(target: "summarizer", %error, "Could not remove a sent message.");
                        }
                    }
                    flushed += 1;
                }
                Ok(Err(error)) => {
                    tracing::warn!(target: "summarizer", %description, %error, "Summary not sent, batch retained.");
                    self.batches.insert(key, batch);
                }
                Err(_) => {
                    self.batches.insert(key, batch);
                    return flushed;
                }
            }
        }
        flushed
    }

    /// Number of batches currently buffered.
    #[must_use]
    pub fn active_batches(&self) -> usize {
        self.batches.len()
    }
}

/// The summarizer task: poll the store on the configured interval, flush
/// due batches, and on termination force one final flush before closing
/// the send channel.
pub async fn start(
    mut buffer: MessageBuffer,
    poll: std::time::Duration,
    sending: tokio::sync::mpsc::Sender<SendRequest>,
    mut termination: tokio::sync::broadcast::Receiver<TerminationRequest>,
) {
    let mut interval = tokio::time::interval(poll);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                buffer.poll().await;
                buffer.flush(std::time::SystemTime::now(), false, &sending).await;
            }
            _ = termination.recv() => break,
        }
    }

    tracing::info!(target: "summarizer", "Final flush before shutdown.");
    buffer.poll().await;
    buffer.flush(std::time::SystemTime::now(), true, &sending).await;
    // dropping the send channel stops the sender
    drop(sending);

    tracing::info!(target: "summarizer", "Done summarizing.");
}
