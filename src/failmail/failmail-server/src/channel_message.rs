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
use failmail_common::{message::ReceivedMessage, OutgoingMessage};
use failmail_store::MessageId;

/// Asks the writer task to persist a message. The session holds the other
/// end of `reply` and answers the client 250 or 451 depending on the
/// outcome, which gives end-to-end acknowledgement of storage.
#[derive(Debug)]
pub struct StorageRequest {
    /// The completed message.
    pub message: ReceivedMessage,
    /// Outcome of the store write.
    pub reply: tokio::sync::oneshot::Sender<anyhow::Result<MessageId>>,
}

/// Asks the sender task to relay a digest upstream. The summarizer awaits
/// `reply` before removing the digest's messages from the store.
#[derive(Debug)]
pub struct SendRequest {
    /// The rendered digest.
    pub message: OutgoingMessage,
    /// Outcome of the upstream send.
    pub reply: tokio::sync::oneshot::Sender<anyhow::Result<()>>,
}
