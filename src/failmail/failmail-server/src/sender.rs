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
use crate::{channel_message::SendRequest, upstream::Upstream};
use failmail_store::Maildir;

/// The sender task: relays digests to the upstream, one at a time.
///
/// A failed send is archived to the failed maildir (best effort) and the
/// error forwarded to the summarizer, which keeps the batch for a retry.
/// Exits when the send channel closes.
pub async fn start(
    upstream: Box<dyn Upstream>,
    failed_maildir: Maildir,
    mut sending: tokio::sync::mpsc::Receiver<SendRequest>,
) {
    while let Some(SendRequest { message, reply }) = sending.recv().await {
        let result = upstream.send(&message).await;

        if let Err(error) = &result {
            tracing::warn!(target: "sender", %error, "Couldn't send message.");
            if let Err(error) =
                failed_maildir.write(std::time::SystemTime::now(), &message.data)
            {
                tracing::warn!(target: "sender", %error, "Couldn't archive the failed message.");
            }
        }

        // the summarizer may have been cancelled meanwhile
        let _ = reply.send(result);
    }

    tracing::info!(target: "sender", "Done sending.");
}
