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
use crate::channel_message::StorageRequest;
use failmail_common::RateCounter;
use failmail_store::MessageStore;

/// The writer task: the sole adder to the store.
///
/// Drains `received`, persists each message, and acknowledges the outcome
/// on the request's reply channel; the session answers its client only
/// after this ack. Also owns the incoming-rate counter, checked on its own
/// interval purely as an alerting signal.
///
/// Exits when the `received` channel closes.
pub async fn start(
    store: std::sync::Arc<dyn MessageStore>,
    mut received: tokio::sync::mpsc::Receiver<StorageRequest>,
    mut rate: RateCounter,
    rate_check: std::time::Duration,
) {
    let mut check_interval = tokio::time::interval(rate_check);
    check_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            request = received.recv() => {
                let Some(StorageRequest { message, reply }) = request else {
                    break;
                };
                rate.add(1);

                let result = store.add(std::time::SystemTime::now(), message).await;
                if let Err(error) = &result {
                    tracing::warn!(target: "writer", %error, "Storage failure.");
                }
                // the session may have given up on the connection already
                let _ = reply.send(result);
            }
            _ = check_interval.tick() => {
                let (exceeded, count) = rate.check_and_advance();
                if exceeded {
                    tracing::warn!(target: "writer", count, "Rate limit check exceeded.");
                }
            }
        }
    }

    tracing::info!(target: "writer", "Done writing.");
}
