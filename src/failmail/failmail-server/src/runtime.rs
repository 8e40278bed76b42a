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
    channel_message::{SendRequest, StorageRequest},
    receiver::{ReceiverContext, SingleUserPlainAuth},
    reload, render::SummaryRenderer, sender, server::Listener, signals,
    signals::TerminationRequest, summarizer, summarizer::MessageBuffer, upstream, writer,
};
use anyhow::Context;
use failmail_common::RateCounter;
use failmail_config::Config;
use failmail_store::{DiskStore, Maildir, MaildirIdentity, MemoryStore, MessageStore};

/// Capacity of the `received` and `sending` channels; bounded so a slow
/// consumer back-pressures the producer instead of buffering without limit.
const CHANNEL_SIZE: usize = 64;

/// Create a listening socket ready to be handed to the runtime.
///
/// # Errors
///
/// * failed to bind to the socket address
pub fn socket_bind_anyhow<A: std::net::ToSocketAddrs + std::fmt::Debug>(
    addr: A,
) -> anyhow::Result<std::net::TcpListener> {
    std::net::TcpListener::bind(&addr)
        .with_context(|| format!("Failed to bind socket on addr: '{addr:?}'"))
}

/// Adopt a listening socket inherited from a previous process by file
/// descriptor (the reload handoff).
///
/// # Errors
///
/// * the descriptor is negative
pub fn socket_from_fd(fd: i32) -> anyhow::Result<std::net::TcpListener> {
    anyhow::ensure!(fd >= 0, "invalid inherited socket descriptor {fd}");

    tracing::info!(fd, "Adopting inherited listening socket.");
    #[allow(unsafe_code)]
    // SAFETY: the descriptor was passed by the parent for exactly this
    // purpose and nothing else owns it in this process
    Ok(unsafe { <std::net::TcpListener as std::os::unix::io::FromRawFd>::from_raw_fd(fd) })
}

/// Start every configured task and block until they have all drained.
///
/// # Errors
///
/// * a component could not be built from the configuration
/// * the reload respawn failed
pub fn start_runtime(
    config: Config,
    socket: Option<std::net::TcpListener>,
) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("failmail")
        .build()?;

    let inherited = runtime.block_on(serve(config, socket))?;

    // the reload exec happens outside the runtime, once every task is done
    if let Some(fd) = inherited {
        reload::respawn(fd).context("reload failed, exiting without a successor")?;
        tracing::info!("Parent exiting after reload.");
    }
    Ok(())
}

async fn serve(
    config: Config,
    socket: Option<std::net::TcpListener>,
) -> anyhow::Result<Option<std::os::unix::io::RawFd>> {
    let identity = MaildirIdentity::local(failmail_config::hostname());
    let store = build_store(&config, &identity)?;

    let (termination_tx, _) = tokio::sync::broadcast::channel::<TerminationRequest>(4);
    // subscribe before the signal thread starts so no request is missed
    let listener_termination = termination_tx.subscribe();
    let summarizer_termination = termination_tx.subscribe();
    let _signal_thread = signals::handle_signals(termination_tx)?;

    let (received_tx, received_rx) = tokio::sync::mpsc::channel::<StorageRequest>(CHANNEL_SIZE);
    let (sending_tx, sending_rx) = tokio::sync::mpsc::channel::<SendRequest>(CHANNEL_SIZE);

    let receiver_tasks = if config.receiver.enabled {
        let socket = match socket {
            Some(socket) => socket,
            None => socket_bind_anyhow(&config.receiver.address)?,
        };
        let ctx = ReceiverContext {
            hostname: failmail_config::hostname(),
            auth: config.credentials()?.map(SingleUserPlainAuth::new),
            require_tls: config.receiver.require_tls,
            tls_config: failmail_config::get_rustls_config(&config)?.map(std::sync::Arc::new),
            rewriter: config.rewriter()?,
            received: received_tx,
            debug: config.receiver.debug,
        };
        let listener = Listener::new(socket, ctx, config.receiver.shutdown_timeout);

        let rate = RateCounter::new(config.receiver.rate_limit, config.receiver.rate_window);
        let writer = writer::start(
            store.clone(),
            received_rx,
            rate,
            config.receiver.rate_check,
        );

        Some((
            tokio::spawn(listener.listen(listener_termination)),
            tokio::spawn(writer),
        ))
    } else {
        // an idle receiver half: nothing feeds or drains the channel
        drop(received_tx);
        drop(received_rx);
        None
    };

    let sender_tasks = if config.summary.enabled {
        let buffer = MessageBuffer::new(
            config.summary.wait,
            config.summary.max_wait,
            config.batch_key()?,
            config.group_key()?,
            config.summary.from.clone(),
            SummaryRenderer::from_config(&config)?,
            store,
        );
        let summarizer = summarizer::start(
            buffer,
            config.summary.poll,
            sending_tx,
            summarizer_termination,
        );

        let upstream = upstream::build_upstream(&config, &identity)?;
        let failed_maildir = Maildir::create(&config.relay.failed_directory, identity)
            .context("could not create the failed-messages maildir")?;
        let sender = sender::start(upstream, failed_maildir, sending_rx);

        Some((tokio::spawn(summarizer), tokio::spawn(sender)))
    } else {
        drop(sending_tx);
        drop(sending_rx);
        None
    };

    // wait for every task; the listener reports the inherited socket on
    // reload
    let mut inherited = None;
    if let Some((listener, writer)) = receiver_tasks {
        inherited = listener.await.context("listener task panicked")??;
        writer.await.context("writer task panicked")?;
    }
    if let Some((summarizer, sender)) = sender_tasks {
        summarizer.await.context("summarizer task panicked")?;
        sender.await.context("sender task panicked")?;
    }

    Ok(inherited)
}

fn build_store(
    config: &Config,
    identity: &MaildirIdentity,
) -> anyhow::Result<std::sync::Arc<dyn MessageStore>> {
    match (config.store.memory, &config.store.directory) {
        (true, _) => Ok(std::sync::Arc::new(MemoryStore::new())),
        (false, Some(directory)) => {
            let maildir = Maildir::create(directory, identity.clone())
                .context("could not create the message store maildir")?;
            Ok(std::sync::Arc::new(DiskStore::new(maildir)))
        }
        (false, None) => {
            anyhow::bail!("must have either a memory store or a disk-backed store")
        }
    }
}
