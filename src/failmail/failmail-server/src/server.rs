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
    receiver::{handle_connection, ReceiverContext},
    signals::TerminationRequest,
};
use anyhow::Context;
use failmail_common::libc_abstraction::{clear_cloexec, dup};

/// Accepts client connections and runs one session task per connection.
///
/// On termination the listening socket closes first, then open sessions get
/// up to `shutdown_timeout` to finish, then the `received` channel closes
/// (the context's sender is dropped) which stops the writer. On reload the
/// listening descriptor is duplicated before the socket closes and returned
/// so the supervisor can pass it to the next process.
pub struct Listener {
    socket: std::net::TcpListener,
    ctx: std::sync::Arc<ReceiverContext>,
    shutdown_timeout: std::time::Duration,
}

impl Listener {
    ///
    pub fn new(
        socket: std::net::TcpListener,
        ctx: ReceiverContext,
        shutdown_timeout: std::time::Duration,
    ) -> Self {
        Self {
            socket,
            ctx: std::sync::Arc::new(ctx),
            shutdown_timeout,
        }
    }

    /// Accept connections until a termination request (or a fatal accept
    /// error). Returns the inherited-socket descriptor when the request was
    /// a reload.
    ///
    /// # Errors
    ///
    /// * the socket could not be registered with the runtime
    /// * a reload was requested but the descriptor could not be duplicated
    pub async fn listen(
        self,
        mut termination: tokio::sync::broadcast::Receiver<TerminationRequest>,
    ) -> anyhow::Result<Option<std::os::unix::io::RawFd>> {
        let Self {
            socket,
            ctx,
            shutdown_timeout,
        } = self;

        socket
            .set_nonblocking(true)
            .context("failed to set non-blocking listening socket")?;
        let raw_fd = std::os::unix::io::AsRawFd::as_raw_fd(&socket);
        let listener = tokio::net::TcpListener::from_std(socket)
            .context("failed to register the listening socket")?;

        tracing::info!(
            target: "listener",
            addr = %listener.local_addr().map_or_else(|_| "?".to_string(), |a| a.to_string()),
            "Listening for clients.",
        );

        let mut sessions = tokio::task::JoinSet::new();

        let request = loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, client_addr)) => {
                        tracing::info!(target: "listener", %client_addr, "Accepted connection.");

                        let ctx = ctx.clone();
                        sessions.spawn(async move {
                            let name = client_addr.to_string();
                            if let Err(error) = handle_connection(ctx, name.clone(), stream).await {
                                tracing::warn!(target: "listener", %name, %error, "Session ended with an error.");
                            }
                        });
                    }
                    Err(error) => {
                        tracing::error!(target: "listener", %error, "Accept failed, shutting the receiver down.");
                        break TerminationRequest::Shutdown;
                    }
                },
                request = termination.recv() => {
                    break request.unwrap_or(TerminationRequest::Shutdown);
                }
                // reap finished sessions as we go
                Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
            }
        };

        // on reload, keep the kernel socket alive past the close below
        let inherited = if request == TerminationRequest::Reload {
            let new_fd = dup(raw_fd).context("could not duplicate the listening socket")?;
            clear_cloexec(new_fd).context("could not clear close-on-exec on the duplicate")?;
            Some(new_fd)
        } else {
            None
        };

        // stop accepting before the drain
        drop(listener);

        tracing::info!(
            target: "listener",
            open = sessions.len(),
            timeout = ?shutdown_timeout,
            "Waiting for open sessions to finish.",
        );
        let drain = async {
            while sessions.join_next().await.is_some() {}
        };
        if tokio::time::timeout(shutdown_timeout, drain).await.is_err() {
            tracing::warn!(target: "listener", "Open sessions outlived the drain timeout.");
            sessions.shutdown().await;
        }

        // the last clone of the storage channel sender dies with `ctx`,
        // which closes the channel and lets the writer exit
        drop(ctx);

        tracing::info!(target: "listener", "Done listening.");
        Ok(inherited)
    }
}
