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
use failmail_common::Reply;

/// How long a session may sit idle between lines before it is dropped.
const READ_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5 * 60);

/// One client connection: buffered line IO over the (possibly TLS-wrapped)
/// stream, with optional logging of both directions.
pub struct Connection<S>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin,
{
    /// Connection identity for logs, usually the peer address.
    pub name: String,
    /// Log every line in both directions.
    pub debug: bool,
    inner: tokio::io::BufReader<S>,
}

impl<S> Connection<S>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin,
{
    ///
    pub fn new(name: String, debug: bool, stream: S) -> Self {
        Self {
            name,
            debug,
            inner: tokio::io::BufReader::new(stream),
        }
    }

    /// Give the underlying stream back, for the STARTTLS handshake.
    /// Buffered but unconsumed client bytes are dropped; RFC 3207 forbids
    /// pipelining across the TLS negotiation anyway.
    pub fn into_inner(self) -> S {
        self.inner.into_inner()
    }

    /// Read one line, terminator included. `None` on a clean EOF.
    ///
    /// # Errors
    ///
    /// * the read timed out or failed
    /// * the line is not valid UTF-8
    pub async fn read_line(&mut self) -> std::io::Result<Option<String>> {
        let mut line = String::new();
        let read = tokio::time::timeout(
            READ_TIMEOUT,
            tokio::io::AsyncBufReadExt::read_line(&mut self.inner, &mut line),
        )
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "client went quiet"))??;

        if read == 0 {
            return Ok(None);
        }
        if self.debug {
            tracing::debug!(target: "receiver", "[{}] <<< {:?}", self.name, line);
        }
        Ok(Some(line))
    }

    /// Write a reply, folded to its wire form, and flush.
    ///
    /// # Errors
    ///
    /// * the transport write failed
    pub async fn send_reply(&mut self, reply: &Reply) -> anyhow::Result<()> {
        let folded = reply.fold();
        if self.debug {
            tracing::debug!(target: "receiver", "[{}] >>> {:?}", self.name, folded);
        }
        tokio::io::AsyncWriteExt::write_all(&mut self.inner, folded.as_bytes()).await?;
        tokio::io::AsyncWriteExt::flush(&mut self.inner).await?;
        Ok(())
    }
}
