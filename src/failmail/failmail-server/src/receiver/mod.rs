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
use failmail_common::{AddressRewriter, Event, Reply};

mod auth;
mod connection;
mod session;

pub use auth::SingleUserPlainAuth;
pub use connection::Connection;
pub use session::{Action, AuthState, Security, Session};

/// Everything a session needs from its surroundings.
pub struct ReceiverContext {
    /// Name announced in the greeting and EHLO replies.
    pub hostname: String,
    /// AUTH PLAIN validator, when credentials are configured.
    pub auth: Option<SingleUserPlainAuth>,
    /// Refuse AUTH until the session switched to TLS.
    pub require_tls: bool,
    /// STARTTLS server configuration, when TLS material is configured.
    pub tls_config: Option<std::sync::Arc<rustls::ServerConfig>>,
    /// Recipient rewriter applied at ingest.
    pub rewriter: AddressRewriter,
    /// Channel to the writer task.
    pub received: tokio::sync::mpsc::Sender<StorageRequest>,
    /// Log both directions of every session.
    pub debug: bool,
}

impl ReceiverContext {
    fn new_session(&self) -> Session {
        let auth = match &self.auth {
            Some(validator) => AuthState::Required(validator.clone()),
            None => AuthState::NotPermitted,
        };
        Session::new(
            self.hostname.clone(),
            auth,
            Security {
                tls_available: self.tls_config.is_some(),
                tls_active: false,
                auth_requires_tls: self.require_tls,
            },
        )
    }
}

/// Drive one client connection from greeting to close.
///
/// # Errors
///
/// * the transport failed
/// * the TLS handshake failed
pub async fn handle_connection<S>(
    ctx: std::sync::Arc<ReceiverContext>,
    name: String,
    stream: S,
) -> anyhow::Result<()>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin,
{
    let mut conn = Connection::new(name, ctx.debug, stream);
    let mut session = ctx.new_session();
    conn.send_reply(&session.greeting()).await?;

    if !command_loop(&mut conn, &mut session, &ctx).await? {
        return Ok(());
    }

    // the 220 has been written; run the TLS server handshake and resume the
    // same session over the encrypted stream
    let tls_config = ctx
        .tls_config
        .clone()
        .ok_or_else(|| anyhow::anyhow!("session offered STARTTLS without TLS material"))?;
    let acceptor = tokio_rustls::TlsAcceptor::from(tls_config);
    let name = conn.name.clone();
    let stream = acceptor.accept(conn.into_inner()).await?;

    let mut conn = Connection::new(name, ctx.debug, stream);
    session.set_tls_active();

    if command_loop(&mut conn, &mut session, &ctx).await? {
        anyhow::bail!("session requested a second TLS upgrade");
    }
    Ok(())
}

/// Read and answer commands until the session closes (`false`) or asks for
/// a TLS upgrade (`true`, after the `220` has been written).
async fn command_loop<S>(
    conn: &mut Connection<S>,
    session: &mut Session,
    ctx: &ReceiverContext,
) -> anyhow::Result<bool>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin,
{
    loop {
        let Some(line) = conn.read_line().await? else {
            tracing::info!(target: "receiver", "[{}] client went away", conn.name);
            return Ok(false);
        };

        let event = match Event::parse_cmd(line.trim_end_matches("\r\n")) {
            Ok(event) => event,
            Err(_) => {
                conn.send_reply(&Reply::new(500, "Parse error")).await?;
                continue;
            }
        };

        match session.advance(event) {
            Action::Reply(reply) => conn.send_reply(&reply).await?,
            Action::Close(reply) => {
                conn.send_reply(&reply).await?;
                return Ok(false);
            }
            Action::UpgradeTls(reply) => {
                conn.send_reply(&reply).await?;
                return Ok(true);
            }
            Action::ReadAuthResponse(challenge) => {
                conn.send_reply(&challenge).await?;
                let Some(response) = conn.read_line().await? else {
                    return Ok(false);
                };
                let reply = session.read_auth_response(&response);
                conn.send_reply(&reply).await?;
            }
            Action::ReadData(reply) => {
                conn.send_reply(&reply).await?;
                let reply = read_data(conn, session, ctx).await;
                conn.send_reply(&reply).await?;
            }
        }
    }
}

/// Read the DATA payload up to the lone `.` line, hand the message to the
/// writer, and wait for the storage acknowledgement. The payload is kept
/// exactly as received: no dot-unstuffing is applied.
async fn read_data<S>(
    conn: &mut Connection<S>,
    session: &mut Session,
    ctx: &ReceiverContext,
) -> Reply
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin,
{
    let mut data = String::new();
    loop {
        match conn.read_line().await {
            Ok(Some(line)) if line == ".\r\n" => break,
            Ok(Some(line)) => data.push_str(&line),
            Ok(None) | Err(_) => return Reply::new(451, "Failed to read data"),
        }
    }

    let message = match session.data_complete(data, &ctx.rewriter) {
        Ok(message) => message,
        Err(e) => {
            tracing::info!(target: "receiver", "[{}] unparseable message: {e}", conn.name);
            return Reply::new(451, "Failed to parse data");
        }
    };
    tracing::info!(
        target: "receiver",
        "[{}] received message with subject {:?}",
        conn.name,
        message.mail.subject()
    );

    // the client is told 250 only once the message is durably stored
    let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
    let request = StorageRequest {
        message,
        reply: reply_tx,
    };
    if ctx.received.send(request).await.is_err() {
        return Reply::new(451, "Failed to store data");
    }

    match reply_rx.await {
        Ok(Ok(_id)) => Reply::new(250, "Got the data"),
        Ok(Err(e)) => {
            tracing::warn!(target: "receiver", "[{}] storage failure: {e}", conn.name);
            Reply::new(451, "Failed to store data")
        }
        Err(_) => Reply::new(451, "Failed to store data"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use failmail_store::{MemoryStore, MessageStore};

    /// A context backed by a writer task over an in-memory store.
    fn context(
        auth: Option<SingleUserPlainAuth>,
    ) -> (
        std::sync::Arc<ReceiverContext>,
        std::sync::Arc<MemoryStore>,
        tokio::task::JoinHandle<()>,
    ) {
        let store = std::sync::Arc::new(MemoryStore::new());
        let (received, mut rx) = tokio::sync::mpsc::channel::<StorageRequest>(8);

        let writer_store = store.clone();
        let writer = tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                let result = writer_store
                    .add(std::time::SystemTime::now(), request.message)
                    .await;
                let _ = request.reply.send(result);
            }
        });

        let ctx = std::sync::Arc::new(ReceiverContext {
            hostname: "mail.example.com".to_string(),
            auth,
            require_tls: false,
            tls_config: None,
            rewriter: AddressRewriter::default(),
            received,
            debug: false,
        });
        (ctx, store, writer)
    }

    async fn converse(
        ctx: std::sync::Arc<ReceiverContext>,
        script: &[(&str, &str)],
    ) {
        let (client, server) = tokio::io::duplex(4096);
        let handle = tokio::spawn(handle_connection(ctx, "test".to_string(), server));

        let (read_half, mut write_half) = tokio::io::split(client);
        let mut reader = tokio::io::BufReader::new(read_half);

        let mut banner = String::new();
        tokio::io::AsyncBufReadExt::read_line(&mut reader, &mut banner)
            .await
            .unwrap();
        assert_eq!(banner, "220 mail.example.com Hi there\r\n");

        for (send, expect) in script {
            tokio::io::AsyncWriteExt::write_all(&mut write_half, send.as_bytes())
                .await
                .unwrap();
            if expect.is_empty() {
                continue;
            }
            let mut got = String::new();
            for _ in 0..expect.matches("\r\n").count() {
                let mut line = String::new();
                let n = tokio::io::AsyncBufReadExt::read_line(&mut reader, &mut line)
                    .await
                    .unwrap();
                assert_ne!(n, 0, "connection closed waiting for {expect:?}");
                got.push_str(&line);
            }
            assert_eq!(&got, expect, "after sending {send:?}");
        }

        drop(write_half);
        drop(reader);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn greeting_and_quit() {
        let (ctx, _store, _writer) = context(None);
        converse(ctx, &[("QUIT\r\n", "221 mail.example.com See ya\r\n")]).await;
    }

    #[tokio::test]
    async fn happy_path_stores_the_message() {
        let (ctx, store, _writer) = context(None);
        converse(
            ctx,
            &[
                ("HELO x\r\n", "250 Hello\r\n"),
                ("MAIL FROM:<a@x>\r\n", "250 OK\r\n"),
                ("RCPT TO:<b@y>\r\n", "250 OK\r\n"),
                ("DATA\r\n", "354 Go\r\n"),
                ("Subject: t\r\n\r\nhi\r\n.\r\n", "250 Got the data\r\n"),
                ("QUIT\r\n", "221 mail.example.com See ya\r\n"),
            ],
        )
        .await;

        let (messages, _) = store
            .messages_newer_than(std::time::SystemTime::UNIX_EPOCH)
            .await;
        assert_eq!(messages.len(), 1);
        let message = &messages[0].message;
        assert_eq!(message.envelope_from, "<a@x>");
        assert_eq!(message.envelope_to, ["<b@y>"]);
        assert_eq!(message.mail.subject(), "t");
        assert_eq!(message.mail.body(), "hi\r\n");
    }

    #[tokio::test]
    async fn out_of_sequence_and_parse_errors_keep_the_session() {
        let (ctx, _store, _writer) = context(None);
        converse(
            ctx,
            &[
                ("HELO x\r\n", "250 Hello\r\n"),
                ("RCPT TO:<b@y>\r\n", "503 Command out of sequence\r\n"),
                ("NOT A COMMAND\r\n", "500 Parse error\r\n"),
                ("QUIT\r\n", "221 mail.example.com See ya\r\n"),
            ],
        )
        .await;
    }

    #[tokio::test]
    async fn auth_plain_one_step() {
        let (ctx, _store, _writer) = context(Some(SingleUserPlainAuth::new(
            failmail_config::Credentials {
                username: "test".to_string(),
                password: "test".to_string(),
            },
        )));
        converse(
            ctx,
            &[
                ("AUTH PLAIN dGVzdAB0ZXN0AHRlc3Q=\r\n", "235 Authentication successful\r\n"),
                ("QUIT\r\n", "221 mail.example.com See ya\r\n"),
            ],
        )
        .await;
    }

    #[tokio::test]
    async fn auth_challenge_two_step() {
        let (ctx, _store, _writer) = context(Some(SingleUserPlainAuth::new(
            failmail_config::Credentials {
                username: "test".to_string(),
                password: "test".to_string(),
            },
        )));
        converse(
            ctx,
            &[
                ("AUTH PLAIN\r\n", "334 \r\n"),
                ("dGVzdAB0ZXN0AHRlc3Q=\r\n", "235 Authentication successful\r\n"),
                ("QUIT\r\n", "221 mail.example.com See ya\r\n"),
            ],
        )
        .await;
    }

    #[tokio::test]
    async fn bad_data_gets_451() {
        let (ctx, store, _writer) = context(None);
        converse(
            ctx,
            &[
                ("MAIL FROM:<a@x>\r\n", "250 OK\r\n"),
                ("RCPT TO:<b@y>\r\n", "250 OK\r\n"),
                ("DATA\r\n", "354 Go\r\n"),
                ("no blank line\r\n.\r\n", "451 Failed to parse data\r\n"),
                ("QUIT\r\n", "221 mail.example.com See ya\r\n"),
            ],
        )
        .await;

        let (messages, _) = store
            .messages_newer_than(std::time::SystemTime::UNIX_EPOCH)
            .await;
        assert!(messages.is_empty());
    }
}
