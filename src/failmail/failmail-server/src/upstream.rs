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
use anyhow::Context;
use failmail_common::{normalize_address, OutgoingMessage};
use failmail_store::{Maildir, MaildirIdentity};

/// Somewhere outgoing messages can be handed to.
#[async_trait::async_trait]
pub trait Upstream: Send + Sync {
    /// Relay one message.
    ///
    /// # Errors
    ///
    /// * the upstream rejected or could not take the message
    async fn send(&self, message: &OutgoingMessage) -> anyhow::Result<()>;
}

/// A live SMTP relay, with optional PLAIN authentication.
pub struct SmtpUpstream {
    addr: String,
    transport: lettre::AsyncSmtpTransport<lettre::Tokio1Executor>,
}

impl SmtpUpstream {
    /// Build a transport for `host:port` (port 25 when omitted).
    ///
    /// # Errors
    ///
    /// * the address is empty
    pub fn new(
        addr: &str,
        username: Option<&str>,
        password: Option<&str>,
    ) -> anyhow::Result<Self> {
        let (host, port) = match addr.rsplit_once(':') {
            Some((host, port)) => (
                host,
                port.parse::<u16>()
                    .with_context(|| format!("invalid relay port in `{addr}`"))?,
            ),
            None => (addr, lettre::transport::smtp::SMTP_PORT),
        };
        anyhow::ensure!(!host.is_empty(), "empty relay host");

        let mut builder =
            lettre::AsyncSmtpTransport::<lettre::Tokio1Executor>::builder_dangerous(host)
                .port(port);
        if let (Some(username), Some(password)) = (username, password) {
            builder = builder
                .credentials(lettre::transport::smtp::authentication::Credentials::new(
                    username.to_string(),
                    password.to_string(),
                ))
                .authentication(vec![
                    lettre::transport::smtp::authentication::Mechanism::Plain,
                ]);
        }

        Ok(Self {
            addr: addr.to_string(),
            transport: builder.build(),
        })
    }

    fn envelope(message: &OutgoingMessage) -> anyhow::Result<lettre::address::Envelope> {
        let from = match normalize_address(&message.from).as_str() {
            // null reverse-path
            "" | "<>" => None,
            from => Some(from.parse().context("invalid envelope sender")?),
        };
        let to = message
            .to
            .iter()
            .map(|to| {
                normalize_address(to)
                    .parse()
                    .context("invalid envelope recipient")
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        lettre::address::Envelope::new(from, to).map_err(anyhow::Error::new)
    }
}

#[async_trait::async_trait]
impl Upstream for SmtpUpstream {
    async fn send(&self, message: &OutgoingMessage) -> anyhow::Result<()> {
        tracing::info!(target: "upstream", addr = %self.addr, "sending: {}", message.description);

        let envelope = Self::envelope(message)?;
        lettre::AsyncTransport::send_raw(&self.transport, &envelope, &message.data)
            .await
            .with_context(|| format!("relay `{}` refused the message", self.addr))?;
        Ok(())
    }
}

/// Writes outgoing messages to stdout; enabled by `relay.address = "debug"`.
#[derive(Debug, Default)]
pub struct DebugUpstream;

#[async_trait::async_trait]
impl Upstream for DebugUpstream {
    async fn send(&self, message: &OutgoingMessage) -> anyhow::Result<()> {
        let mut stdout = tokio::io::stdout();
        tokio::io::AsyncWriteExt::write_all(&mut stdout, &message.data).await?;
        tokio::io::AsyncWriteExt::flush(&mut stdout).await?;
        Ok(())
    }
}

/// Archives every outgoing message into a maildir.
#[derive(Debug)]
pub struct MaildirUpstream {
    maildir: Maildir,
}

impl MaildirUpstream {
    ///
    #[must_use]
    pub const fn new(maildir: Maildir) -> Self {
        Self { maildir }
    }
}

#[async_trait::async_trait]
impl Upstream for MaildirUpstream {
    async fn send(&self, message: &OutgoingMessage) -> anyhow::Result<()> {
        self.maildir
            .write(std::time::SystemTime::now(), &message.data)
            .map(|_| ())
    }
}

/// Dispatches to several upstreams in order, failing on the first error.
#[derive(Default)]
pub struct MultiUpstream {
    upstreams: Vec<Box<dyn Upstream>>,
}

impl MultiUpstream {
    ///
    #[must_use]
    pub fn new(upstreams: Vec<Box<dyn Upstream>>) -> Self {
        Self { upstreams }
    }
}

#[async_trait::async_trait]
impl Upstream for MultiUpstream {
    async fn send(&self, message: &OutgoingMessage) -> anyhow::Result<()> {
        for upstream in &self.upstreams {
            upstream.send(message).await?;
        }
        Ok(())
    }
}

/// The upstream stack selected by the configuration: the live relay (or the
/// stdout one for `"debug"`), wrapped with the all-sends archive when
/// `relay.all-directory` is set.
///
/// # Errors
///
/// * the relay address is invalid
/// * the all-sends maildir cannot be created
pub fn build_upstream(
    config: &failmail_config::Config,
    identity: &MaildirIdentity,
) -> anyhow::Result<Box<dyn Upstream>> {
    let relay = &config.relay;

    let primary: Box<dyn Upstream> = if relay.address == "debug" {
        Box::new(DebugUpstream)
    } else {
        Box::new(SmtpUpstream::new(
            &relay.address,
            relay.username.as_deref(),
            relay.password.as_deref(),
        )?)
    };

    match &relay.all_directory {
        None => Ok(primary),
        Some(dir) => {
            let maildir = Maildir::create(dir, identity.clone())
                .context("could not create the all-sends maildir")?;
            Ok(Box::new(MultiUpstream::new(vec![
                Box::new(MaildirUpstream::new(maildir)),
                primary,
            ])))
        }
    }
}
