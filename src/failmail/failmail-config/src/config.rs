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
use failmail_common::{AddressRewriter, KeyExpr};

/// Everything a failmail process can be told at startup.
///
/// Loaded from a TOML file given with `-c, --config`; every field is
/// optional and defaulted when missing.
#[derive(Debug, Clone, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// see [`field::FieldReceiver`]
    #[serde(default)]
    pub receiver: field::FieldReceiver,
    /// see [`field::FieldStore`]
    #[serde(default)]
    pub store: field::FieldStore,
    /// see [`field::FieldSummary`]
    #[serde(default)]
    pub summary: field::FieldSummary,
    /// see [`field::FieldRelay`]
    #[serde(default)]
    pub relay: field::FieldRelay,
    /// see [`field::FieldMonitor`]
    #[serde(default)]
    pub monitor: field::FieldMonitor,
}

/// The inner field of the failmail configuration.
#[allow(clippy::module_name_repetitions)]
pub mod field {
    /// Options for listening for incoming messages.
    #[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
    #[serde(deny_unknown_fields, rename_all = "kebab-case")]
    pub struct FieldReceiver {
        /// Receive and store incoming messages.
        #[serde(default = "FieldReceiver::default_enabled")]
        pub enabled: bool,
        /// Local bind address.
        #[serde(default = "FieldReceiver::default_address")]
        pub address: String,
        /// File descriptor of an inherited socket to listen on, set by the
        /// reload machinery instead of `address`.
        #[serde(default)]
        pub socket_fd: Option<i32>,
        /// `username:password` clients must present via AUTH PLAIN. Setting
        /// this makes authentication mandatory for mail transactions.
        #[serde(default)]
        pub credentials: Option<String>,
        /// PEM certificate file; with `tls-private-key`, enables STARTTLS.
        #[serde(default)]
        pub tls_certificate: Option<std::path::PathBuf>,
        /// PEM key file; with `tls-certificate`, enables STARTTLS.
        #[serde(default)]
        pub tls_private_key: Option<std::path::PathBuf>,
        /// Refuse AUTH until the session has switched to TLS.
        #[serde(default)]
        pub require_tls: bool,
        /// How long to wait for open sessions when shutting down or
        /// reloading.
        #[serde(default = "FieldReceiver::default_shutdown_timeout")]
        #[serde(with = "humantime_serde")]
        pub shutdown_timeout: std::time::Duration,
        /// Log every line sent to and from clients.
        #[serde(default)]
        pub debug: bool,
        /// Pattern matched against recipients for address rewriting.
        #[serde(default)]
        pub rewrite_source: Option<String>,
        /// Replacement template for recipients matching `rewrite-source`.
        #[serde(default)]
        pub rewrite_destination: Option<String>,
        /// Warn when this many messages arrive within the rate window; zero
        /// disables the check.
        #[serde(default)]
        pub rate_limit: usize,
        /// How often to check whether the rate limit was exceeded.
        #[serde(default = "FieldReceiver::default_rate_check")]
        #[serde(with = "humantime_serde")]
        pub rate_check: std::time::Duration,
        /// Size of the rate window, in check intervals.
        #[serde(default = "FieldReceiver::default_rate_window")]
        pub rate_window: usize,
    }

    impl FieldReceiver {
        pub(crate) const fn default_enabled() -> bool {
            true
        }

        pub(crate) fn default_address() -> String {
            "localhost:2525".to_string()
        }

        pub(crate) const fn default_shutdown_timeout() -> std::time::Duration {
            std::time::Duration::from_secs(5)
        }

        pub(crate) const fn default_rate_check() -> std::time::Duration {
            std::time::Duration::from_secs(60)
        }

        pub(crate) const fn default_rate_window() -> usize {
            5
        }
    }

    impl Default for FieldReceiver {
        fn default() -> Self {
            Self {
                enabled: Self::default_enabled(),
                address: Self::default_address(),
                socket_fd: None,
                credentials: None,
                tls_certificate: None,
                tls_private_key: None,
                require_tls: false,
                shutdown_timeout: Self::default_shutdown_timeout(),
                debug: false,
                rewrite_source: None,
                rewrite_destination: None,
                rate_limit: 0,
                rate_check: Self::default_rate_check(),
                rate_window: Self::default_rate_window(),
            }
        }
    }

    /// Options for storing messages between ingest and summarization.
    #[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
    #[serde(deny_unknown_fields, rename_all = "kebab-case")]
    pub struct FieldStore {
        /// Hold messages in memory instead of an on-disk maildir.
        #[serde(default)]
        pub memory: bool,
        /// Maildir used to hold received messages.
        #[serde(default = "FieldStore::default_directory")]
        pub directory: Option<std::path::PathBuf>,
    }

    impl FieldStore {
        pub(crate) fn default_directory() -> Option<std::path::PathBuf> {
            Some("incoming".into())
        }
    }

    impl Default for FieldStore {
        fn default() -> Self {
            Self {
                memory: false,
                directory: Self::default_directory(),
            }
        }
    }

    /// Options for summarizing messages.
    #[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
    #[serde(deny_unknown_fields, rename_all = "kebab-case")]
    pub struct FieldSummary {
        /// Summarize and send messages.
        #[serde(default = "FieldSummary::default_enabled")]
        pub enabled: bool,
        /// From address of outgoing digests.
        #[serde(default = "FieldSummary::default_from")]
        pub from: String,
        /// Wait this long for more batchable messages (soft limit).
        #[serde(default = "FieldSummary::default_wait")]
        #[serde(with = "humantime_serde")]
        pub wait: std::time::Duration,
        /// Wait at most this long from a batch's first message (hard limit).
        #[serde(default = "FieldSummary::default_max_wait")]
        #[serde(with = "humantime_serde")]
        pub max_wait: std::time::Duration,
        /// Check the store for new messages this frequently.
        #[serde(default = "FieldSummary::default_poll")]
        #[serde(with = "humantime_serde")]
        pub poll: std::time::Duration,
        /// Key expression batching messages into separate digests.
        #[serde(default = "FieldSummary::default_batch")]
        pub batch: String,
        /// Key expression grouping messages within a digest.
        #[serde(default = "FieldSummary::default_group")]
        pub group: String,
        /// Path of a digest template file.
        #[serde(default)]
        pub template: Option<std::path::PathBuf>,
    }

    impl FieldSummary {
        pub(crate) const fn default_enabled() -> bool {
            true
        }

        pub(crate) fn default_from() -> String {
            crate::default::from_address("failmail")
        }

        pub(crate) const fn default_wait() -> std::time::Duration {
            std::time::Duration::from_secs(30)
        }

        pub(crate) const fn default_max_wait() -> std::time::Duration {
            std::time::Duration::from_secs(5 * 60)
        }

        pub(crate) const fn default_poll() -> std::time::Duration {
            std::time::Duration::from_secs(5)
        }

        pub(crate) fn default_batch() -> String {
            "header:X-Failmail-Split".to_string()
        }

        pub(crate) fn default_group() -> String {
            "subject".to_string()
        }
    }

    impl Default for FieldSummary {
        fn default() -> Self {
            Self {
                enabled: Self::default_enabled(),
                from: Self::default_from(),
                wait: Self::default_wait(),
                max_wait: Self::default_max_wait(),
                poll: Self::default_poll(),
                batch: Self::default_batch(),
                group: Self::default_group(),
                template: None,
            }
        }
    }

    /// Options for relaying outgoing digests.
    #[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
    #[serde(deny_unknown_fields, rename_all = "kebab-case")]
    pub struct FieldRelay {
        /// Upstream relay address; the literal `"debug"` writes digests to
        /// stdout instead.
        #[serde(default = "FieldRelay::default_address")]
        pub address: String,
        /// Username for PLAIN auth to the relay.
        #[serde(default)]
        pub username: Option<String>,
        /// Password for PLAIN auth to the relay.
        #[serde(default)]
        pub password: Option<String>,
        /// Maildir that failed sends are archived to.
        #[serde(default = "FieldRelay::default_failed_directory")]
        pub failed_directory: std::path::PathBuf,
        /// Maildir that every send is archived to.
        #[serde(default)]
        pub all_directory: Option<std::path::PathBuf>,
    }

    impl FieldRelay {
        pub(crate) fn default_address() -> String {
            "localhost:25".to_string()
        }

        pub(crate) fn default_failed_directory() -> std::path::PathBuf {
            "failed".into()
        }
    }

    impl Default for FieldRelay {
        fn default() -> Self {
            Self {
                address: Self::default_address(),
                username: None,
                password: None,
                failed_directory: Self::default_failed_directory(),
                all_directory: None,
            }
        }
    }

    /// Monitoring options.
    #[derive(Debug, Clone, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
    #[serde(deny_unknown_fields, rename_all = "kebab-case")]
    pub struct FieldMonitor {
        /// Local bind address for the operator HTTP endpoint. Recognized for
        /// compatibility; this build does not serve it.
        #[serde(default)]
        pub http_address: Option<String>,
        /// Write a pidfile to this path.
        #[serde(default)]
        pub pidfile: Option<std::path::PathBuf>,
    }
}

/// A username/password pair, both for validating AUTH PLAIN clients and for
/// authenticating to the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    ///
    pub username: String,
    ///
    pub password: String,
}

impl std::str::FromStr for Credentials {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (username, password) = s
            .split_once(':')
            .context("credentials must be in username:password format")?;
        Ok(Self {
            username: username.to_string(),
            password: password.to_string(),
        })
    }
}

impl Config {
    /// Parse a configuration from TOML text.
    ///
    /// # Errors
    ///
    /// * syntax error, unknown field, or invalid value
    pub fn from_toml(input: &str) -> anyhow::Result<Self> {
        toml::from_str(input).map_err(anyhow::Error::new)
    }

    /// The receiver's AUTH PLAIN credentials, when configured.
    ///
    /// # Errors
    ///
    /// * the option is not in `username:password` format
    pub fn credentials(&self) -> anyhow::Result<Option<Credentials>> {
        self.receiver
            .credentials
            .as_deref()
            .map(str::parse)
            .transpose()
    }

    /// The recipient rewriter; a disabled one when the options are unset.
    ///
    /// # Errors
    ///
    /// * only one of source/destination is set
    /// * the source pattern is not a valid regex
    pub fn rewriter(&self) -> anyhow::Result<AddressRewriter> {
        match (
            &self.receiver.rewrite_source,
            &self.receiver.rewrite_destination,
        ) {
            (None, None) => Ok(AddressRewriter::default()),
            (Some(source), Some(dest)) => Ok(AddressRewriter {
                source: Some(
                    regex::Regex::new(source).context("invalid rewrite-source pattern")?,
                ),
                dest: dest.clone(),
            }),
            _ => anyhow::bail!("rewrite-source and rewrite-destination must be given together"),
        }
    }

    /// The batch key expression.
    ///
    /// # Errors
    ///
    /// * the expression does not parse
    pub fn batch_key(&self) -> anyhow::Result<KeyExpr> {
        KeyExpr::parse(&self.summary.batch).context("invalid batch key expression")
    }

    /// The group key expression.
    ///
    /// # Errors
    ///
    /// * the expression does not parse
    pub fn group_key(&self) -> anyhow::Result<KeyExpr> {
        KeyExpr::parse(&self.summary.group).context("invalid group key expression")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn empty_input_is_all_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
        assert!(config.receiver.enabled);
        assert_eq!(config.receiver.address, "localhost:2525");
        assert_eq!(
            config.receiver.shutdown_timeout,
            std::time::Duration::from_secs(5)
        );
        assert_eq!(config.summary.wait, std::time::Duration::from_secs(30));
        assert_eq!(config.summary.max_wait, std::time::Duration::from_secs(300));
        assert_eq!(config.summary.poll, std::time::Duration::from_secs(5));
        assert_eq!(config.summary.batch, "header:X-Failmail-Split");
        assert_eq!(config.summary.group, "subject");
        assert_eq!(config.relay.address, "localhost:25");
        assert_eq!(config.store.directory, Some("incoming".into()));
    }

    #[test]
    fn parses_a_full_file() {
        let config = Config::from_toml(
            r#"
            [receiver]
            address = "0.0.0.0:2525"
            credentials = "test:test"
            shutdown-timeout = "10s"
            debug = true

            [store]
            memory = true

            [summary]
            wait = "5s"
            max-wait = "9s"
            batch = "subject"

            [relay]
            address = "debug"
            "#,
        )
        .unwrap();

        assert_eq!(config.receiver.address, "0.0.0.0:2525");
        assert!(config.receiver.debug);
        assert_eq!(
            config.receiver.shutdown_timeout,
            std::time::Duration::from_secs(10)
        );
        assert!(config.store.memory);
        assert_eq!(config.summary.wait, std::time::Duration::from_secs(5));
        assert_eq!(config.summary.max_wait, std::time::Duration::from_secs(9));
        assert_eq!(config.relay.address, "debug");

        let creds = config.credentials().unwrap().unwrap();
        assert_eq!(creds.username, "test");
        assert_eq!(creds.password, "test");
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(Config::from_toml("[receiver]\nnope = 1\n").is_err());
    }

    #[test]
    fn bad_credentials_are_rejected() {
        let config = Config::from_toml("[receiver]\ncredentials = \"no-colon\"\n").unwrap();
        assert!(config.credentials().is_err());
    }

    #[test]
    fn rewriter_requires_both_options() {
        let config =
            Config::from_toml("[receiver]\nrewrite-source = \".*\"\n").unwrap();
        assert!(config.rewriter().is_err());

        let config = Config::from_toml(
            "[receiver]\nrewrite-source = \"(.*)@a.com\"\nrewrite-destination = \"$1@b.com\"\n",
        )
        .unwrap();
        assert_eq!(
            config.rewriter().unwrap().rewrite("x@a.com"),
            "x@b.com".to_string()
        );
    }

    #[test]
    fn key_expressions_are_validated() {
        let config = Config::from_toml("[summary]\nbatch = \"garbage\"\n").unwrap();
        assert!(config.batch_key().is_err());
        assert!(config.group_key().is_ok());
    }
}
