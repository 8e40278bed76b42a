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

/// failmail: an SMTP buffering relay that batches exception mail into
/// digests.
#[derive(Debug, PartialEq, Eq, clap::Parser)]
#[command(about, version)]
pub struct Args {
    /// Path of the TOML configuration file.
    #[arg(short, long)]
    pub config: Option<String>,

    /// File descriptor of a listening socket inherited from a previous
    /// process; set by the reload machinery, overrides the bind address.
    #[arg(long)]
    pub socket_fd: Option<i32>,

    /// Log level filter, like `info` or `failmail_server=debug`.
    #[arg(short, long)]
    pub log_level: Option<String>,

    /// Append logs to this file instead of stderr.
    #[arg(long)]
    pub log_file: Option<std::path::PathBuf>,

    /// Additional commands.
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Secondary modes of the binary.
#[derive(Debug, PartialEq, Eq, clap::Subcommand)]
pub enum Commands {
    /// Print the resolved configuration and exit.
    ConfigShow,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_the_usual_invocation() {
        assert_eq!(
            Args::try_parse_from(["failmail", "-c", "failmail.toml"]).unwrap(),
            Args {
                config: Some("failmail.toml".to_string()),
                socket_fd: None,
                log_level: None,
                log_file: None,
                command: None,
            }
        );
    }

    #[test]
    fn parses_a_reload_invocation() {
        assert_eq!(
            Args::try_parse_from(["failmail", "-c", "failmail.toml", "--socket-fd=3"]).unwrap(),
            Args {
                config: Some("failmail.toml".to_string()),
                socket_fd: Some(3),
                log_level: None,
                log_file: None,
                command: None,
            }
        );
    }

    #[test]
    fn parses_config_show() {
        assert_eq!(
            Args::try_parse_from(["failmail", "config-show"]).unwrap(),
            Args {
                config: None,
                socket_fd: None,
                log_level: None,
                log_file: None,
                command: Some(Commands::ConfigShow),
            }
        );
    }
}
