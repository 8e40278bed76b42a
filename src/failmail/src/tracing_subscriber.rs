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
use crate::Args;

/// Initialize the tracing subsystem: an `EnvFilter` built from `RUST_LOG`
/// or `--log-level`, writing to stderr or to `--log-file`.
///
/// The returned guard must be kept alive for the lifetime of the process;
/// dropping it flushes the file writer.
///
/// # Errors
///
/// * the log file's directory does not exist
/// * the filter directive does not parse
/// * a global subscriber is already installed
pub fn initialize(args: &Args) -> anyhow::Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let filter = match &args.log_level {
        Some(directive) => tracing_subscriber::EnvFilter::try_new(directive)?,
        None => tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
    };

    let subscriber = tracing_subscriber::registry().with(filter);

    match &args.log_file {
        Some(path) => {
            let (directory, file_name) = match (
                path.parent(),
                path.file_name().and_then(std::ffi::OsStr::to_str),
            ) {
                (Some(directory), Some(file_name)) => (directory, file_name),
                _ => anyhow::bail!("log file path `{}` is not valid", path.display()),
            };
            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::never(
                    if directory.as_os_str().is_empty() {
                        std::path::Path::new(".")
                    } else {
                        directory
                    },
                    file_name,
                ));

            subscriber
                .with(
                    tracing_subscriber::fmt::layer()
                        .compact()
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .try_init()
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            Ok(Some(guard))
        }
        None => {
            subscriber
                .with(
                    tracing_subscriber::fmt::layer()
                        .compact()
                        .with_writer(std::io::stderr),
                )
                .try_init()
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            Ok(None)
        }
    }
}
