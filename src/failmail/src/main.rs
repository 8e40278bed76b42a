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
use clap::Parser;
use failmail::{Args, Commands};
use failmail_config::Config;
use failmail_server::{socket_bind_anyhow, socket_from_fd, start_runtime};

fn main() {
    if let Err(err) = try_main() {
        let error = format!("failmail terminating error: '{err}'");

        eprintln!("{error}");
        tracing::error!(error);
        err.chain().skip(1).for_each(|cause| {
            let reason = format!("because: {cause}");

            eprintln!("{reason}");
            tracing::error!(reason);
        });
        std::process::exit(1);
    }
}

fn try_main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = args.config.as_ref().map_or_else(
        || Ok(Config::default()),
        |config| {
            std::fs::read_to_string(config)
                .context(format!("Cannot read file '{config}'"))
                .and_then(|f| Config::from_toml(&f).context("File contains format error"))
                .context("Cannot parse the configuration")
        },
    )?;

    if let Some(Commands::ConfigShow) = args.command {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    let _log_guard = failmail::tracing_subscriber::initialize(&args)?;

    if let Some(pidfile) = &config.monitor.pidfile {
        std::fs::write(pidfile, format!("{}\n", std::process::id()))
            .with_context(|| format!("Cannot write pidfile '{}'", pidfile.display()))?;
    }

    // an inherited socket (reload) takes precedence over binding
    let socket = match args.socket_fd.or(config.receiver.socket_fd) {
        Some(fd) => Some(socket_from_fd(fd)?),
        None if config.receiver.enabled => Some(socket_bind_anyhow(&config.receiver.address)?),
        None => None,
    };

    start_runtime(config, socket)
}
