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

/// What a long-lived task is asked to do when the process winds down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationRequest {
    /// Finish the current unit of work and return.
    Shutdown,
    /// Like [`TerminationRequest::Shutdown`], but the listener hands its
    /// socket over so a new process can inherit it.
    Reload,
}

/// Watch for termination signals on a dedicated thread and fan the mapped
/// request out to every subscribed task.
///
/// SIGINT and SIGTERM request a graceful shutdown, SIGUSR1 a reload.
///
/// # Errors
///
/// * the signal iterator could not be registered
pub fn handle_signals(
    requests: tokio::sync::broadcast::Sender<TerminationRequest>,
) -> anyhow::Result<std::thread::JoinHandle<()>> {
    let mut signals = signal_hook::iterator::Signals::new([
        // sent by `systemctl stop`, and Ctrl+C on a terminal
        signal_hook::consts::SIGTERM,
        signal_hook::consts::SIGINT,
        // zero-downtime reload
        signal_hook::consts::SIGUSR1,
    ])?;

    Ok(std::thread::spawn(move || {
        for signal in signals.forever() {
            let request = if signal == signal_hook::consts::SIGUSR1 {
                TerminationRequest::Reload
            } else {
                TerminationRequest::Shutdown
            };
            tracing::warn!(signal, ?request, "Caught signal, stopping failmail.");

            if requests.send(request).is_err() {
                // every task is already gone
                return;
            }
        }
    }))
}
