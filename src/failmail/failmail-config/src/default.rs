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

/// The machine's hostname, falling back to `localhost`.
#[must_use]
pub fn hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

/// `<name>@<hostname>`, the default sender of outgoing digests.
pub(crate) fn from_address(name: &str) -> String {
    format!("{name}@{host}", host = hostname())
}

#[cfg(test)]
mod tests {
    #[test]
    fn from_address_uses_the_hostname() {
        let from = super::from_address("failmail");
        assert!(from.starts_with("failmail@"));
        assert!(from.len() > "failmail@".len());
    }
}
