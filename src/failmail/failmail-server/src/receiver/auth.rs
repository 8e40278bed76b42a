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
use failmail_config::Credentials;

/// Validates AUTH PLAIN responses against the single configured credential.
#[derive(Debug, Clone)]
pub struct SingleUserPlainAuth {
    username: String,
    password: String,
}

impl SingleUserPlainAuth {
    ///
    #[must_use]
    pub fn new(credentials: Credentials) -> Self {
        Self {
            username: credentials.username,
            password: credentials.password,
        }
    }

    /// Check a decoded PLAIN response (`authzid NUL authcid NUL password`,
    /// RFC 4616) against the configured credential. The authorization
    /// identity is ignored.
    ///
    /// # Errors
    ///
    /// * the response does not have three NUL-separated parts
    pub fn valid_credentials(&self, decoded: &str) -> anyhow::Result<bool> {
        let parts = decoded.split('\0').collect::<Vec<_>>();
        let [_authzid, authcid, password] = parts.as_slice() else {
            anyhow::bail!("AUTH response must have 3 fields, got {}", parts.len())
        };
        Ok(*authcid == self.username && *password == self.password)
    }
}
