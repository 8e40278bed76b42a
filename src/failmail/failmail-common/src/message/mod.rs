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
mod mail;

pub use mail::{Mail, ParseMailError};

/// A message received from an SMTP client, with its envelope.
///
/// The payload is kept octet-exact as the client sent it during `DATA`; the
/// parsed view is derived from it once at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    /// Envelope sender, as the wire string (e.g. `"<a@x>"`).
    pub envelope_from: String,
    /// Envelope recipients, in RCPT order, as wire strings.
    pub envelope_to: Vec<String>,
    /// Recipients after address rewriting, when a rewriter is configured.
    pub redirected_to: Option<Vec<String>>,
    /// The raw DATA payload: client headers, blank line, body.
    pub data: String,
    /// Parsed view of `data`.
    pub mail: Mail,
}

impl ReceivedMessage {
    /// Build a message from a completed transaction.
    ///
    /// # Errors
    ///
    /// * the payload is not a well-formed RFC822 message
    pub fn new(
        envelope_from: String,
        envelope_to: Vec<String>,
        redirected_to: Option<Vec<String>>,
        data: String,
    ) -> Result<Self, ParseMailError> {
        let mail = Mail::parse(&data)?;
        Ok(Self {
            envelope_from,
            envelope_to,
            redirected_to,
            data,
            mail,
        })
    }

    /// The recipients the summarizer batches on: the rewritten list when a
    /// rewriter produced one, the envelope recipients otherwise.
    #[must_use]
    pub fn batch_recipients(&self) -> &[String] {
        self.redirected_to.as_deref().unwrap_or(&self.envelope_to)
    }

    /// The `Date:` header of the payload, when present and parseable.
    #[must_use]
    pub fn date(&self) -> Option<time::OffsetDateTime> {
        self.mail.date()
    }
}
