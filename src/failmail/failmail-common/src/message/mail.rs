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
use time::format_description::well_known::Rfc2822;

///
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseMailError {
    /// A line in the header section is not a header field nor a
    /// continuation.
    #[error("invalid header line: {0:?}")]
    InvalidHeaderLine(String),
    /// The blank line separating headers from the body is missing.
    #[error("missing blank line after the header section")]
    MissingBody,
}

/// A parsed RFC822 message: an ordered header list and the verbatim body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Mail {
    headers: Vec<(String, String)>,
    body: String,
}

impl Mail {
    /// Parse a raw message.
    ///
    /// Headers run to the first empty line; continuation lines (leading
    /// whitespace) are unfolded into the previous field. The body is kept
    /// exactly as received.
    ///
    /// # Errors
    ///
    /// * a header line has no colon or an invalid field name
    /// * the blank line separating headers from body is missing
    pub fn parse(raw: &str) -> Result<Self, ParseMailError> {
        // a payload may legitimately start with the blank line (no headers)
        let (head, body) = match raw.strip_prefix("\r\n") {
            Some(body) => ("", body),
            None => raw
                .split_once("\r\n\r\n")
                .ok_or(ParseMailError::MissingBody)?,
        };

        let mut headers: Vec<(String, String)> = Vec::new();
        for line in head.split("\r\n") {
            if line.starts_with(' ') || line.starts_with('\t') {
                match headers.last_mut() {
                    Some((_, value)) => {
                        value.push(' ');
                        value.push_str(line.trim_start());
                        continue;
                    }
                    None => return Err(ParseMailError::InvalidHeaderLine(line.to_string())),
                }
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| ParseMailError::InvalidHeaderLine(line.to_string()))?;
            if name.is_empty() || !name.bytes().all(|b| (33..=126).contains(&b) && b != b':') {
                return Err(ParseMailError::InvalidHeaderLine(line.to_string()));
            }
            headers.push((name.to_string(), value.trim_start().to_string()));
        }

        Ok(Self {
            headers,
            body: body.to_string(),
        })
    }

    /// Look a header up by case-insensitive name. On duplicates the last
    /// occurrence wins.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .rev()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// The `Subject:` header, or the empty string.
    #[must_use]
    pub fn subject(&self) -> &str {
        self.get("Subject").unwrap_or("")
    }

    /// The `Date:` header parsed as RFC2822, when present and valid.
    #[must_use]
    pub fn date(&self) -> Option<time::OffsetDateTime> {
        self.get("Date")
            .and_then(|raw| time::OffsetDateTime::parse(raw, &Rfc2822).ok())
    }

    ///
    #[must_use]
    pub fn body(&self) -> &str {
        &self.body
    }
}
