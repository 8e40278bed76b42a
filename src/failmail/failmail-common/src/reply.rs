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

/// An SMTP reply: a 3-digit code and a human readable text.
///
/// The text may contain embedded CRLF separators, in which case the reply is
/// written as a multi-line response (`250-first\r\n250 last\r\n`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    code: u16,
    text: String,
}

impl Reply {
    ///
    pub fn new(code: u16, text: impl Into<String>) -> Self {
        Self {
            code,
            text: text.into(),
        }
    }

    ///
    #[must_use]
    pub const fn code(&self) -> u16 {
        self.code
    }

    /// Serialize the reply to its on-the-wire form.
    ///
    /// Every line of the text but the last is prefixed with `<code>-`, the
    /// last with `<code> `, per RFC 5321 §4.2.1.
    #[must_use]
    pub fn fold(&self) -> String {
        let lines = self.text.split("\r\n").collect::<Vec<_>>();
        let mut out = String::with_capacity(self.text.len() + lines.len() * 6);
        for (i, line) in lines.iter().enumerate() {
            if i + 1 == lines.len() {
                out.push_str(&format!("{} {}\r\n", self.code, line));
            } else {
                out.push_str(&format!("{}-{}\r\n", self.code, line));
            }
        }
        out
    }
}

impl std::fmt::Display for Reply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.code, self.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn single_line() {
        assert_eq!(Reply::new(220, "Hello").fold(), "220 Hello\r\n");
    }

    #[test]
    fn multi_line() {
        assert_eq!(
            Reply::new(250, "host1.example.com Hello host2.example.com\r\nAUTH PLAIN").fold(),
            "250-host1.example.com Hello host2.example.com\r\n250 AUTH PLAIN\r\n"
        );
    }

    #[test]
    fn empty_text() {
        assert_eq!(Reply::new(334, "").fold(), "334 \r\n");
    }
}
