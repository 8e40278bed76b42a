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

/// The command line could not be parsed; the session answers `500`.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("unrecognized command: {0:?}")]
pub struct ParseCommandError(pub String);

/// SMTP commands accepted by the receiver.
///
/// See "Simple Mail Transfer Protocol"
/// <https://datatracker.ietf.org/doc/html/rfc5321>
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Event {
    /// Used to identify the SMTP client to the SMTP server.
    /// Syntax = `"HELO" SP ( Domain / address-literal ) CRLF`
    HeloCmd(String),
    /// Same as [`Event::HeloCmd`], requesting SMTP extensions.
    /// Syntax = `"EHLO" SP ( Domain / address-literal ) CRLF`
    EhloCmd(String),
    /// Initiates a mail transaction. The reverse-path is kept as the wire
    /// string (brackets included); the empty form `<>` is permitted.
    /// Syntax = `"MAIL FROM:" Reverse-path CRLF`
    MailCmd(String),
    /// Adds one recipient to the transaction, as the wire string.
    /// Syntax = `"RCPT TO:" Forward-path CRLF`
    RcptCmd(String),
    /// Syntax = `"DATA" CRLF`
    DataCmd,
    /// Aborts the current mail transaction.
    /// Syntax = `"RSET" CRLF`
    RsetCmd,
    /// Syntax = `"VRFY" SP String CRLF`
    VrfyCmd(String),
    /// Syntax = `"NOOP" CRLF`
    NoopCmd,
    /// Syntax = `"QUIT" CRLF`
    QuitCmd,
    /// Authentication, per RFC 4954. The mechanism token matches
    /// `[A-Z0-9_-]+`; the initial response, when present, is base64 text.
    /// Syntax = `"AUTH" SP mechanism [SP initial-response] CRLF`
    AuthCmd {
        /// SASL mechanism token.
        mechanism: String,
        /// Base64 initial response, undecoded.
        initial_response: Option<String>,
    },
    /// See "SMTP Service Extension for Secure SMTP over TLS"
    /// <https://datatracker.ietf.org/doc/html/rfc3207>
    /// Syntax = `"STARTTLS" CRLF`
    StartTls,
}

impl Event {
    /// Parse one command line (without its CRLF terminator).
    ///
    /// # Errors
    ///
    /// * the line does not conform to the accepted grammar
    pub fn parse_cmd(input: &str) -> Result<Self, ParseCommandError> {
        let err = || ParseCommandError(input.to_string());

        let input = input.strip_suffix("\r\n").unwrap_or(input);
        let (verb, args) = match input.split_once(char::is_whitespace) {
            Some((verb, args)) => (verb, args.trim()),
            None => (input, ""),
        };

        match verb.to_ascii_uppercase().as_str() {
            "HELO" if is_domain_or_literal(args) => Ok(Self::HeloCmd(args.to_string())),
            "EHLO" if is_domain_or_literal(args) => Ok(Self::EhloCmd(args.to_string())),

            "MAIL" => {
                let path = strip_keyword(args, "FROM:").ok_or_else(err)?;
                if path == "<>" || is_path(path) {
                    Ok(Self::MailCmd(path.to_string()))
                } else {
                    Err(err())
                }
            }
            "RCPT" => {
                let path = strip_keyword(args, "TO:").ok_or_else(err)?;
                if is_path(path) {
                    Ok(Self::RcptCmd(path.to_string()))
                } else {
                    Err(err())
                }
            }

            "DATA" if args.is_empty() => Ok(Self::DataCmd),
            "RSET" if args.is_empty() => Ok(Self::RsetCmd),
            "NOOP" if args.is_empty() => Ok(Self::NoopCmd),
            "QUIT" if args.is_empty() => Ok(Self::QuitCmd),
            "STARTTLS" if args.is_empty() => Ok(Self::StartTls),

            "VRFY" if !args.is_empty() && !args.contains(char::is_whitespace) => {
                Ok(Self::VrfyCmd(args.to_string()))
            }

            "AUTH" => match args.split_whitespace().collect::<Vec<_>>().as_slice() {
                [mechanism] if is_auth_type(mechanism) => Ok(Self::AuthCmd {
                    mechanism: (*mechanism).to_string(),
                    initial_response: None,
                }),
                [mechanism, payload] if is_auth_type(mechanism) && is_base64(payload) => {
                    Ok(Self::AuthCmd {
                        mechanism: (*mechanism).to_string(),
                        initial_response: Some((*payload).to_string()),
                    })
                }
                _ => Err(err()),
            },

            _ => Err(err()),
        }
    }
}

/// Strip a case-insensitive keyword (`FROM:` / `TO:`) and the optional
/// whitespace after it.
fn strip_keyword<'a>(args: &'a str, keyword: &str) -> Option<&'a str> {
    let head = args.get(..keyword.len())?;
    if !head.eq_ignore_ascii_case(keyword) {
        return None;
    }
    Some(args[keyword.len()..].trim_start())
}

fn is_auth_type(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| matches!(c, 'A'..='Z' | '0'..='9' | '-' | '_'))
}

fn is_base64(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '/' | '='))
}

fn is_domain_or_literal(s: &str) -> bool {
    if let Some(literal) = s.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
        return literal.parse::<std::net::Ipv4Addr>().is_ok()
            || literal
                .strip_prefix("IPv6:")
                .map_or(false, |v6| v6.parse::<std::net::Ipv6Addr>().is_ok());
    }
    is_domain(s)
}

fn is_domain(s: &str) -> bool {
    !s.is_empty() && s.split('.').all(is_label)
}

fn is_label(s: &str) -> bool {
    s.starts_with(|c: char| c.is_ascii_alphabetic())
        && s.ends_with(|c: char| c.is_ascii_alphanumeric())
        && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
}

/// A bracketed mailbox: `<local-part@domain>`.
fn is_path(s: &str) -> bool {
    let Some(mailbox) = s.strip_prefix('<').and_then(|s| s.strip_suffix('>')) else {
        return false;
    };
    let Some((local, domain)) = mailbox.rsplit_once('@') else {
        return false;
    };
    is_local_part(local) && is_domain_or_literal(domain)
}

fn is_local_part(s: &str) -> bool {
    if s.len() >= 2 && s.starts_with('"') && s.ends_with('"') {
        return s[1..s.len() - 1]
            .chars()
            .all(|c| !c.is_ascii_control() && !matches!(c, ' ' | '"' | '\\'));
    }
    !s.is_empty()
        && !s.starts_with('.')
        && !s.ends_with('.')
        && s.chars().all(|c| {
            !c.is_ascii_control()
                && !matches!(
                    c,
                    ' ' | '<' | '>' | '(' | ')' | '[' | ']' | '\\' | ',' | ';' | ':' | '@' | '"'
                )
        })
}
