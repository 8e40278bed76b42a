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
use crate::message::Mail;

/// A key expression, evaluated against a message's headers to produce the
/// batch key (which summary a message lands in) or the group key (which
/// messages fold together within a summary).
///
/// Accepted forms:
///
/// * `header:<Name>`: the value of the named header, empty when absent
/// * `subject`: the Subject header
/// * `match:<regex>`: the part of the subject matched by the regex
/// * `replace:<regex>:<template>`: the subject with every match of the
///   regex replaced through the template (capture references allowed)
#[derive(Debug, Clone)]
pub enum KeyExpr {
    /// `header:<Name>`
    Header(String),
    /// `subject`
    Subject,
    /// `match:<regex>`
    Match(regex::Regex),
    /// `replace:<regex>:<template>`
    Replace(regex::Regex, String),
}

impl KeyExpr {
    /// Parse an expression from its configuration string.
    ///
    /// # Errors
    ///
    /// * unknown expression form
    /// * invalid regex in `match:` / `replace:`
    pub fn parse(expr: &str) -> anyhow::Result<Self> {
        if expr == "subject" {
            return Ok(Self::Subject);
        }
        if let Some(name) = expr.strip_prefix("header:") {
            anyhow::ensure!(!name.is_empty(), "empty header name in key expression");
            return Ok(Self::Header(name.to_string()));
        }
        if let Some(pattern) = expr.strip_prefix("match:") {
            return Ok(Self::Match(regex::Regex::new(pattern)?));
        }
        if let Some(rest) = expr.strip_prefix("replace:") {
            // the template follows the last colon, so the pattern may
            // contain colons of its own
            let (pattern, template) = rest
                .rsplit_once(':')
                .ok_or_else(|| anyhow::anyhow!("replace: expects `replace:<regex>:<template>`"))?;
            return Ok(Self::Replace(
                regex::Regex::new(pattern)?,
                template.to_string(),
            ));
        }
        anyhow::bail!("unknown key expression: {expr:?}")
    }

    /// Evaluate the expression against a parsed message.
    #[must_use]
    pub fn eval(&self, mail: &Mail) -> String {
        match self {
            Self::Header(name) => mail.get(name).unwrap_or("").to_string(),
            Self::Subject => mail.subject().to_string(),
            Self::Match(re) => re
                .find(mail.subject())
                .map(|m| m.as_str().to_string())
                .unwrap_or_default(),
            Self::Replace(re, template) => {
                re.replace_all(mail.subject(), template.as_str()).to_string()
            }
        }
    }
}
