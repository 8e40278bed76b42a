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
use failmail_common::{OutgoingMessage, SummaryMessage};
use time::format_description::well_known::Rfc2822;

/// Turns a [`SummaryMessage`] into the outgoing payload.
#[derive(Debug, Default)]
pub enum SummaryRenderer {
    /// Use [`SummaryMessage::contents`] directly.
    #[default]
    None,
    /// Substitute the summary into a template body read from the configured
    /// file. Recognized placeholders: `{from}`, `{to}`, `{subject}`,
    /// `{date}`, `{total}`, `{unique}`, `{oldest}`, `{newest}`, `{groups}`.
    /// Anything else is left verbatim.
    Template(String),
}

impl SummaryRenderer {
    /// The renderer selected by the configuration: a template one when
    /// `summary.template` is set.
    ///
    /// # Errors
    ///
    /// * the template file cannot be read
    pub fn from_config(config: &failmail_config::Config) -> anyhow::Result<Self> {
        match &config.summary.template {
            None => Ok(Self::None),
            Some(path) => {
                let template = std::fs::read_to_string(path).map_err(|e| {
                    anyhow::anyhow!("cannot read template `{}`: {e}", path.display())
                })?;
                Ok(Self::Template(template))
            }
        }
    }

    ///
    #[must_use]
    pub fn render(&self, summary: SummaryMessage) -> OutgoingMessage {
        match self {
            Self::None => summary.into_outgoing(),
            Self::Template(template) => render_template(template, &summary),
        }
    }
}

fn render_template(template: &str, summary: &SummaryMessage) -> OutgoingMessage {
    let (total, oldest, newest) = summary.stats();

    let mut groups = String::new();
    for (i, unique) in summary.uniques.iter().enumerate() {
        groups.push_str(&format!(
            "- Message group {} of {}: {} instances\nSubject: {:?}\n{}\n",
            i + 1,
            summary.uniques.len(),
            unique.count,
            unique.subject,
            unique.body,
        ));
    }

    let body = template
        .replace("{from}", &summary.from)
        .replace("{to}", &summary.to)
        .replace("{subject}", &summary.subject)
        .replace("{date}", &fmt_date(Some(summary.date)))
        .replace("{total}", &total.to_string())
        .replace("{unique}", &summary.uniques.len().to_string())
        .replace("{oldest}", &fmt_date(oldest))
        .replace("{newest}", &fmt_date(newest))
        .replace("{groups}", &groups);

    let mut data = summary.headers().into_bytes();
    data.extend_from_slice(&normalize_newlines(&body));

    OutgoingMessage {
        from: summary.from.clone(),
        to: vec![summary.to.clone()],
        data,
        description: summary.subject.clone(),
    }
}

fn fmt_date(date: Option<time::OffsetDateTime>) -> String {
    date.and_then(|d| d.format(&Rfc2822).ok())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Rewrite lone `\n` line endings to `\r\n`, leaving existing `\r\n` pairs
/// alone.
fn normalize_newlines(s: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(s.len());
    let mut previous = 0_u8;
    for &byte in s.as_bytes() {
        if byte == b'\n' && previous != b'\r' {
            out.extend_from_slice(b"\r\n");
        } else {
            out.push(byte);
        }
        previous = byte;
    }
    out
}
