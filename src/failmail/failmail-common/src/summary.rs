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
use crate::{message::ReceivedMessage, KeyExpr};
use time::format_description::well_known::Rfc2822;

/// The result of folding the messages of one group key together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniqueMessage {
    /// Earliest `Date:` header seen in the group, when any parsed.
    pub start: Option<time::OffsetDateTime>,
    /// Latest `Date:` header seen in the group, when any parsed.
    pub end: Option<time::OffsetDateTime>,
    /// Representative body (the last message's).
    pub body: String,
    /// Representative subject (the last message's).
    pub subject: String,
    /// The group key this message stands for.
    pub template: String,
    /// How many received messages folded into this one.
    pub count: usize,
}

/// An envelope plus payload, ready to hand to an upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    /// Envelope sender.
    pub from: String,
    /// Envelope recipients.
    pub to: Vec<String>,
    /// The SMTP DATA payload.
    pub data: Vec<u8>,
    /// One line describing the message, for logs.
    pub description: String,
}

/// The digest built from one batch: a single recipient, the messages that
/// were rolled together, and their per-group compaction.
#[derive(Debug, Clone)]
pub struct SummaryMessage {
    /// Fixed sender address of this process.
    pub from: String,
    /// The batch's recipient.
    pub to: String,
    /// Derived subject line.
    pub subject: String,
    /// Flush time.
    pub date: time::OffsetDateTime,
    /// Every message of the batch.
    pub received: Vec<std::sync::Arc<ReceivedMessage>>,
    /// The batch reduced by group key.
    pub uniques: Vec<UniqueMessage>,
}

/// Reduce messages to one [`UniqueMessage`] per distinct group key,
/// preserving first-appearance order.
///
/// Body and subject are overwritten by each successive message of a group
/// (last writer wins); dates keep the min/max over parseable `Date:`
/// headers; counts are exact.
#[must_use]
pub fn compact(
    group: &KeyExpr,
    received: &[std::sync::Arc<ReceivedMessage>],
) -> Vec<UniqueMessage> {
    let mut by_key = std::collections::HashMap::<String, usize>::new();
    let mut result = Vec::<UniqueMessage>::new();

    for msg in received {
        let key = group.eval(&msg.mail);
        let index = *by_key.entry(key.clone()).or_insert_with(|| {
            result.push(UniqueMessage {
                start: None,
                end: None,
                body: String::new(),
                subject: String::new(),
                template: key,
                count: 0,
            });
            result.len() - 1
        });
        let unique = &mut result[index];

        if let Some(date) = msg.date() {
            unique.start = Some(unique.start.map_or(date, |start| start.min(date)));
            unique.end = Some(unique.end.map_or(date, |end| end.max(date)));
        }
        unique.body = msg.mail.body().to_string();
        unique.subject = msg.mail.subject().to_string();
        unique.count += 1;
    }
    result
}

/// Roll a batch of messages into a [`SummaryMessage`] addressed to `to`.
#[must_use]
pub fn summarize(
    group: &KeyExpr,
    from: &str,
    to: &str,
    received: Vec<std::sync::Arc<ReceivedMessage>>,
    date: time::OffsetDateTime,
) -> SummaryMessage {
    let uniques = compact(group, &received);

    let instances = plural(received.len(), "instance", "instances");
    let subject = if uniques.len() == 1 {
        format!("[failmail] {instances}: {}", uniques[0].subject)
    } else {
        format!(
            "[failmail] {instances} of {}",
            plural(uniques.len(), "message", "messages")
        )
    };

    SummaryMessage {
        from: from.to_string(),
        to: to.to_string(),
        subject,
        date,
        received,
        uniques,
    }
}

impl SummaryMessage {
    /// Total received count and the oldest/newest `Date:` over all groups.
    #[must_use]
    pub fn stats(&self) -> (usize, Option<time::OffsetDateTime>, Option<time::OffsetDateTime>) {
        let total = self.uniques.iter().map(|u| u.count).sum();
        let oldest = self.uniques.iter().filter_map(|u| u.start).min();
        let newest = self.uniques.iter().filter_map(|u| u.end).max();
        (total, oldest, newest)
    }

    /// The RFC822 header block of the digest.
    #[must_use]
    pub fn headers(&self) -> String {
        format!(
            "From: {}\r\nTo: {}\r\nSubject: {}\r\nDate: {}\r\n\r\n",
            self.from,
            self.to,
            self.subject,
            fmt_date(Some(self.date)),
        )
    }

    /// The complete RFC822 bytestring of the digest: headers, the
    /// `--- Failmail ---` totals block, then one block per unique group.
    #[must_use]
    pub fn contents(&self) -> Vec<u8> {
        let (total, oldest, newest) = self.stats();

        let mut groups = String::new();
        for (i, unique) in self.uniques.iter().enumerate() {
            groups.push_str(&format!(
                "\r\n- Message group {} of {}: {} instances\r\n",
                i + 1,
                self.uniques.len(),
                unique.count
            ));
            groups.push_str(&format!(
                "  From {} to {}\r\n\r\n",
                fmt_date(unique.start),
                fmt_date(unique.end)
            ));
            groups.push_str(&format!(
                "Subject: {:?}\r\nBody:\r\n{}\r\n",
                unique.subject, unique.body
            ));
        }

        let mut buf = self.headers();
        buf.push_str("--- Failmail ---\r\n");
        buf.push_str(&format!(
            "Total messages: {}\r\nUnique messages: {}\r\n",
            total,
            self.uniques.len()
        ));
        buf.push_str(&format!(
            "Oldest message: {}\r\nNewest message: {}\r\n",
            fmt_date(oldest),
            fmt_date(newest)
        ));
        buf.push_str(&groups);
        buf.into_bytes()
    }

    /// Package the digest for the sender.
    #[must_use]
    pub fn into_outgoing(self) -> OutgoingMessage {
        let description = self.subject.clone();
        OutgoingMessage {
            from: self.from.clone(),
            to: vec![self.to.clone()],
            data: self.contents(),
            description,
        }
    }
}

fn fmt_date(date: Option<time::OffsetDateTime>) -> String {
    date.and_then(|d| d.format(&Rfc2822).ok())
        .unwrap_or_else(|| "unknown".to_string())
}

/// `1 instance` / `2 instances`.
#[must_use]
pub fn plural(count: usize, singular: &str, plural: &str) -> String {
    if count == 1 {
        format!("{count} {singular}")
    } else {
        format!("{count} {plural}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use time::macros::datetime;

    fn received(raw: &str) -> Arc<ReceivedMessage> {
        Arc::new(
            ReceivedMessage::new(
                "<test@example.com>".to_string(),
                vec!["<test2@example.com>".to_string()],
                None,
                raw.to_string(),
            )
            .unwrap(),
        )
    }

    fn subject_key() -> KeyExpr {
        KeyExpr::parse("subject").unwrap()
    }

    #[test]
    fn compact_folds_same_subject() {
        let msgs = vec![
            received("Date: Tue, 01 Jul 2014 12:34:56 -0400\r\nSubject: test\r\n\r\ntest body 1\r\n"),
            received("Date: Wed, 02 Jul 2014 12:34:56 -0400\r\nSubject: test\r\n\r\ntest body 2\r\n"),
        ];
        let uniques = compact(&subject_key(), &msgs);

        assert_eq!(uniques.len(), 1);
        let unique = &uniques[0];
        assert_eq!(unique.count, 2);
        assert_eq!(unique.start, Some(datetime!(2014-07-01 12:34:56 -04:00)));
        assert_eq!(unique.end, Some(datetime!(2014-07-02 12:34:56 -04:00)));
        assert_eq!(unique.subject, "test");
        // last writer wins
        assert_eq!(unique.body, "test body 2\r\n");
    }

    #[test]
    fn compact_counts_cover_every_message() {
        let msgs = vec![
            received("Subject: a\r\n\r\nx\r\n"),
            received("Subject: b\r\n\r\nx\r\n"),
            received("Subject: a\r\n\r\nx\r\n"),
        ];
        let uniques = compact(&subject_key(), &msgs);
        assert_eq!(uniques.len(), 2);
        assert_eq!(uniques.iter().map(|u| u.count).sum::<usize>(), msgs.len());
        // first-appearance order
        assert_eq!(uniques[0].template, "a");
        assert_eq!(uniques[1].template, "b");
    }

    #[test]
    fn summarize_single_group_subject() {
        let msgs = vec![
            received("Subject: test\r\n\r\n1\r\n"),
            received("Subject: test\r\n\r\n2\r\n"),
        ];
        let summary = summarize(
            &subject_key(),
            "failmail@example.com",
            "test2@example.com",
            msgs,
            datetime!(2014-03-01 00:00:00 UTC),
        );
        assert_eq!(summary.subject, "[failmail] 2 instances: test");
        assert_eq!(summary.to, "test2@example.com");
    }

    #[test]
    fn summarize_multiple_groups_subject() {
        let msgs = vec![
            received("Subject: first\r\n\r\n1\r\n"),
            received("Subject: second\r\n\r\n2\r\n"),
        ];
        let summary = summarize(
            &subject_key(),
            "failmail@example.com",
            "test2@example.com",
            msgs,
            datetime!(2014-03-01 00:00:00 UTC),
        );
        assert_eq!(summary.subject, "[failmail] 2 instances of 2 messages");
    }

    #[test]
    fn singular_subject() {
        let summary = summarize(
            &subject_key(),
            "failmail@example.com",
            "test2@example.com",
            vec![received("Subject: only\r\n\r\nx\r\n")],
            datetime!(2014-03-01 00:00:00 UTC),
        );
        assert_eq!(summary.subject, "[failmail] 1 instance: only");
    }

    #[test]
    fn headers_are_rfc822() {
        let summary = summarize(
            &subject_key(),
            "failmail@example.com",
            "test2@example.com",
            vec![received("Subject: test\r\n\r\nx\r\n")],
            datetime!(2014-03-01 00:00:00 UTC),
        );
        assert_eq!(
            summary.headers(),
            "From: failmail@example.com\r\nTo: test2@example.com\r\n\
             Subject: [failmail] 1 instance: test\r\n\
             Date: Sat, 01 Mar 2014 00:00:00 +0000\r\n\r\n"
        );
    }

    #[test]
    fn contents_carry_totals_and_groups() {
        let msgs = vec![
            received("Date: Tue, 01 Jul 2014 12:34:56 -0400\r\nSubject: test\r\n\r\nbody\r\n"),
            received("Date: Wed, 02 Jul 2014 12:34:56 -0400\r\nSubject: test\r\n\r\nbody\r\n"),
        ];
        let summary = summarize(
            &subject_key(),
            "failmail@example.com",
            "test2@example.com",
            msgs,
            datetime!(2014-03-01 00:00:00 UTC),
        );
        let contents = String::from_utf8(summary.contents()).unwrap();

        assert!(contents.contains("--- Failmail ---\r\n"));
        assert!(contents.contains("Total messages: 2\r\nUnique messages: 1\r\n"));
        assert!(contents.contains("Oldest message: Tue, 01 Jul 2014 12:34:56 -0400\r\n"));
        assert!(contents.contains("Newest message: Wed, 02 Jul 2014 12:34:56 -0400\r\n"));
        assert!(contents.contains("- Message group 1 of 1: 2 instances\r\n"));
        assert!(contents.contains("Subject: \"test\"\r\nBody:\r\nbody\r\n"));
    }

    #[test]
    fn plural_forms() {
        assert_eq!(plural(0, "message", "messages"), "0 messages");
        assert_eq!(plural(1, "message", "messages"), "1 message");
        assert_eq!(plural(11, "message", "messages"), "11 messages");
    }
}
