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

/// Normalize an email address for use as a batching key: the display name
/// and angle brackets are stripped and the address lowercased. Anything that
/// does not look like an address passes through verbatim.
///
/// Normalization is idempotent.
#[must_use]
pub fn normalize_address(email: &str) -> String {
    let trimmed = email.trim();

    let candidate = match (trimmed.rfind('<'), trimmed.ends_with('>')) {
        (Some(open), true) => &trimmed[open + 1..trimmed.len() - 1],
        _ => trimmed,
    };

    if is_bare_address(candidate) {
        candidate.to_ascii_lowercase()
    } else {
        email.to_string()
    }
}

fn is_bare_address(s: &str) -> bool {
    match s.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.is_empty()
                && !domain.contains('@')
                && !s.contains(char::is_whitespace)
                && !s.contains(['<', '>'])
        }
        None => false,
    }
}

/// Rewrites recipient addresses at ingest time, from a regex source pattern
/// to a replacement template (`$1`-style capture references allowed).
///
/// An unset source disables rewriting.
#[derive(Debug, Clone, Default)]
pub struct AddressRewriter {
    /// Pattern matched against each recipient.
    pub source: Option<regex::Regex>,
    /// Expansion template for every match of `source`.
    pub dest: String,
}

impl AddressRewriter {
    /// Rewrite every address, deduplicate, and return the result in a
    /// deterministic (sorted) order.
    #[must_use]
    pub fn rewrite_all(&self, addresses: &[String]) -> Vec<String> {
        let rewritten = addresses
            .iter()
            .map(|addr| self.rewrite(addr))
            .collect::<std::collections::BTreeSet<_>>();
        rewritten.into_iter().collect()
    }

    /// Rewrite one address. Every match of the source pattern is expanded
    /// through the template and the expansions concatenated; a non-matching
    /// address is returned unchanged.
    #[must_use]
    pub fn rewrite(&self, address: &str) -> String {
        let Some(source) = &self.source else {
            return address.to_string();
        };
        if !source.is_match(address) {
            return address.to_string();
        }

        let mut result = String::new();
        for captures in source.captures_iter(address) {
            captures.expand(&self.dest, &mut result);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn normalize_invalid_passes_through() {
        assert_eq!(normalize_address("bad email address"), "bad email address");
    }

    #[test]
    fn normalize_strips_brackets_and_case() {
        assert_eq!(normalize_address("<TEST@example.com>"), "test@example.com");
        assert_eq!(
            normalize_address("Test User <test@example.com>"),
            "test@example.com"
        );
    }

    #[test]
    fn normalize_is_idempotent() {
        for addr in ["<TEST@Example.Com>", "plain@example.com", "not an address"] {
            let once = normalize_address(addr);
            assert_eq!(normalize_address(&once), once);
        }
    }

    #[test]
    fn rewrite_disabled_without_source() {
        let rewriter = AddressRewriter::default();
        assert_eq!(rewriter.rewrite("test@example.com"), "test@example.com");
    }

    #[test]
    fn rewrite_expands_captures() {
        let rewriter = AddressRewriter {
            source: Some(regex::Regex::new(r"(.*)@example\.com").unwrap()),
            dest: "$1@corp.example.com".to_string(),
        };
        assert_eq!(
            rewriter.rewrite("test@example.com"),
            "test@corp.example.com"
        );
        assert_eq!(rewriter.rewrite("test@other.org"), "test@other.org");
    }

    #[test]
    fn rewrite_all_dedups_and_sorts() {
        let rewriter = AddressRewriter {
            source: Some(regex::Regex::new(r".*@example\.com").unwrap()),
            dest: "sink@example.com".to_string(),
        };
        assert_eq!(
            rewriter.rewrite_all(&[
                "b@example.com".to_string(),
                "a@example.com".to_string(),
                "z@other.org".to_string(),
            ]),
            vec!["sink@example.com".to_string(), "z@other.org".to_string()]
        );
    }
}
