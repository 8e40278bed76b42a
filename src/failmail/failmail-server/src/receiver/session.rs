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
use super::auth::SingleUserPlainAuth;
use failmail_common::{
    message::{ParseMailError, ReceivedMessage},
    AddressRewriter, Event, Reply,
};

/// Where the session stands with authentication.
#[derive(Debug)]
pub enum AuthState {
    /// No credentials configured; AUTH is refused.
    NotPermitted,
    /// Credentials configured; mail transactions require AUTH first.
    Required(SingleUserPlainAuth),
    /// The client authenticated.
    Authenticated,
}

/// TLS posture of the session.
#[derive(Debug, Clone, Copy)]
pub struct Security {
    /// TLS material is configured; STARTTLS may be offered.
    pub tls_available: bool,
    /// The connection is already encrypted.
    pub tls_active: bool,
    /// AUTH is refused until the session is encrypted.
    pub auth_requires_tls: bool,
}

/// What the connection handler must do after processing one command.
#[derive(Debug)]
pub enum Action {
    /// Write the reply; keep reading commands.
    Reply(Reply),
    /// Write the reply; close the connection.
    Close(Reply),
    /// Write the `354`; read the DATA payload.
    ReadData(Reply),
    /// Write the `334` challenge; read one auth response line.
    ReadAuthResponse(Reply),
    /// Write the `220`; run the TLS server handshake and resume over the
    /// encrypted stream.
    UpgradeTls(Reply),
}

/// The per-connection SMTP state machine.
///
/// The session never touches the transport: it turns parsed [`Event`]s into
/// [`Action`]s, and the connection handler performs the IO (including the
/// TLS upgrade, which is a capability of the transport layer, not of the
/// session).
#[derive(Debug)]
pub struct Session {
    hostname: String,
    auth: AuthState,
    security: Security,
    envelope_from: Option<String>,
    envelope_to: Vec<String>,
    /// A transaction completed; MAIL/RCPT/DATA need RSET first.
    after_data: bool,
}

impl Session {
    ///
    #[must_use]
    pub fn new(hostname: String, auth: AuthState, security: Security) -> Self {
        Self {
            hostname,
            auth,
            security,
            envelope_from: None,
            envelope_to: Vec::new(),
            after_data: false,
        }
    }

    /// The `220` banner sent when the connection opens.
    #[must_use]
    pub fn greeting(&self) -> Reply {
        Reply::new(220, format!("{} Hi there", self.hostname))
    }

    /// Mark the session encrypted, after a completed STARTTLS handshake.
    pub fn set_tls_active(&mut self) {
        self.security.tls_active = true;
    }

    /// Advance the state machine by one parsed command.
    pub fn advance(&mut self, event: Event) -> Action {
        if self.requires_auth(&event) {
            return Action::Reply(Reply::new(530, "Authentication required"));
        }

        match event {
            Event::QuitCmd => Action::Close(Reply::new(221, format!("{} See ya", self.hostname))),
            Event::HeloCmd(_) => Action::Reply(Reply::new(250, "Hello")),
            Event::EhloCmd(domain) => Action::Reply(self.ehlo_reply(&domain)),
            Event::NoopCmd => Action::Reply(Reply::new(250, "Noop")),
            Event::VrfyCmd(_) => Action::Reply(Reply::new(252, "Maybe")),

            Event::RsetCmd => {
                self.reset();
                Action::Reply(Reply::new(250, "Flushed"))
            }

            Event::MailCmd(from) => Action::Reply(self.set_from(from)),
            Event::RcptCmd(to) => Action::Reply(self.add_to(to)),

            Event::DataCmd => {
                if self.after_data || self.envelope_from.is_none() || self.envelope_to.is_empty() {
                    Action::Reply(out_of_sequence())
                } else {
                    Action::ReadData(Reply::new(354, "Go"))
                }
            }

            Event::StartTls => {
                if self.security.tls_active {
                    Action::Reply(Reply::new(500, "Already using TLS"))
                } else if self.security.tls_available {
                    Action::UpgradeTls(Reply::new(220, "Ready to switch to TLS"))
                } else {
                    Action::Reply(Reply::new(502, "Not implemented"))
                }
            }

            Event::AuthCmd {
                mechanism,
                initial_response,
            } => self.start_auth(&mechanism, initial_response),
        }
    }

    /// Commands that never require authentication: QUIT, HELO, EHLO, RSET,
    /// NOOP, AUTH, STARTTLS. Everything else is gated when credentials are
    /// configured.
    fn requires_auth(&self, event: &Event) -> bool {
        matches!(self.auth, AuthState::Required(_))
            && !matches!(
                event,
                Event::QuitCmd
                    | Event::HeloCmd(_)
                    | Event::EhloCmd(_)
                    | Event::RsetCmd
                    | Event::NoopCmd
                    | Event::AuthCmd { .. }
                    | Event::StartTls
            )
    }

    fn ehlo_reply(&self, domain: &str) -> Reply {
        let mut text = format!("{} Hello {domain}\r\nAUTH PLAIN", self.hostname);
        if self.security.tls_available && !self.security.tls_active {
            text.push_str("\r\nSTARTTLS");
        }
        Reply::new(250, text)
    }

    fn reset(&mut self) {
        self.envelope_from = None;
        self.envelope_to.clear();
        self.after_data = false;
    }

    fn set_from(&mut self, from: String) -> Reply {
        if self.after_data || self.envelope_from.is_some() || !self.envelope_to.is_empty() {
            return out_of_sequence();
        }
        self.envelope_from = Some(from);
        Reply::new(250, "OK")
    }

    fn add_to(&mut self, to: String) -> Reply {
        if self.after_data || self.envelope_from.is_none() {
            return out_of_sequence();
        }
        self.envelope_to.push(to);
        Reply::new(250, "OK")
    }

    fn start_auth(&mut self, mechanism: &str, initial_response: Option<String>) -> Action {
        match &self.auth {
            AuthState::Authenticated => return Action::Reply(out_of_sequence()),
            AuthState::NotPermitted => {
                return Action::Reply(Reply::new(502, "Not implemented"));
            }
            AuthState::Required(_) => {}
        }
        if self.security.auth_requires_tls && !self.security.tls_active {
            return Action::Reply(Reply::new(502, "Authentication requires TLS"));
        }
        if mechanism != "PLAIN" {
            return Action::Reply(Reply::new(504, "Unsupported authentication method"));
        }

        match initial_response {
            Some(payload) => Action::Reply(self.check_auth_payload(&payload)),
            None => Action::ReadAuthResponse(Reply::new(334, "")),
        }
    }

    /// Validate one base64 AUTH PLAIN payload, either from the command line
    /// itself or from the continuation line after the `334` challenge.
    pub fn read_auth_response(&mut self, line: &str) -> Reply {
        self.check_auth_payload(line.trim_end_matches("\r\n"))
    }

    fn check_auth_payload(&mut self, payload: &str) -> Reply {
        let AuthState::Required(validator) = &self.auth else {
            return out_of_sequence();
        };

        let Ok(decoded) = base64::decode(payload) else {
            return Reply::new(501, "Invalid base64 data");
        };
        let Ok(decoded) = String::from_utf8(decoded) else {
            return Reply::new(501, "Invalid credentials payload");
        };

        match validator.valid_credentials(&decoded) {
            Err(_) => Reply::new(501, "Malformed credentials payload"),
            Ok(false) => Reply::new(535, "Authentication failed"),
            Ok(true) => {
                self.auth = AuthState::Authenticated;
                Reply::new(235, "Authentication successful")
            }
        }
    }

    /// Complete a transaction with the DATA payload read from the client.
    ///
    /// On success the envelope moves into the returned message (with the
    /// rewriter applied to its recipients) and the session requires RSET
    /// before the next transaction; on a parse failure the envelope is
    /// discarded.
    pub fn data_complete(
        &mut self,
        data: String,
        rewriter: &AddressRewriter,
    ) -> Result<ReceivedMessage, ParseMailError> {
        let envelope_from = self.envelope_from.take().unwrap_or_default();
        let envelope_to = std::mem::take(&mut self.envelope_to);

        let redirected_to = rewriter
            .source
            .is_some()
            .then(|| rewriter.rewrite_all(&envelope_to));

        match ReceivedMessage::new(envelope_from, envelope_to, redirected_to, data) {
            Ok(message) => {
                self.after_data = true;
                Ok(message)
            }
            Err(e) => {
                self.reset();
                Err(e)
            }
        }
    }
}

fn out_of_sequence() -> Reply {
    Reply::new(503, "Command out of sequence")
}

#[cfg(test)]
mod tests {
    use super::*;
    use failmail_config::Credentials;
    use pretty_assertions::assert_eq;

    fn open_session() -> Session {
        Session::new(
            "mail.example.com".to_string(),
            AuthState::NotPermitted,
            Security {
                tls_available: false,
                tls_active: false,
                auth_requires_tls: false,
            },
        )
    }

    fn auth_session(require_tls: bool) -> Session {
        Session::new(
            "mail.example.com".to_string(),
            AuthState::Required(SingleUserPlainAuth::new(Credentials {
                username: "test".to_string(),
                password: "test".to_string(),
            })),
            Security {
                tls_available: false,
                tls_active: false,
                auth_requires_tls: require_tls,
            },
        )
    }

    fn code(action: Action) -> u16 {
        match action {
            Action::Reply(r)
            | Action::Close(r)
            | Action::ReadData(r)
            | Action::ReadAuthResponse(r)
            | Action::UpgradeTls(r) => r.code(),
        }
    }

    fn advance(session: &mut Session, line: &str) -> u16 {
        code(session.advance(Event::parse_cmd(line).unwrap()))
    }

    #[test]
    fn greeting_and_quit() {
        let mut session = open_session();
        assert_eq!(
            session.greeting(),
            Reply::new(220, "mail.example.com Hi there")
        );
        let Action::Close(reply) = session.advance(Event::QuitCmd) else {
            panic!("QUIT must close the session")
        };
        assert_eq!(reply, Reply::new(221, "mail.example.com See ya"));
    }

    #[test]
    fn happy_path() {
        let mut session = open_session();
        assert_eq!(advance(&mut session, "HELO x"), 250);
        assert_eq!(advance(&mut session, "MAIL FROM:<a@x>"), 250);
        assert_eq!(advance(&mut session, "RCPT TO:<b@y>"), 250);
        assert_eq!(advance(&mut session, "DATA"), 354);

        let message = session
            .data_complete(
                "Subject: t\r\n\r\nhi\r\n".to_string(),
                &AddressRewriter::default(),
            )
            .unwrap();
        assert_eq!(message.envelope_from, "<a@x>");
        assert_eq!(message.envelope_to, ["<b@y>"]);
        assert_eq!(message.mail.subject(), "t");
        assert_eq!(message.mail.body(), "hi\r\n");
    }

    #[test]
    fn out_of_sequence_rcpt() {
        let mut session = open_session();
        assert_eq!(advance(&mut session, "HELO x"), 250);
        assert_eq!(advance(&mut session, "RCPT TO:<b@y>"), 503);
    }

    #[test]
    fn transition_table() {
        let mut session = open_session();
        // fresh
        assert_eq!(advance(&mut session, "RCPT TO:<b@y>"), 503);
        assert_eq!(advance(&mut session, "DATA"), 503);
        assert_eq!(advance(&mut session, "MAIL FROM:<a@x>"), 250);
        // have-from
        assert_eq!(advance(&mut session, "MAIL FROM:<a@x>"), 503);
        assert_eq!(advance(&mut session, "DATA"), 503);
        assert_eq!(advance(&mut session, "RCPT TO:<b@y>"), 250);
        // have-from+to: recipients accumulate
        assert_eq!(advance(&mut session, "RCPT TO:<c@z>"), 250);
        assert_eq!(advance(&mut session, "DATA"), 354);
        session
            .data_complete("\r\nbody\r\n".to_string(), &AddressRewriter::default())
            .unwrap();
        // after-data
        assert_eq!(advance(&mut session, "MAIL FROM:<a@x>"), 503);
        assert_eq!(advance(&mut session, "RCPT TO:<b@y>"), 503);
        assert_eq!(advance(&mut session, "DATA"), 503);
        // RSET opens a new transaction
        assert_eq!(advance(&mut session, "RSET"), 250);
        assert_eq!(advance(&mut session, "MAIL FROM:<a@x>"), 250);
    }

    #[test]
    fn data_parse_failure_discards_the_envelope() {
        let mut session = open_session();
        assert_eq!(advance(&mut session, "MAIL FROM:<a@x>"), 250);
        assert_eq!(advance(&mut session, "RCPT TO:<b@y>"), 250);
        assert!(session
            .data_complete("garbage".to_string(), &AddressRewriter::default())
            .is_err());
        // fresh again: MAIL is accepted, DATA is not
        assert_eq!(advance(&mut session, "DATA"), 503);
        assert_eq!(advance(&mut session, "MAIL FROM:<a@x>"), 250);
    }

    #[test]
    fn auth_plain_one_step() {
        // "test\0test\0test"
        let mut session = auth_session(false);
        assert_eq!(advance(&mut session, "AUTH PLAIN dGVzdAB0ZXN0AHRlc3Q="), 235);
        // a second AUTH is out of sequence
        assert_eq!(advance(&mut session, "AUTH PLAIN dGVzdAB0ZXN0AHRlc3Q="), 503);
    }

    #[test]
    fn auth_plain_bad_base64() {
        let mut session = auth_session(false);
        assert_eq!(advance(&mut session, "AUTH PLAIN notbase64"), 501);
    }

    #[test]
    fn auth_plain_wrong_password() {
        // "test\0test\0wrong"
        let mut session = auth_session(false);
        assert_eq!(advance(&mut session, "AUTH PLAIN dGVzdAB0ZXN0AHdyb25n"), 535);
    }

    #[test]
    fn auth_two_part_payload_is_malformed() {
        // "test\0test"
        let mut session = auth_session(false);
        assert_eq!(advance(&mut session, "AUTH PLAIN dGVzdAB0ZXN0"), 501);
    }

    #[test]
    fn auth_challenge_round_trip() {
        let mut session = auth_session(false);
        let action = session.advance(Event::parse_cmd("AUTH PLAIN").unwrap());
        let Action::ReadAuthResponse(challenge) = action else {
            panic!("AUTH without payload must challenge")
        };
        assert_eq!(challenge, Reply::new(334, ""));
        assert_eq!(
            session.read_auth_response("dGVzdAB0ZXN0AHRlc3Q=\r\n").code(),
            235
        );
    }

    #[test]
    fn auth_gates_commands() {
        let mut session = auth_session(false);
        assert_eq!(advance(&mut session, "HELO x"), 250);
        assert_eq!(advance(&mut session, "VRFY test"), 530);
        assert_eq!(advance(&mut session, "MAIL FROM:<a@x>"), 530);
        // never-gated commands pass
        assert_eq!(advance(&mut session, "NOOP"), 250);
        assert_eq!(advance(&mut session, "RSET"), 250);

        assert_eq!(advance(&mut session, "AUTH PLAIN dGVzdAB0ZXN0AHRlc3Q="), 235);
        assert_eq!(advance(&mut session, "MAIL FROM:<a@x>"), 250);
    }

    #[test]
    fn auth_bad_method() {
        let mut session = auth_session(false);
        assert_eq!(advance(&mut session, "AUTH BADMETHOD"), 504);
    }

    #[test]
    fn auth_not_permitted_without_credentials() {
        let mut session = open_session();
        assert_eq!(advance(&mut session, "AUTH PLAIN dGVzdAB0ZXN0AHRlc3Q="), 502);
    }

    #[test]
    fn auth_requires_tls_when_enforced() {
        let mut session = auth_session(true);
        assert_eq!(advance(&mut session, "AUTH PLAIN dGVzdAB0ZXN0AHRlc3Q="), 502);

        session.security.tls_available = true;
        session.set_tls_active();
        assert_eq!(advance(&mut session, "AUTH PLAIN dGVzdAB0ZXN0AHRlc3Q="), 235);
    }

    #[test]
    fn starttls_gating() {
        let mut session = open_session();
        assert_eq!(advance(&mut session, "STARTTLS"), 502);

        session.security.tls_available = true;
        let action = session.advance(Event::StartTls);
        let Action::UpgradeTls(reply) = action else {
            panic!("STARTTLS must upgrade when TLS is available")
        };
        assert_eq!(reply, Reply::new(220, "Ready to switch to TLS"));

        session.set_tls_active();
        assert_eq!(advance(&mut session, "STARTTLS"), 500);
    }

    #[test]
    fn ehlo_advertises_extensions() {
        let mut session = open_session();
        let Action::Reply(reply) = session.advance(Event::parse_cmd("EHLO client.example.com").unwrap()) else {
            panic!("EHLO must reply")
        };
        assert_eq!(
            reply.fold(),
            "250-mail.example.com Hello client.example.com\r\n250 AUTH PLAIN\r\n"
        );

        session.security.tls_available = true;
        let Action::Reply(reply) = session.advance(Event::parse_cmd("EHLO client.example.com").unwrap()) else {
            panic!("EHLO must reply")
        };
        assert_eq!(
            reply.fold(),
            "250-mail.example.com Hello client.example.com\r\n250-AUTH PLAIN\r\n250 STARTTLS\r\n"
        );

        // once encrypted, STARTTLS is no longer advertised
        session.set_tls_active();
        let Action::Reply(reply) = session.advance(Event::parse_cmd("EHLO client.example.com").unwrap()) else {
            panic!("EHLO must reply")
        };
        assert!(!reply.fold().contains("STARTTLS"));
    }

    #[test]
    fn rewriter_fills_redirected_recipients() {
        let mut session = open_session();
        assert_eq!(advance(&mut session, "MAIL FROM:<a@x>"), 250);
        assert_eq!(advance(&mut session, "RCPT TO:<dev@example.com>"), 250);
        assert_eq!(advance(&mut session, "DATA"), 354);

        let rewriter = AddressRewriter {
            source: Some(regex::Regex::new(r"<(.*)@example\.com>").unwrap()),
            dest: "$1@corp.example.com".to_string(),
        };
        let message = session
            .data_complete("Subject: t\r\n\r\nx\r\n".to_string(), &rewriter)
            .unwrap();
        assert_eq!(message.envelope_to, ["<dev@example.com>"]);
        assert_eq!(
            message.redirected_to,
            Some(vec!["dev@corp.example.com".to_string()])
        );
    }
}
