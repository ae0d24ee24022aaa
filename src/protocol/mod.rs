//! Incremental SMTP command state machine.
//!
//! [`Protocol`] consumes one complete line at a time and answers with an optional [`Reply`].
//! Everything that needs policy or a backend goes through the [`Handler`] supplied to
//! [`Protocol::parse`], so the state machine itself never knows who is on the other side.

mod reply;

pub use reply::{Reply, CLOSING};

/// Longest command line accepted, CRLF excluded (RFC 5321 §4.5.3.1.4).
pub const MAX_COMMAND_LINE: usize = 510;

/// Longest message body line accepted, CRLF excluded (RFC 5321 §4.5.3.1.6).
pub const MAX_TEXT_LINE: usize = 998;

/// Base64 of `Username:`.
const LOGIN_USERNAME_CHALLENGE: &str = "VXNlcm5hbWU6";
/// Base64 of `Password:`.
const LOGIN_PASSWORD_CHALLENGE: &str = "UGFzc3dvcmQ6";

/// Transaction phase of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Greeting sent, waiting for HELO/EHLO.
    Establish,
    /// `AUTH PLAIN` without initial response, waiting for the credentials line.
    AuthPlain,
    /// `AUTH LOGIN`, waiting for the username.
    AuthLogin,
    /// `AUTH LOGIN`, waiting for the password.
    AuthLoginPassword,
    /// Greeted, no transaction open yet.
    Mail,
    /// Sender accepted, collecting recipients.
    Rcpt,
    /// Collecting the message body.
    Data,
    /// QUIT received.
    Done,
}

/// A message envelope built up over one mail transaction.
///
/// Recipients keep RCPT order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub helo: String,
    pub from: String,
    pub to: Vec<String>,
    pub data: String,
}

/// Hooks the state machine calls while processing lines.
pub trait Handler {
    fn log(&mut self, message: &str);

    /// Runs before any command is dispatched. A returned reply is sent instead of running the
    /// command.
    fn filter_verb(&mut self, state: State, verb: &str, args: &str) -> Option<Reply>;

    fn validate_sender(&mut self, from: &str) -> bool;

    fn validate_recipient(&mut self, from: &str, to: &str) -> bool;

    fn max_recipients(&mut self) -> usize;

    /// Largest body, in bytes after dot-unstuffing, accepted in one DATA phase.
    fn max_message_size(&mut self) -> usize;

    /// `Err` carries the reply to send on failure.
    fn validate_authentication(&mut self, mechanism: &str, args: &[String]) -> Result<(), Reply>;

    fn authentication_mechanisms(&mut self) -> Vec<String>;

    /// Called once per completed DATA phase with the finished envelope.
    fn message_received(&mut self, message: &Message) -> Result<String, Reply>;

    fn tls_available(&mut self) -> bool {
        false
    }
}

#[derive(Debug)]
pub struct Protocol {
    hostname: String,
    state: State,
    message: Message,
    authenticated: bool,
    login_username: Option<String>,
    tls_requested: bool,
    /// Set when the body being received can no longer be accepted; sent once it ends.
    data_rejection: Option<Reply>,
}

impl Protocol {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            state: State::Establish,
            message: Message::default(),
            authenticated: false,
            login_username: None,
            tls_requested: false,
            data_rejection: None,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// The greeting that opens a session.
    pub fn start(&mut self) -> Reply {
        self.state = State::Establish;
        Reply::greeting(&self.hostname)
    }

    /// Most bytes a caller should buffer without a line feed in the current state.
    pub fn line_limit(&self) -> usize {
        match self.state {
            State::Data => MAX_TEXT_LINE + 2,
            _ => MAX_COMMAND_LINE + 2,
        }
    }

    /// Reports a line that outgrew [`Protocol::line_limit`] and is being dropped up to the
    /// next line feed. Inside DATA the transaction fails when the body ends, so no reply is
    /// due yet.
    pub fn line_overflow(&mut self) -> Option<Reply> {
        match self.state {
            State::Data => {
                self.reject_data(Reply::line_too_long());
                None
            }
            State::AuthPlain | State::AuthLogin | State::AuthLoginPassword => {
                self.login_username = None;
                self.state = State::Mail;
                Some(Reply::line_too_long())
            }
            _ => Some(Reply::line_too_long()),
        }
    }

    /// Returns true once after a STARTTLS command was accepted.
    pub fn take_tls_request(&mut self) -> bool {
        std::mem::take(&mut self.tls_requested)
    }

    /// Forgets everything learned before a TLS upgrade, as RFC 3207 §4.2 requires. The
    /// authentication flag survives because an identity is never unset.
    pub fn restart(&mut self) {
        self.state = State::Establish;
        self.message = Message::default();
        self.login_username = None;
        self.tls_requested = false;
        self.data_rejection = None;
    }

    /// Processes the first complete line in `buffer`.
    ///
    /// A line ends at a line feed; one carriage return before it is dropped, so bare LF
    /// endings are accepted as well as CRLF. Returns the unconsumed rest of the buffer. When
    /// the buffer holds no line feed it is returned untouched and no reply is produced.
    pub fn parse<'b>(
        &mut self,
        buffer: &'b [u8],
        handler: &mut dyn Handler,
    ) -> (&'b [u8], Option<Reply>) {
        let Some(end) = buffer.iter().position(|&b| b == b'\n') else {
            return (buffer, None);
        };

        let raw = match buffer[..end].last() {
            Some(b'\r') => &buffer[..end - 1],
            _ => &buffer[..end],
        };
        let line = String::from_utf8_lossy(raw);
        let rest = &buffer[end + 1..];

        let reply = match self.state {
            State::Data => self.data_line(&line, handler),
            State::AuthPlain => Some(self.auth_plain_response(&line, handler)),
            State::AuthLogin => Some(self.auth_login_username(&line)),
            State::AuthLoginPassword => Some(self.auth_login_password(&line, handler)),
            _ => Some(self.command(&line, handler)),
        };

        (rest, reply)
    }

    fn command(&mut self, line: &str, handler: &mut dyn Handler) -> Reply {
        if line.len() > MAX_COMMAND_LINE {
            return Reply::line_too_long();
        }

        let trimmed = line.trim();
        let (verb, args) = match trimmed.split_once(' ') {
            Some((verb, args)) => (verb, args.trim()),
            None => (trimmed, ""),
        };
        let verb = verb.to_ascii_uppercase();

        handler.log(&format!(
            "In state {:?}, got command '{}', args '{}'",
            self.state, verb, args
        ));

        if verb.is_empty() {
            return Reply::unrecognised_command();
        }

        if let Some(reply) = handler.filter_verb(self.state, &verb, args) {
            handler.log(&format!("Command {} rejected by verb filter", verb));
            return reply;
        }

        match verb.as_str() {
            "HELO" => self.helo(args),
            "EHLO" => self.ehlo(args, handler),
            "MAIL" => self.mail(args, handler),
            "RCPT" => self.rcpt(args, handler),
            "DATA" => self.data(),
            "RSET" => {
                self.reset();
                Reply::ok()
            }
            "NOOP" => Reply::ok(),
            "QUIT" => {
                self.state = State::Done;
                Reply::bye()
            }
            "AUTH" => self.auth(args, handler),
            "STARTTLS" => self.starttls(handler),
            "VRFY" | "EXPN" => Reply::cannot_verify(),
            _ => Reply::unrecognised_command(),
        }
    }

    fn reset(&mut self) {
        self.message = Message {
            helo: std::mem::take(&mut self.message.helo),
            ..Message::default()
        };
        if matches!(self.state, State::Rcpt | State::Data) {
            self.state = State::Mail;
        }
    }

    fn greet(&mut self, args: &str) {
        self.message = Message {
            helo: args.to_string(),
            ..Message::default()
        };
        self.state = State::Mail;
    }

    fn helo(&mut self, args: &str) -> Reply {
        if args.is_empty() {
            return Reply::syntax_error("HELO requires a domain");
        }
        self.greet(args);
        Reply::new(250, format!("{} Hello {}", self.hostname, args))
    }

    fn ehlo(&mut self, args: &str, handler: &mut dyn Handler) -> Reply {
        if args.is_empty() {
            return Reply::syntax_error("EHLO requires a domain");
        }
        self.greet(args);

        let mut lines = vec![format!("{} Hello {}", self.hostname, args)];
        if handler.tls_available() {
            lines.push("STARTTLS".to_string());
        }
        let mechanisms = handler.authentication_mechanisms();
        if !self.authenticated && !mechanisms.is_empty() {
            lines.push(format!("AUTH {}", mechanisms.join(" ")));
        }
        Reply::multiline(250, lines)
    }

    fn mail(&mut self, args: &str, handler: &mut dyn Handler) -> Reply {
        if self.state != State::Mail {
            return Reply::bad_sequence();
        }
        let Some(from) = path_argument(args, "FROM:") else {
            return Reply::syntax_error("expected MAIL FROM:<address>");
        };
        if !handler.validate_sender(from) {
            return Reply::invalid_sender(from);
        }

        self.message.from = from.to_string();
        self.state = State::Rcpt;
        Reply::sender_ok(from)
    }

    fn rcpt(&mut self, args: &str, handler: &mut dyn Handler) -> Reply {
        if self.state != State::Rcpt {
            return Reply::bad_sequence();
        }
        let Some(to) = path_argument(args, "TO:").filter(|to| !to.is_empty()) else {
            return Reply::syntax_error("expected RCPT TO:<address>");
        };

        if self.message.to.len() >= handler.max_recipients() {
            handler.log(&format!("Recipient limit reached, refusing {}", to));
            return Reply::too_many_recipients();
        }
        if !handler.validate_recipient(&self.message.from, to) {
            return Reply::invalid_recipient(to);
        }

        self.message.to.push(to.to_string());
        Reply::recipient_ok(to)
    }

    fn data(&mut self) -> Reply {
        if self.state != State::Rcpt || self.message.to.is_empty() {
            return Reply::bad_sequence();
        }
        self.state = State::Data;
        Reply::data_start()
    }

    fn data_line(&mut self, line: &str, handler: &mut dyn Handler) -> Option<Reply> {
        if line != "." {
            if self.data_rejection.is_some() {
                return None;
            }
            if line.len() > MAX_TEXT_LINE {
                handler.log(&format!("Body line of {} bytes, discarding message", line.len()));
                self.reject_data(Reply::line_too_long());
                return None;
            }

            // RFC 5321 §4.5.2 transparency
            let line = line.strip_prefix('.').unwrap_or(line);
            let limit = handler.max_message_size();
            if self.message.data.len() + line.len() + 2 > limit {
                handler.log(&format!("Message exceeds {} bytes, discarding message", limit));
                self.reject_data(Reply::message_too_large());
                return None;
            }
            self.message.data.push_str(line);
            self.message.data.push_str("\r\n");
            return None;
        }

        let next = Message {
            helo: self.message.helo.clone(),
            ..Message::default()
        };
        let message = std::mem::replace(&mut self.message, next);
        self.state = State::Mail;

        if let Some(reply) = self.data_rejection.take() {
            handler.log(&format!("Refused message from {}: {}", message.from, reply));
            return Some(reply);
        }

        handler.log(&format!(
            "Got EOF, message from {} for {} recipient(s)",
            message.from,
            message.to.len()
        ));

        Some(match handler.message_received(&message) {
            Ok(id) => Reply::queued(&id),
            Err(reply) => reply,
        })
    }

    /// Keeps the first reason; the partial body is dropped.
    fn reject_data(&mut self, reply: Reply) {
        if self.data_rejection.is_none() {
            self.data_rejection = Some(reply);
        }
        self.message.data = String::new();
    }

    fn auth(&mut self, args: &str, handler: &mut dyn Handler) -> Reply {
        if self.authenticated {
            return Reply::already_authenticated();
        }
        if self.state != State::Mail {
            return Reply::bad_sequence();
        }

        let (mechanism, initial) = match args.split_once(' ') {
            Some((mechanism, initial)) => (mechanism, Some(initial.trim())),
            None => (args, None),
        };
        if mechanism.is_empty() {
            return Reply::syntax_error("AUTH requires a mechanism");
        }
        let mechanism = mechanism.to_ascii_uppercase();

        let advertised = handler.authentication_mechanisms();
        if !advertised.iter().any(|m| m.eq_ignore_ascii_case(&mechanism)) {
            return Reply::unsupported_mechanism();
        }

        match (mechanism.as_str(), initial) {
            ("PLAIN", Some(response)) => self.authenticate(handler, "PLAIN", vec![response.to_string()]),
            ("PLAIN", None) => {
                self.state = State::AuthPlain;
                Reply::auth_challenge("")
            }
            ("LOGIN", Some(username)) => {
                self.login_username = Some(username.to_string());
                self.state = State::AuthLoginPassword;
                Reply::auth_challenge(LOGIN_PASSWORD_CHALLENGE)
            }
            ("LOGIN", None) => {
                self.state = State::AuthLogin;
                Reply::auth_challenge(LOGIN_USERNAME_CHALLENGE)
            }
            _ => Reply::unsupported_mechanism(),
        }
    }

    fn auth_plain_response(&mut self, line: &str, handler: &mut dyn Handler) -> Reply {
        if line == "*" {
            self.state = State::Mail;
            return Reply::auth_cancelled();
        }
        self.authenticate(handler, "PLAIN", vec![line.to_string()])
    }

    fn auth_login_username(&mut self, line: &str) -> Reply {
        if line == "*" {
            self.state = State::Mail;
            return Reply::auth_cancelled();
        }
        self.login_username = Some(line.to_string());
        self.state = State::AuthLoginPassword;
        Reply::auth_challenge(LOGIN_PASSWORD_CHALLENGE)
    }

    fn auth_login_password(&mut self, line: &str, handler: &mut dyn Handler) -> Reply {
        let username = self.login_username.take().unwrap_or_default();
        if line == "*" {
            self.state = State::Mail;
            return Reply::auth_cancelled();
        }
        self.authenticate(handler, "LOGIN", vec![username, line.to_string()])
    }

    fn authenticate(&mut self, handler: &mut dyn Handler, mechanism: &str, args: Vec<String>) -> Reply {
        self.state = State::Mail;
        match handler.validate_authentication(mechanism, &args) {
            Ok(()) => {
                self.authenticated = true;
                Reply::auth_succeeded()
            }
            Err(reply) => reply,
        }
    }

    fn starttls(&mut self, handler: &mut dyn Handler) -> Reply {
        if self.state != State::Mail || !handler.tls_available() {
            return Reply::tls_unavailable();
        }
        self.tls_requested = true;
        Reply::ready_for_tls()
    }
}

/// Extracts the address from `FROM:<addr>` / `TO:<addr>`, ignoring trailing ESMTP parameters.
fn path_argument<'a>(args: &'a str, prefix: &str) -> Option<&'a str> {
    let head = args.get(..prefix.len())?;
    if !head.eq_ignore_ascii_case(prefix) {
        return None;
    }
    let path = args[prefix.len()..].trim_start().strip_prefix('<')?;
    let end = path.find('>')?;
    Some(&path[..end])
}
