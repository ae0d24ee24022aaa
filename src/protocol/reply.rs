use std::fmt;

/// Status code that asks the session to close the connection once the reply is flushed.
pub const CLOSING: u16 = 221;

/// An SMTP reply: a three digit status and one or more text lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub status: u16,
    pub lines: Vec<String>,
}

impl Reply {
    pub fn new(status: u16, text: impl Into<String>) -> Self {
        Self {
            status,
            lines: vec![text.into()],
        }
    }

    pub fn multiline(status: u16, lines: Vec<String>) -> Self {
        Self { status, lines }
    }

    /// Renders the reply as wire lines, each terminated by CRLF.
    ///
    /// Every line but the last uses the `code-text` continuation form of RFC 5321 §4.2.1.
    pub fn lines(&self) -> Vec<String> {
        if self.lines.is_empty() {
            return vec![format!("{}\r\n", self.status)];
        }

        let last = self.lines.len() - 1;
        self.lines
            .iter()
            .enumerate()
            .map(|(i, text)| {
                let separator = if i == last { ' ' } else { '-' };
                format!("{}{}{}\r\n", self.status, separator, text)
            })
            .collect()
    }

    pub fn closes_connection(&self) -> bool {
        self.status == CLOSING
    }

    pub fn greeting(hostname: &str) -> Self {
        Self::new(220, format!("{} ESMTP Service Ready", hostname))
    }

    pub fn ok() -> Self {
        Self::new(250, "Ok")
    }

    pub fn bye() -> Self {
        Self::new(CLOSING, "Bye")
    }

    pub fn sender_ok(from: &str) -> Self {
        Self::new(250, format!("Sender {} ok", from))
    }

    pub fn recipient_ok(to: &str) -> Self {
        Self::new(250, format!("Recipient {} ok", to))
    }

    pub fn queued(id: &str) -> Self {
        Self::new(250, format!("Ok: queued as {}", id))
    }

    pub fn data_start() -> Self {
        Self::new(354, "End data with <CR><LF>.<CR><LF>")
    }

    pub fn ready_for_tls() -> Self {
        Self::new(220, "Ready to start TLS")
    }

    pub fn auth_succeeded() -> Self {
        Self::new(235, "Authentication successful")
    }

    pub fn auth_challenge(challenge: &str) -> Self {
        Self::new(334, challenge)
    }

    pub fn cannot_verify() -> Self {
        Self::new(252, "Cannot VRFY user, but will accept message and attempt delivery")
    }

    pub fn timeout(hostname: &str) -> Self {
        Self::new(421, format!("{} Timeout exceeded, closing connection", hostname))
    }

    pub fn local_error() -> Self {
        Self::new(451, "Requested action aborted: local error in processing")
    }

    pub fn too_many_recipients() -> Self {
        Self::new(452, "Too many recipients")
    }

    pub fn tls_unavailable() -> Self {
        Self::new(454, "TLS not available")
    }

    pub fn unrecognised_command() -> Self {
        Self::new(500, "Unrecognised command")
    }

    pub fn line_too_long() -> Self {
        Self::new(500, "Line too long")
    }

    pub fn syntax_error(detail: &str) -> Self {
        Self::new(501, format!("Syntax error: {}", detail))
    }

    pub fn auth_cancelled() -> Self {
        Self::new(501, "Authentication cancelled")
    }

    pub fn bad_sequence() -> Self {
        Self::new(503, "Bad sequence of commands")
    }

    pub fn already_authenticated() -> Self {
        Self::new(503, "Already authenticated")
    }

    pub fn unsupported_mechanism() -> Self {
        Self::new(504, "Unrecognised authentication type")
    }

    /// The command is valid but the listener demands AUTH before it is allowed.
    pub fn auth_required() -> Self {
        Self::new(530, "Authentication required, command not allowed in this state")
    }

    pub fn invalid_auth() -> Self {
        Self::new(535, "Authentication credentials invalid")
    }

    pub fn invalid_sender(from: &str) -> Self {
        Self::new(550, format!("Invalid sender {}", from))
    }

    pub fn invalid_recipient(to: &str) -> Self {
        Self::new(550, format!("Invalid recipient {}", to))
    }

    pub fn message_too_large() -> Self {
        Self::new(552, "Message exceeds fixed maximum message size")
    }

    pub fn transaction_failed() -> Self {
        Self::new(554, "Transaction failed")
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for line in self.lines() {
            f.write_str(&line)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_line_reply() {
        assert_eq!(Reply::ok().lines(), vec!["250 Ok\r\n".to_string()]);
    }

    #[test]
    fn multiline_reply_uses_continuation_marks() {
        let reply = Reply::multiline(
            250,
            vec!["mx.test Hello".into(), "STARTTLS".into(), "AUTH PLAIN".into()],
        );
        assert_eq!(
            reply.lines(),
            vec![
                "250-mx.test Hello\r\n".to_string(),
                "250-STARTTLS\r\n".to_string(),
                "250 AUTH PLAIN\r\n".to_string(),
            ]
        );
        assert_eq!(
            reply.to_string(),
            "250-mx.test Hello\r\n250-STARTTLS\r\n250 AUTH PLAIN\r\n"
        );
    }

    #[test]
    fn empty_challenge_keeps_separator() {
        assert_eq!(Reply::auth_challenge("").lines(), vec!["334 \r\n".to_string()]);
    }

    #[test]
    fn only_221_closes() {
        assert!(Reply::bye().closes_connection());
        assert!(!Reply::ok().closes_connection());
        assert!(!Reply::timeout("mx").closes_connection());
    }
}
