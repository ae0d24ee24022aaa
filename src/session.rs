//! One SMTP conversation over any byte stream.
//!
//! A [`Session`] reads raw chunks, reassembles lines, hands them to the [`Protocol`] and
//! writes back every reply as soon as it is produced. The protocol reaches policy and the
//! backends through the session's callback bridge.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time;

use crate::backend::{AuthService, DeliveryService, Identity};
use crate::config::PolicySet;
use crate::logging::escape;
use crate::protocol::{Handler, Message, Protocol, Reply, State};

const READ_CHUNK: usize = 1024;

/// Verbs a client may use before authenticating on a listener that demands it.
const PRE_AUTH_VERBS: &[&str] = &["RSET", "QUIT", "NOOP", "EHLO", "HELO", "AUTH", "STARTTLS"];

/// Everything a session needs from its listener.
#[derive(Clone)]
pub struct SessionContext {
    pub hostname: String,
    pub policy: PolicySet,
    pub auth: Arc<dyn AuthService>,
    pub delivery: Arc<dyn DeliveryService>,
    pub idle_timeout: Duration,
    /// STARTTLS can be offered on this connection.
    pub tls_offered: bool,
    /// The stream is already wrapped in TLS.
    pub tls_active: bool,
}

/// Why [`Session::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The client sent QUIT and the 221 reply went out.
    Quit,
    /// Zero-length read.
    ClosedByClient,
    ReadError,
    TimedOut,
    /// STARTTLS was accepted; the caller must handshake and [`SuspendedSession::resume`].
    StartTls,
}

/// The callback side of a session: policy, identity and backend handles.
struct Bridge {
    remote_addr: SocketAddr,
    policy: PolicySet,
    auth: Arc<dyn AuthService>,
    delivery: Arc<dyn DeliveryService>,
    identity: Option<Identity>,
    tls_offered: bool,
    tls_active: bool,
}

impl Handler for Bridge {
    fn log(&mut self, message: &str) {
        tracing::debug!(peer = %self.remote_addr, "{}", message);
    }

    fn filter_verb(&mut self, state: State, verb: &str, _args: &str) -> Option<Reply> {
        if self.policy.require_authentication && state == State::Mail && self.identity.is_none() {
            if PRE_AUTH_VERBS.iter().any(|v| v.eq_ignore_ascii_case(verb)) {
                return None;
            }
            return Some(Reply::auth_required());
        }
        None
    }

    fn validate_sender(&mut self, _from: &str) -> bool {
        true
    }

    fn validate_recipient(&mut self, from: &str, to: &str) -> bool {
        self.delivery.will_deliver(to, from, self.identity.as_ref())
    }

    fn max_recipients(&mut self) -> usize {
        self.delivery.max_recipients(self.identity.as_ref())
    }

    fn max_message_size(&mut self) -> usize {
        self.policy.maximum_message_size
    }

    fn validate_authentication(&mut self, mechanism: &str, args: &[String]) -> Result<(), Reply> {
        if self.identity.is_some() {
            return Err(Reply::already_authenticated());
        }

        match self.auth.authenticate(mechanism, args) {
            Ok(Some(identity)) => {
                tracing::info!(peer = %self.remote_addr, identity = %identity, "Authenticated");
                self.identity = Some(identity);
                Ok(())
            }
            Ok(None) => {
                tracing::info!(peer = %self.remote_addr, mechanism, "Authentication failed");
                Err(Reply::invalid_auth())
            }
            Err(e) => {
                tracing::warn!(peer = %self.remote_addr, mechanism, error = %e, "Authentication backend error");
                Err(Reply::invalid_auth())
            }
        }
    }

    fn authentication_mechanisms(&mut self) -> Vec<String> {
        self.auth.mechanisms()
    }

    fn message_received(&mut self, message: &Message) -> Result<String, Reply> {
        match self.delivery.deliver(message) {
            Ok(id) => {
                tracing::info!(peer = %self.remote_addr, id = %id, recipients = message.to.len(), "Stored message");
                Ok(id)
            }
            Err(e) => {
                tracing::warn!(peer = %self.remote_addr, error = %e, "Delivery failed");
                Err(if e.is_transient() {
                    Reply::local_error()
                } else {
                    Reply::transaction_failed()
                })
            }
        }
    }

    fn tls_available(&mut self) -> bool {
        self.tls_offered && !self.tls_active
    }
}

pub struct Session<S> {
    stream: S,
    proto: Protocol,
    bridge: Bridge,
    buffer: Vec<u8>,
    /// Dropping input up to the next line feed after an overlong line.
    discarding: bool,
    idle_timeout: Duration,
}

/// A session taken off its plaintext stream while the TLS handshake runs.
pub struct SuspendedSession {
    proto: Protocol,
    bridge: Bridge,
    idle_timeout: Duration,
}

impl SuspendedSession {
    /// Continues on the secured stream. Plaintext read ahead of the handshake is dropped and
    /// the client must greet again.
    pub fn resume<T>(mut self, stream: T) -> Session<T> {
        self.proto.restart();
        self.bridge.tls_active = true;
        Session {
            stream,
            proto: self.proto,
            bridge: self.bridge,
            buffer: Vec::new(),
            discarding: false,
            idle_timeout: self.idle_timeout,
        }
    }
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, remote_addr: SocketAddr, context: SessionContext) -> Self {
        Self {
            stream,
            proto: Protocol::new(context.hostname),
            bridge: Bridge {
                remote_addr,
                policy: context.policy,
                auth: context.auth,
                delivery: context.delivery,
                identity: None,
                tls_offered: context.tls_offered,
                tls_active: context.tls_active,
            },
            buffer: Vec::new(),
            discarding: false,
            idle_timeout: context.idle_timeout,
        }
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.bridge.identity.as_ref()
    }

    pub fn is_tls(&self) -> bool {
        self.bridge.tls_active
    }

    pub fn state(&self) -> State {
        self.proto.state()
    }

    /// Sends the greeting, then serves the connection.
    ///
    /// # Errors
    ///
    /// Write failures on the underlying stream.
    pub async fn run(&mut self) -> Result<Outcome> {
        self.log("Starting session");
        let greeting = self.proto.start();
        self.write(&greeting).await?;
        self.serve().await
    }

    /// Serves the connection without sending a greeting.
    ///
    /// # Errors
    ///
    /// Write failures on the underlying stream.
    pub async fn serve(&mut self) -> Result<Outcome> {
        let outcome = self.read_loop().await?;
        self.log(&format!("Session ended ({:?})", outcome));
        Ok(outcome)
    }

    /// Hands back the raw stream after [`Outcome::StartTls`].
    pub fn suspend(self) -> (S, SuspendedSession) {
        (
            self.stream,
            SuspendedSession {
                proto: self.proto,
                bridge: self.bridge,
                idle_timeout: self.idle_timeout,
            },
        )
    }

    async fn read_loop(&mut self) -> Result<Outcome> {
        let mut chunk = [0u8; READ_CHUNK];

        loop {
            let n = match time::timeout(self.idle_timeout, self.stream.read(&mut chunk)).await {
                Err(_) => {
                    self.log("Idle timeout");
                    let reply = Reply::timeout(self.proto.hostname());
                    self.write(&reply).await?;
                    self.close().await;
                    return Ok(Outcome::TimedOut);
                }
                Ok(Err(e)) => {
                    self.log(&format!("Error reading from socket: {}", e));
                    return Ok(Outcome::ReadError);
                }
                Ok(Ok(0)) => {
                    self.log("Connection closed by remote host");
                    self.close().await;
                    return Ok(Outcome::ClosedByClient);
                }
                Ok(Ok(n)) => n,
            };

            let received = String::from_utf8_lossy(&chunk[..n]);
            self.log(&format!("Received {} bytes: '{}'", n, escape(&received)));

            let mut fresh = &chunk[..n];
            if self.discarding {
                match fresh.iter().position(|&b| b == b'\n') {
                    Some(end) => {
                        self.discarding = false;
                        fresh = &fresh[end + 1..];
                    }
                    None => continue,
                }
            }

            let scanned = self.buffer.len();
            self.buffer.extend_from_slice(fresh);

            if self.buffer[scanned..].contains(&b'\n') {
                while self.buffer.contains(&b'\n') {
                    let (rest, reply) = self.proto.parse(&self.buffer, &mut self.bridge);
                    let consumed = self.buffer.len() - rest.len();
                    self.buffer.drain(..consumed);

                    let Some(reply) = reply else { continue };
                    self.write(&reply).await?;

                    if reply.closes_connection() {
                        self.close().await;
                        return Ok(Outcome::Quit);
                    }
                    if self.proto.take_tls_request() {
                        return Ok(Outcome::StartTls);
                    }
                }
            }

            let buffered = self.buffer.len();
            if buffered > self.proto.line_limit() {
                self.log(&format!(
                    "No line feed within {} bytes, discarding the rest of the line",
                    buffered
                ));
                self.buffer.clear();
                self.discarding = true;
                if let Some(reply) = self.proto.line_overflow() {
                    self.write(&reply).await?;
                }
            }
        }
    }

    /// Sends a reply. A peer that stops reading for longer than the idle timeout is an error.
    async fn write(&mut self, reply: &Reply) -> Result<()> {
        time::timeout(self.idle_timeout, self.send(reply))
            .await
            .context("Timed out writing to client")?
    }

    async fn send(&mut self, reply: &Reply) -> Result<()> {
        for line in reply.lines() {
            self.log(&format!("Sent {} bytes: '{}'", line.len(), escape(&line)));
            self.stream.write_all(line.as_bytes()).await?;
        }
        self.stream.flush().await?;
        Ok(())
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.shutdown().await {
            self.log(&format!("Error closing connection: {}", e));
        }
    }

    fn log(&mut self, message: &str) {
        self.bridge.log(message);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use tokio::io::{AsyncBufReadExt, BufReader, DuplexStream, ReadHalf, WriteHalf};

    use super::*;
    use crate::backend::BackendError;

    #[derive(Default)]
    struct StubBackend {
        will_deliver_calls: Mutex<Vec<(String, String, Option<Identity>)>>,
        refuse: Vec<String>,
        max_recipients: usize,
        /// `Some(true)` fails delivery transiently, `Some(false)` permanently.
        fail_delivery: Option<bool>,
    }

    impl StubBackend {
        fn new() -> Self {
            Self {
                max_recipients: 10,
                ..Self::default()
            }
        }
    }

    impl AuthService for StubBackend {
        fn authenticate(&self, _mechanism: &str, args: &[String]) -> Result<Option<Identity>, BackendError> {
            match args.first().map(String::as_str) {
                Some("good") => Ok(Some(Identity::new("alice"))),
                Some("broken") => Err(BackendError::Unavailable("credential store down".into())),
                _ => Ok(None),
            }
        }

        fn mechanisms(&self) -> Vec<String> {
            vec!["PLAIN".to_string()]
        }
    }

    impl DeliveryService for StubBackend {
        fn deliver(&self, _message: &Message) -> Result<String, BackendError> {
            match self.fail_delivery {
                Some(true) => Err(BackendError::Unavailable("disk full".into())),
                Some(false) => Err(BackendError::Rejected("spam".into())),
                None => Ok("id-1".to_string()),
            }
        }

        fn will_deliver(&self, to: &str, from: &str, identity: Option<&Identity>) -> bool {
            self.will_deliver_calls
                .lock()
                .unwrap()
                .push((to.to_string(), from.to_string(), identity.cloned()));
            !self.refuse.iter().any(|r| r == to)
        }

        fn max_recipients(&self, identity: Option<&Identity>) -> usize {
            match identity {
                Some(_) => self.max_recipients * 2,
                None => self.max_recipients,
            }
        }
    }

    fn context(backend: Arc<StubBackend>, policy: PolicySet) -> SessionContext {
        SessionContext {
            hostname: "mx.test".to_string(),
            policy,
            auth: backend.clone(),
            delivery: backend,
            idle_timeout: Duration::from_secs(5),
            tls_offered: false,
            tls_active: false,
        }
    }

    fn peer() -> SocketAddr {
        "192.0.2.1:40000".parse().unwrap()
    }

    struct Client {
        reader: BufReader<ReadHalf<DuplexStream>>,
        writer: WriteHalf<DuplexStream>,
    }

    impl Client {
        async fn send(&mut self, line: &str) {
            self.writer.write_all(line.as_bytes()).await.unwrap();
        }

        /// Reads one complete, possibly multi-line, reply and returns its status.
        async fn status(&mut self) -> u16 {
            loop {
                let mut line = String::new();
                let n = self.reader.read_line(&mut line).await.unwrap();
                assert!(n > 0, "connection closed while waiting for a reply");
                if line.as_bytes().get(3) != Some(&b'-') {
                    return line[..3].parse().unwrap();
                }
            }
        }

        async fn is_closed(&mut self) -> bool {
            let mut line = String::new();
            self.reader.read_line(&mut line).await.unwrap() == 0
        }
    }

    fn spawn_session(context: SessionContext) -> (Client, tokio::task::JoinHandle<Outcome>) {
        let (client, server) = tokio::io::duplex(4096);
        let handle = tokio::spawn(async move {
            let mut session = Session::new(server, peer(), context);
            session.run().await.unwrap()
        });
        let (reader, writer) = tokio::io::split(client);
        (
            Client {
                reader: BufReader::new(reader),
                writer,
            },
            handle,
        )
    }

    #[tokio::test]
    async fn split_command_is_dispatched_once() {
        let backend = Arc::new(StubBackend::new());
        let mut stream = tokio_test::io::Builder::new()
            .write(b"220 mx.test ESMTP Service Ready\r\n")
            .read(b"HELO client\r\n")
            .write(b"250 mx.test Hello client\r\n")
            .read(b"MAIL FR")
            .read(b"OM:<a@b>\r\n")
            .write(b"250 Sender a@b ok\r\n")
            .build();

        let mut session = Session::new(&mut stream, peer(), context(backend, PolicySet::default()));
        let outcome = session.run().await.unwrap();

        assert_eq!(outcome, Outcome::ClosedByClient);
        assert_eq!(session.state(), State::Rcpt);
        assert!(session.identity().is_none());
    }

    #[tokio::test]
    async fn several_commands_in_one_read() {
        let backend = Arc::new(StubBackend::new());
        let mut stream = tokio_test::io::Builder::new()
            .write(b"220 mx.test ESMTP Service Ready\r\n")
            .read(b"HELO client\r\nNOOP\r\nQU")
            .write(b"250 mx.test Hello client\r\n")
            .write(b"250 Ok\r\n")
            .read(b"IT\r\n")
            .write(b"221 Bye\r\n")
            .build();

        let mut session = Session::new(&mut stream, peer(), context(backend, PolicySet::default()));
        assert_eq!(session.run().await.unwrap(), Outcome::Quit);
    }

    #[tokio::test]
    async fn quit_closes_after_reply() {
        let (mut client, handle) = spawn_session(context(Arc::new(StubBackend::new()), PolicySet::default()));

        assert_eq!(client.status().await, 220);
        client.send("QUIT\r\n").await;
        assert_eq!(client.status().await, 221);
        assert!(client.is_closed().await);
        assert_eq!(handle.await.unwrap(), Outcome::Quit);
    }

    #[tokio::test]
    async fn client_hangup_ends_session() {
        let (mut client, handle) = spawn_session(context(Arc::new(StubBackend::new()), PolicySet::default()));

        assert_eq!(client.status().await, 220);
        client.writer.shutdown().await.unwrap();
        assert_eq!(handle.await.unwrap(), Outcome::ClosedByClient);
    }

    #[tokio::test]
    async fn gate_blocks_mail_commands_until_authenticated() {
        let backend = Arc::new(StubBackend::new());
        let (mut client, _handle) = spawn_session(context(backend.clone(), PolicySet::submission()));

        assert_eq!(client.status().await, 220);
        client.send("EHLO client\r\n").await;
        assert_eq!(client.status().await, 250);

        for command in ["MAIL FROM:<a@b>", "RCPT TO:<c@d>", "DATA", "VRFY bob", "mail from:<a@b>"] {
            client.send(&format!("{}\r\n", command)).await;
            assert_eq!(client.status().await, 530, "{} should be gated", command);
        }
        for command in ["NOOP", "rset", "HELO client"] {
            client.send(&format!("{}\r\n", command)).await;
            assert_eq!(client.status().await, 250, "{} should pass the gate", command);
        }
        client.send("STARTTLS\r\n").await;
        assert_eq!(client.status().await, 454);

        client.send("AUTH PLAIN bad\r\n").await;
        assert_eq!(client.status().await, 535);
        client.send("MAIL FROM:<a@b>\r\n").await;
        assert_eq!(client.status().await, 530);

        client.send("AUTH PLAIN good\r\n").await;
        assert_eq!(client.status().await, 235);
        client.send("MAIL FROM:<a@b>\r\n").await;
        assert_eq!(client.status().await, 250);
        client.send("RCPT TO:<c@d>\r\n").await;
        assert_eq!(client.status().await, 250);

        let calls = backend.will_deliver_calls.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec![("c@d".to_string(), "a@b".to_string(), Some(Identity::new("alice")))]
        );
    }

    #[tokio::test]
    async fn gate_is_off_without_auth_policy() {
        let backend = Arc::new(StubBackend::new());
        let (mut client, _handle) = spawn_session(context(backend.clone(), PolicySet::intake()));

        assert_eq!(client.status().await, 220);
        client.send("HELO client\r\nMAIL FROM:<a@b>\r\nRCPT TO:<c@d>\r\n").await;
        assert_eq!(client.status().await, 250);
        assert_eq!(client.status().await, 250);
        assert_eq!(client.status().await, 250);

        let calls = backend.will_deliver_calls.lock().unwrap().clone();
        assert_eq!(calls[0].2, None);
    }

    #[tokio::test]
    async fn backend_auth_error_is_a_failed_auth() {
        let (mut client, _handle) = spawn_session(context(Arc::new(StubBackend::new()), PolicySet::submission()));

        assert_eq!(client.status().await, 220);
        client.send("EHLO client\r\nAUTH PLAIN broken\r\nMAIL FROM:<a@b>\r\n").await;
        assert_eq!(client.status().await, 250);
        assert_eq!(client.status().await, 535);
        assert_eq!(client.status().await, 530);
    }

    #[tokio::test]
    async fn recipient_limit_depends_on_identity() {
        let mut backend = StubBackend::new();
        backend.max_recipients = 1;
        let (mut client, _handle) = spawn_session(context(Arc::new(backend), PolicySet::default()));

        assert_eq!(client.status().await, 220);
        client.send("EHLO client\r\nMAIL FROM:<a@b>\r\nRCPT TO:<1@d>\r\nRCPT TO:<2@d>\r\n").await;
        assert_eq!(client.status().await, 250);
        assert_eq!(client.status().await, 250);
        assert_eq!(client.status().await, 250);
        assert_eq!(client.status().await, 452);

        client.send("RSET\r\nAUTH PLAIN good\r\nMAIL FROM:<a@b>\r\n").await;
        assert_eq!(client.status().await, 250);
        assert_eq!(client.status().await, 235);
        assert_eq!(client.status().await, 250);
        client.send("RCPT TO:<1@d>\r\nRCPT TO:<2@d>\r\nRCPT TO:<3@d>\r\n").await;
        assert_eq!(client.status().await, 250);
        assert_eq!(client.status().await, 250);
        assert_eq!(client.status().await, 452);
    }

    #[tokio::test]
    async fn delivery_errors_become_replies() {
        for (transient, expected) in [(true, 451u16), (false, 554u16)] {
            let mut backend = StubBackend::new();
            backend.fail_delivery = Some(transient);
            let (mut client, _handle) = spawn_session(context(Arc::new(backend), PolicySet::default()));

            assert_eq!(client.status().await, 220);
            client
                .send("HELO c\r\nMAIL FROM:<a@b>\r\nRCPT TO:<c@d>\r\nDATA\r\nhello\r\n.\r\nNOOP\r\n")
                .await;
            for status in [250, 250, 250, 354, expected, 250] {
                assert_eq!(client.status().await, status);
            }
        }
    }

    #[tokio::test]
    async fn idle_client_is_disconnected() {
        let mut context = context(Arc::new(StubBackend::new()), PolicySet::default());
        context.idle_timeout = Duration::from_millis(50);
        let (mut client, handle) = spawn_session(context);

        assert_eq!(client.status().await, 220);
        assert_eq!(client.status().await, 421);
        assert!(client.is_closed().await);
        assert_eq!(handle.await.unwrap(), Outcome::TimedOut);
    }

    #[tokio::test]
    async fn starttls_suspends_the_session() {
        let mut context = context(Arc::new(StubBackend::new()), PolicySet::default());
        context.tls_offered = true;
        let (mut client, handle) = spawn_session(context);

        assert_eq!(client.status().await, 220);
        client.send("EHLO client\r\nSTARTTLS\r\n").await;
        assert_eq!(client.status().await, 250);
        assert_eq!(client.status().await, 220);
        assert_eq!(handle.await.unwrap(), Outcome::StartTls);
    }

    #[tokio::test]
    async fn resumed_session_requires_a_new_greeting() {
        let mut context = context(Arc::new(StubBackend::new()), PolicySet::default());
        context.tls_offered = true;
        let mut stream = tokio_test::io::Builder::new()
            .write(b"220 mx.test ESMTP Service Ready\r\n")
            .read(b"EHLO client\r\nSTARTTLS\r\n")
            .write(b"250-mx.test Hello client\r\n250-STARTTLS\r\n250 AUTH PLAIN\r\n")
            .write(b"220 Ready to start TLS\r\n")
            .build();

        let mut session = Session::new(&mut stream, peer(), context);
        assert_eq!(session.run().await.unwrap(), Outcome::StartTls);
        let (_, suspended) = session.suspend();

        let mut secured = tokio_test::io::Builder::new()
            .read(b"MAIL FROM:<a@b>\r\nEHLO client\r\n")
            .write(b"503 Bad sequence of commands\r\n")
            .write(b"250-mx.test Hello client\r\n250 AUTH PLAIN\r\n")
            .build();
        let mut session = suspended.resume(&mut secured);
        assert!(session.is_tls());
        assert_eq!(session.serve().await.unwrap(), Outcome::ClosedByClient);
    }

    #[tokio::test]
    async fn starttls_passes_the_auth_gate() {
        let mut context = context(Arc::new(StubBackend::new()), PolicySet::submission());
        context.tls_offered = true;
        let (mut client, handle) = spawn_session(context);

        assert_eq!(client.status().await, 220);
        client.send("EHLO client\r\nMAIL FROM:<a@b>\r\nSTARTTLS\r\n").await;
        assert_eq!(client.status().await, 250);
        assert_eq!(client.status().await, 530);
        assert_eq!(client.status().await, 220);
        assert_eq!(handle.await.unwrap(), Outcome::StartTls);
    }

    #[tokio::test]
    async fn unterminated_line_is_discarded() {
        let (client, server) = tokio::io::duplex(4096);
        let context = context(Arc::new(StubBackend::new()), PolicySet::default());
        let handle = tokio::spawn(async move {
            let mut session = Session::new(server, peer(), context);
            let outcome = session.run().await.unwrap();
            (outcome, session.buffer.capacity())
        });
        let (reader, writer) = tokio::io::split(client);
        let mut client = Client {
            reader: BufReader::new(reader),
            writer,
        };

        assert_eq!(client.status().await, 220);
        let flood = "A".repeat(1024);
        for _ in 0..256 {
            client.send(&flood).await;
        }
        client.send("\r\nNOOP\r\nQUIT\r\n").await;
        assert_eq!(client.status().await, 500);
        assert_eq!(client.status().await, 250);
        assert_eq!(client.status().await, 221);

        let (outcome, capacity) = handle.await.unwrap();
        assert_eq!(outcome, Outcome::Quit);
        assert!(capacity <= 4 * READ_CHUNK, "buffer grew to {} bytes", capacity);
    }

    #[tokio::test]
    async fn overlong_body_line_fails_the_transaction() {
        let (mut client, _handle) = spawn_session(context(Arc::new(StubBackend::new()), PolicySet::default()));

        assert_eq!(client.status().await, 220);
        client.send("HELO c\r\nMAIL FROM:<a@b>\r\nRCPT TO:<c@d>\r\nDATA\r\n").await;
        for status in [250, 250, 250, 354] {
            assert_eq!(client.status().await, status);
        }
        client.send(&"x".repeat(8 * 1024)).await;
        client.send("\r\n.\r\nNOOP\r\n").await;
        assert_eq!(client.status().await, 500);
        assert_eq!(client.status().await, 250);
    }

    #[tokio::test]
    async fn message_size_comes_from_policy() {
        let mut policy = PolicySet::default();
        policy.maximum_message_size = 10;
        let (mut client, _handle) = spawn_session(context(Arc::new(StubBackend::new()), policy));

        assert_eq!(client.status().await, 220);
        client
            .send("HELO c\r\nMAIL FROM:<a@b>\r\nRCPT TO:<c@d>\r\nDATA\r\n0123456789\r\n.\r\n")
            .await;
        for status in [250, 250, 250, 354, 552] {
            assert_eq!(client.status().await, status);
        }
    }

    #[tokio::test]
    async fn stalled_reader_times_out_writes() {
        let (_client, server) = tokio::io::duplex(8);
        let mut context = context(Arc::new(StubBackend::new()), PolicySet::default());
        context.idle_timeout = Duration::from_millis(50);

        let mut session = Session::new(server, peer(), context);
        let err = session.run().await.unwrap_err();
        assert_eq!(err.to_string(), "Timed out writing to client");
    }
}
