use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::time;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;

use crate::backend::Backends;
use crate::config::{Config, ServerConfig};
use crate::session::{Outcome, Session, SessionContext};
use crate::tls;

/// Pause after a failed accept, e.g. when the process is out of file descriptors.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// One listening socket with its own policy set and backends.
pub struct Server {
    server: ServerConfig,
    backends: Backends,
    tls_acceptor: Option<TlsAcceptor>,
    connections: Arc<Semaphore>,
}

impl Server {
    /// Prepares a listener. TLS material is loaded here, once, so a bad certificate fails
    /// startup instead of the first connection.
    ///
    /// # Errors
    ///
    /// The certificate or private key cannot be read or parsed.
    pub fn new(config: &Config, server: ServerConfig, backends: Backends) -> Result<Self> {
        let tls_acceptor = match &server.tls {
            Some(tls) => {
                let cert_path = config.resolve_path(&tls.cert_file);
                let key_path = config.resolve_path(&tls.key_file);
                let acceptor = tls::load_acceptor(&cert_path, &key_path)
                    .with_context(|| format!("TLS setup for {} failed", server.bind_addr))?;
                tracing::info!(listener = %server.bind_addr, certificate = ?cert_path, implicit = tls.implicit, "TLS enabled");
                Some(acceptor)
            }
            None => None,
        };

        Ok(Self {
            connections: Arc::new(Semaphore::new(server.policy_set.maximum_connections)),
            server,
            backends,
            tls_acceptor,
        })
    }

    /// Binds the configured address and serves it.
    ///
    /// # Errors
    ///
    /// Binding fails. Once bound this only returns if the admission semaphore is closed.
    pub async fn listen(self) -> Result<()> {
        tracing::info!(listener = %self.server.bind_addr, "Binding to address");
        let listener = TcpListener::bind(&self.server.bind_addr)
            .await
            .with_context(|| format!("Failed to bind to {}", self.server.bind_addr))?;
        self.serve(listener).await
    }

    /// Accepts connections from an already bound listener.
    ///
    /// A connection slot is taken before each accept, so with every slot in use the listener
    /// stops accepting and new clients wait in the kernel backlog.
    ///
    /// # Errors
    ///
    /// The admission semaphore was closed.
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let this = Arc::new(self);
        tracing::info!(
            listener = %this.server.bind_addr,
            hostname = %this.server.hostname,
            max_connections = this.server.policy_set.maximum_connections,
            "Listening"
        );

        loop {
            let permit = this
                .connections
                .clone()
                .acquire_owned()
                .await
                .context("connection semaphore closed")?;

            let (stream, remote_addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!(listener = %this.server.bind_addr, error = %e, "Error accepting connection");
                    time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    continue;
                }
            };

            let this = this.clone();
            tokio::spawn(async move {
                if let Err(e) = this.handle_client(stream, remote_addr).await {
                    tracing::warn!(peer = %remote_addr, error = %e, "Session error");
                }
                drop(permit);
            });
        }
    }

    fn session_context(&self) -> SessionContext {
        let implicit = self.server.tls.as_ref().is_some_and(|tls| tls.implicit);
        SessionContext {
            hostname: self.server.hostname.clone(),
            policy: self.server.policy_set,
            auth: self.backends.auth.clone(),
            delivery: self.backends.delivery.clone(),
            idle_timeout: self.server.idle_timeout(),
            tls_offered: self.tls_acceptor.is_some() && !implicit,
            tls_active: implicit,
        }
    }

    async fn handle_client(&self, stream: TcpStream, remote_addr: SocketAddr) -> Result<()> {
        tracing::info!(peer = %remote_addr, listener = %self.server.bind_addr, "New connection");
        let context = self.session_context();

        match &self.tls_acceptor {
            Some(acceptor) if context.tls_active => {
                let stream = self.handshake(acceptor, stream).await?;
                tracing::debug!(peer = %remote_addr, "TLS session established");
                Session::new(stream, remote_addr, context).run().await?;
            }
            _ => {
                let mut session = Session::new(stream, remote_addr, context);
                if session.run().await? == Outcome::StartTls {
                    let acceptor = self
                        .tls_acceptor
                        .as_ref()
                        .context("STARTTLS accepted without TLS configuration")?;
                    let (stream, suspended) = session.suspend();
                    let stream = self.handshake(acceptor, stream).await?;
                    tracing::debug!(peer = %remote_addr, "TLS session established");
                    suspended.resume(stream).serve().await?;
                }
            }
        }

        tracing::info!(peer = %remote_addr, "Connection closed");
        Ok(())
    }

    /// A peer that stalls the handshake is dropped after the idle timeout.
    async fn handshake(&self, acceptor: &TlsAcceptor, stream: TcpStream) -> Result<TlsStream<TcpStream>> {
        time::timeout(self.server.idle_timeout(), acceptor.accept(stream))
            .await
            .context("TLS handshake timed out")?
            .context("TLS handshake failed")
    }
}
