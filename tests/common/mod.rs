#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::time;

use smtp_mta::backend::{Backends, LocalBackend, Mailstore};
use smtp_mta::config::{BackendConfig, UserConfig};
use smtp_mta::{Config, PolicySet, Server, ServerConfig};

pub const WAIT: Duration = Duration::from_secs(5);

pub fn backend_config() -> BackendConfig {
    BackendConfig {
        local_domains: vec!["example.org".to_string()],
        mailboxes: Vec::new(),
        users: vec![UserConfig {
            username: "alice".to_string(),
            password: "secret".to_string(),
        }],
    }
}

pub struct Running {
    pub addr: SocketAddr,
    pub store: Arc<Mailstore>,
}

/// Serves `policy` on an ephemeral loopback port.
pub async fn start(policy: PolicySet, idle_timeout: u64) -> Running {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let config = Config {
        backend: backend_config(),
        ..Config::default()
    };
    let mut server = ServerConfig::new(addr.to_string(), "mx.test", policy);
    server.idle_timeout = idle_timeout;

    let store = Arc::new(Mailstore::new());
    let backend = LocalBackend::new(policy, &config.backend, store.clone());
    let server = Server::new(&config, server, Backends::local(Arc::new(backend))).unwrap();
    tokio::spawn(server.serve(listener));

    Running { addr, store }
}

pub struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Client {
    pub async fn connect(addr: SocketAddr) -> Self {
        let (reader, writer) = TcpStream::connect(addr).await.unwrap().into_split();
        Self {
            reader: BufReader::new(reader),
            writer,
        }
    }

    pub async fn send(&mut self, data: &str) {
        self.writer.write_all(data.as_bytes()).await.unwrap();
    }

    /// Reads one complete reply, following `NNN-` continuation lines.
    pub async fn reply(&mut self) -> (u16, Vec<String>) {
        time::timeout(WAIT, self.read_reply())
            .await
            .expect("no reply from server")
    }

    async fn read_reply(&mut self) -> (u16, Vec<String>) {
        let mut lines = Vec::new();
        loop {
            let mut line = String::new();
            let n = self.reader.read_line(&mut line).await.unwrap();
            assert!(n > 0, "connection closed while waiting for a reply");
            let line = line.trim_end_matches("\r\n");
            let status = line[..3].parse().unwrap();
            lines.push(line.get(4..).unwrap_or("").to_string());
            if line.as_bytes().get(3) != Some(&b'-') {
                return (status, lines);
            }
        }
    }

    pub async fn status(&mut self) -> u16 {
        self.reply().await.0
    }

    /// Sends one command line and returns the reply status.
    pub async fn command(&mut self, line: &str) -> u16 {
        self.send(&format!("{}\r\n", line)).await;
        self.status().await
    }

    /// True once the server has closed its side.
    pub async fn is_closed(&mut self) -> bool {
        let mut line = String::new();
        matches!(
            time::timeout(WAIT, self.reader.read_line(&mut line)).await,
            Ok(Ok(0)) | Ok(Err(_))
        )
    }
}
