use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use structopt::StructOpt;
use tokio::task::JoinSet;

use smtp_mta::backend::{Backends, LocalBackend, Mailstore};
use smtp_mta::{logging, Config, Server};

#[derive(Debug, StructOpt, Clone)]
#[structopt(
    name = "smtp-mta",
    about = "An SMTP intake and submission server"
)]
pub struct Opt {
    /// Configuration file (TOML). Without it, port 25 intake and port 587 submission run
    /// with default policies
    #[structopt(short = "c", long = "config", parse(from_os_str))]
    pub config: Option<PathBuf>,

    /// Run as daemon
    #[structopt(short = "d", long = "daemon")]
    pub daemon: bool,

    /// PID file written in daemon mode
    #[structopt(long = "pid-file", parse(from_os_str), default_value = "/tmp/smtp-mta.pid")]
    pub pid_file: PathBuf,

    /// Log file path
    #[structopt(long = "logs", parse(from_os_str))]
    pub log_file: Option<PathBuf>,

    /// Verbose mode - log SMTP traffic
    #[structopt(short = "v", long = "verbose")]
    pub verbose: bool,
}

fn main() -> Result<()> {
    let opt = Opt::from_args();

    let config = match &opt.config {
        Some(path) => Config::load(path).with_context(|| format!("Failed to load {:?}", path))?,
        None => Config::default(),
    };

    if opt.daemon {
        #[cfg(unix)]
        smtp_mta::daemon::daemonize(&opt.pid_file)?;
        #[cfg(not(unix))]
        eprintln!("[INFO] Daemon mode not supported on this platform");
    }

    logging::init(opt.log_file.as_deref(), opt.verbose)?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), pid = std::process::id(), "smtp-mta starting");
    for warning in config.warnings() {
        tracing::warn!("{}", warning);
    }

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run(config))
}

async fn run(config: Config) -> Result<()> {
    let store = Arc::new(Mailstore::new());
    let mut listeners = JoinSet::new();

    for definition in &config.servers {
        let backend = LocalBackend::new(definition.policy_set, &config.backend, store.clone());
        let server = Server::new(&config, definition.clone(), Backends::local(Arc::new(backend)))?;
        listeners.spawn(server.listen());
    }

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            tracing::info!("Interrupted, shutting down");
        }
        Some(finished) = listeners.join_next() => {
            finished??;
        }
    }

    Ok(())
}
