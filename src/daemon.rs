use std::path::Path;

use anyhow::{anyhow, Result};
use daemonize::Daemonize;

/// Detaches from the terminal. Must run before the tokio runtime is created, since the
/// runtime's threads do not survive the fork.
pub fn daemonize(pid_file: &Path) -> Result<()> {
    eprintln!("[INFO] Starting daemon mode...");

    let working_directory = std::env::current_dir()?;
    let daemonize = Daemonize::new()
        .pid_file(pid_file)
        .chown_pid_file(true)
        .working_directory(working_directory);

    daemonize
        .start()
        .map_err(|e| anyhow!("Failed to start daemon mode: {}", e))
}
