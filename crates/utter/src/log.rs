//! Logging for utter.
use anyhow::Context;
use std::io::LineWriter;
use std::sync::Mutex;
use tracing_subscriber::fmt::time::OffsetTime;
use utter_core::get_data_dir;

/// Initializes file based logging.
///
/// Logs go to `<data_dir>/utter.log`. A log file above 100KB is moved to
/// `utter.log.old` first, replacing any older backup.
///
/// # Errors
///
/// Fails when the data directory or the log file can't be prepared, or the
/// local time offset can't be determined.
pub fn setup_logging() -> anyhow::Result<()> {
    let data_dir = get_data_dir().context("Failed to get data directory")?;
    let log_path = data_dir.join("utter.log");

    if log_path.exists() {
        let metadata = std::fs::metadata(&log_path)?;
        if metadata.len() > 100 * 1024 {
            let backup_path = data_dir.join("utter.log.old");
            if backup_path.exists() {
                std::fs::remove_file(&backup_path)?;
            }
            std::fs::rename(&log_path, backup_path)?;
        }
    }

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)?;

    // Ensure the logs are flushed after every line
    let writer = Mutex::new(LineWriter::new(log_file));

    tracing_subscriber::fmt()
        .with_env_filter("utter=debug,utter_core=debug,rustyline=info")
        .with_writer(writer)
        .with_ansi(false)
        .with_timer(OffsetTime::local_rfc_3339()?)
        .init();
    Ok(())
}
