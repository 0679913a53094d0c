use chrono::{Local, NaiveDateTime};
use color_eyre::eyre::WrapErr;
use color_eyre::Result;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// Receives one line per notable supervision event.
pub trait Report: Send + Sync {
    fn status(&self, line: &str);
}

pub type Reporter = Arc<dyn Report>;

/// Prints status lines and appends them, timestamped, to a log file.
pub struct StatusLog {
    file: Mutex<File>,
}

impl StatusLog {
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .wrap_err_with(|| format!("Failed to open status log {}", path.display()))?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl Report for StatusLog {
    fn status(&self, line: &str) {
        info!("{line}");
        let entry = format!("{}{line}\n", diagnostic_prefix(Local::now().naive_local()));
        if let Err(err) = self.file.lock().write_all(entry.as_bytes()) {
            warn!(?err, "Failed to write status log");
        }
    }
}

pub fn diagnostic_prefix(at: NaiveDateTime) -> String {
    format!("[{}] ", at.format("%Y-%m-%d %H:%M:%S"))
}
