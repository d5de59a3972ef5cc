use crate::error::{GatewayError, Result};
use chrono::{DateTime, Local, NaiveDate};
use std::path::PathBuf;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

/// One line of the delivery log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub timestamp: DateTime<Local>,
    pub api_key: String,
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
}

impl LogRecord {
    /// `timestamp|api_key|from|to|subject\n`
    pub fn to_line(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}\n",
            self.timestamp.format("%Y%m%d_%H%M%S"),
            sanitize(&self.api_key),
            sanitize(&self.from),
            sanitize(&self.to.join(", ")),
            sanitize(&self.subject),
        )
    }
}

/// Keep a record on a single line with exactly five fields
fn sanitize(field: &str) -> String {
    field
        .chars()
        .map(|c| match c {
            '|' | '\r' | '\n' => ' ',
            c => c,
        })
        .collect()
}

/// Append-only, day-partitioned log of processed messages
pub struct DeliveryLog {
    base_path: PathBuf,
    // Serializes appenders within the process; each record is a single write
    append_lock: Mutex<()>,
}

impl DeliveryLog {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
            append_lock: Mutex::new(()),
        }
    }

    /// File holding the records of `date`
    pub fn file_for(&self, date: NaiveDate) -> PathBuf {
        self.base_path
            .join(format!("email_log_{}.txt", date.format("%Y%m%d")))
    }

    pub async fn append(&self, record: &LogRecord) -> Result<PathBuf> {
        let path = self.file_for(record.timestamp.date_naive());
        let line = record.to_line();

        let _guard = self.append_lock.lock().await;

        if !self.base_path.exists() {
            fs::create_dir_all(&self.base_path).await.map_err(|e| {
                GatewayError::Storage(format!(
                    "Failed to create log directory {:?}: {}",
                    self.base_path, e
                ))
            })?;
        }

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| {
                GatewayError::Storage(format!("Failed to open {}: {}", path.display(), e))
            })?;
        file.write_all(line.as_bytes()).await.map_err(|e| {
            GatewayError::Storage(format!("Failed to append to {}: {}", path.display(), e))
        })?;
        file.flush().await.map_err(|e| {
            GatewayError::Storage(format!("Failed to flush {}: {}", path.display(), e))
        })?;

        debug!("Logged message for API key {} to {}", record.api_key, path.display());
        Ok(path)
    }
}
