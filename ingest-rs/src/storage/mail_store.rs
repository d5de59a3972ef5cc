use crate::error::{GatewayError, Result};
use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub struct MailStore {
    base_path: PathBuf,
}

impl MailStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    /// Write `data` to a new file and return its name
    ///
    /// The file is written under `tmp/` first and then renamed into place,
    /// so readers never observe a partially written message.
    pub async fn store(&self, data: &[u8]) -> Result<String> {
        let tmp_dir = self.base_path.join("tmp");
        self.ensure_dir(&tmp_dir).await?;

        let filename = Self::generate_filename(Local::now());
        let tmp_path = tmp_dir.join(&filename);
        let final_path = self.base_path.join(&filename);

        let file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp_path)
            .await
            .map_err(|e| {
                GatewayError::Storage(format!("Failed to create {}: {}", tmp_path.display(), e))
            })?;
        Self::write_or_discard(file, &tmp_path, data).await?;

        fs::rename(&tmp_path, &final_path).await.map_err(|e| {
            GatewayError::Storage(format!(
                "Failed to move message into {}: {}",
                final_path.display(),
                e
            ))
        })?;

        info!("Stored message as {}", final_path.display());
        Ok(filename)
    }

    /// Write and sync `data`, removing `path` again if either step fails
    async fn write_or_discard(mut file: fs::File, path: &Path, data: &[u8]) -> Result<()> {
        // tokio reports a failed background write on flush, not on write_all
        let written = async {
            file.write_all(data).await?;
            file.flush().await?;
            file.sync_all().await
        }
        .await;
        drop(file);

        if let Err(e) = written {
            if let Err(remove_err) = fs::remove_file(path).await {
                warn!("Failed to remove partial file {}: {}", path.display(), remove_err);
            }
            return Err(GatewayError::Storage(format!(
                "Failed to write {}: {}",
                path.display(),
                e
            )));
        }
        Ok(())
    }

    async fn ensure_dir(&self, dir: &Path) -> Result<()> {
        if !dir.exists() {
            debug!("Creating mail directory {}", dir.display());
            fs::create_dir_all(dir).await.map_err(|e| {
                GatewayError::Storage(format!("Failed to create directory {:?}: {}", dir, e))
            })?;
        }
        Ok(())
    }

    /// `email_<YYYYmmdd_HHMMSS>_<uuid>.eml`; the UUID keeps same-second
    /// messages apart.
    fn generate_filename(now: DateTime<Local>) -> String {
        format!(
            "email_{}_{}.eml",
            now.format("%Y%m%d_%H%M%S"),
            Uuid::new_v4().simple()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_generate_filename_same_second() {
        let now = Local::now();
        let first = MailStore::generate_filename(now);
        let second = MailStore::generate_filename(now);

        assert!(first.starts_with(&format!("email_{}_", now.format("%Y%m%d_%H%M%S"))));
        assert!(first.ends_with(".eml"));
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_store_writes_raw_bytes() {
        let temp_dir = TempDir::new().unwrap();
        let store = MailStore::new(temp_dir.path().join("received_mail"));

        let data = b"Subject: Hi\r\n\r\nHello\r\n";
        let filename = store.store(data).await.unwrap();

        let base = temp_dir.path().join("received_mail");
        let written = fs::read(base.join(&filename)).await.unwrap();
        assert_eq!(written, data);
        assert!(!base.join("tmp").join(&filename).exists());
    }

    #[tokio::test]
    async fn test_store_never_overwrites() {
        let temp_dir = TempDir::new().unwrap();
        let store = MailStore::new(temp_dir.path());

        let first = store.store(b"one").await.unwrap();
        let second = store.store(b"two").await.unwrap();
        assert_ne!(first, second);

        assert_eq!(fs::read(temp_dir.path().join(&first)).await.unwrap(), b"one");
        assert_eq!(fs::read(temp_dir.path().join(&second)).await.unwrap(), b"two");
    }

    #[tokio::test]
    async fn test_failed_write_removes_partial_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("partial.eml");
        fs::write(&path, b"").await.unwrap();

        // Opened read-only, so the write is refused
        let file = fs::File::open(&path).await.unwrap();
        let err = MailStore::write_or_discard(file, &path, b"data")
            .await
            .unwrap_err();

        assert!(matches!(err, GatewayError::Storage(_)));
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_store_fails_when_base_is_a_file() {
        let temp_dir = TempDir::new().unwrap();
        let blocker = temp_dir.path().join("not_a_dir");
        fs::write(&blocker, b"x").await.unwrap();

        let store = MailStore::new(&blocker);
        let err = store.store(b"data").await.unwrap_err();
        assert!(matches!(err, GatewayError::Storage(_)));
    }
}
