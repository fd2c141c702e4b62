use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use axum::async_trait;
use bytes::Bytes;
use time::OffsetDateTime;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Cap on multipart request bodies for the upload-accepting routes.
pub const MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;

/// An image file arriving with a multipart request.
pub struct UploadedImage {
    pub body: Bytes,
    pub original_name: String,
}

/// Stores at most one profile image per user; filenames double as the
/// references kept in user records.
#[async_trait]
pub trait ImageStore: Send + Sync {
    /// Persists the file under a fresh unique name and returns that name.
    async fn save(&self, body: Bytes, original_name: &str) -> anyhow::Result<String>;
    /// Removes a stored file. A file that is already gone is not an error.
    async fn delete(&self, filename: &str) -> anyhow::Result<()>;
    /// Reads a stored file back, `None` if it does not exist.
    async fn read(&self, filename: &str) -> anyhow::Result<Option<Bytes>>;
    /// Public URL path for a stored file, derivable from the name alone.
    fn public_path(&self, filename: &str) -> String;
}

/// Disk-backed store rooted at the configured uploads directory.
#[derive(Clone)]
pub struct DiskStorage {
    root: PathBuf,
}

impl DiskStorage {
    pub fn new(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("create uploads dir {}", root.display()))?;
        Ok(Self { root })
    }
}

#[async_trait]
impl ImageStore for DiskStorage {
    async fn save(&self, body: Bytes, original_name: &str) -> anyhow::Result<String> {
        let ext = Path::new(original_name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| format!(".{}", e))
            .unwrap_or_default();

        // Nanosecond timestamp as the name; create_new guards the rare case
        // of two uploads landing on the same tick.
        let mut stamp = OffsetDateTime::now_utc().unix_timestamp_nanos();
        loop {
            let filename = format!("{}{}", stamp, ext);
            let path = self.root.join(&filename);
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(mut file) => {
                    file.write_all(&body)
                        .await
                        .with_context(|| format!("write {}", path.display()))?;
                    file.flush().await?;
                    debug!(path = %self.public_path(&filename), "image stored");
                    return Ok(filename);
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    stamp += 1;
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("create {}", path.display()));
                }
            }
        }
    }

    async fn delete(&self, filename: &str) -> anyhow::Result<()> {
        let path = self.root.join(filename);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("delete {}", path.display())),
        }
    }

    async fn read(&self, filename: &str) -> anyhow::Result<Option<Bytes>> {
        let path = self.root.join(filename);
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("read {}", path.display())),
        }
    }

    fn public_path(&self, filename: &str) -> String {
        format!("/uploads/{}", filename)
    }
}

/// Best-effort cleanup of a file that is no longer referenced. Spawned from
/// handlers after a replacement or record deletion; failure is logged and
/// never surfaced to the caller.
pub async fn remove_best_effort(store: Arc<dyn ImageStore>, filename: String) {
    if let Err(e) = store.delete(&filename).await {
        warn!(error = %e, filename = %filename, "failed to delete old image");
    }
}

/// Synchronous cleanup of a file saved for a request that then failed.
/// Runs before the error response so a rejected request leaves no orphan.
pub async fn remove_rejected_upload(store: &Arc<dyn ImageStore>, filename: Option<String>) {
    if let Some(filename) = filename {
        if let Err(e) = store.delete(&filename).await {
            warn!(error = %e, filename = %filename, "failed to remove upload of failed request");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, DiskStorage) {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = DiskStorage::new(dir.path()).expect("storage");
        (dir, storage)
    }

    #[tokio::test]
    async fn save_keeps_extension_and_round_trips() {
        let (_dir, storage) = store();
        let name = storage
            .save(Bytes::from_static(b"png-bytes"), "avatar.png")
            .await
            .expect("save");
        assert!(name.ends_with(".png"));

        let back = storage.read(&name).await.expect("read").expect("present");
        assert_eq!(&back[..], b"png-bytes");
    }

    #[tokio::test]
    async fn save_without_extension_still_works() {
        let (_dir, storage) = store();
        let name = storage
            .save(Bytes::from_static(b"raw"), "avatar")
            .await
            .expect("save");
        assert!(!name.contains('.'));
        assert!(storage.read(&name).await.expect("read").is_some());
    }

    #[tokio::test]
    async fn consecutive_saves_get_distinct_names() {
        let (_dir, storage) = store();
        let a = storage
            .save(Bytes::from_static(b"a"), "a.jpg")
            .await
            .expect("save a");
        let b = storage
            .save(Bytes::from_static(b"b"), "b.jpg")
            .await
            .expect("save b");
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn delete_missing_file_is_ok() {
        let (_dir, storage) = store();
        storage.delete("1700000000000000000.png").await.expect("delete");
    }

    #[tokio::test]
    async fn delete_then_read_returns_none() {
        let (_dir, storage) = store();
        let name = storage
            .save(Bytes::from_static(b"x"), "x.webp")
            .await
            .expect("save");
        storage.delete(&name).await.expect("delete");
        assert!(storage.read(&name).await.expect("read").is_none());
    }

    #[tokio::test]
    async fn remove_best_effort_swallows_missing_files() {
        let (_dir, storage) = store();
        let images: Arc<dyn ImageStore> = Arc::new(storage);
        remove_best_effort(images, "not-there.png".into()).await;
    }

    #[test]
    fn public_path_is_derivable_from_name() {
        let (_dir, storage) = store();
        assert_eq!(
            storage.public_path("1700000000000000000.png"),
            "/uploads/1700000000000000000.png"
        );
    }
}
