//! Remote store backed by a directory (local disk or a mounted share).
//!
//! Layout: `<root>/<container>/<object key>`.

use super::{object_key, RemoteError, RemoteStore};
use crate::model::Backup;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;
use uuid::Uuid;

pub struct MirrorStore {
    root: PathBuf,
}

impl MirrorStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn container_dir(&self, backup: &Backup) -> PathBuf {
        self.root.join(backup.container())
    }

    /// Where the object for `path` lives in the mirror
    pub fn object_path(&self, backup: &Backup, path: &Path) -> Result<PathBuf, RemoteError> {
        let key = object_key(backup, path)?;
        let mut target = self.container_dir(backup);
        target.extend(key.split('/'));
        Ok(target)
    }
}

#[async_trait]
impl RemoteStore for MirrorStore {
    async fn create_container(&self, backup: &Backup) -> Result<(), RemoteError> {
        fs::create_dir_all(self.container_dir(backup)).await?;
        Ok(())
    }

    async fn upload_file(&self, backup: &Backup, path: &Path) -> Result<(), RemoteError> {
        let target = self.object_path(backup, path)?;
        let parent = target
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.container_dir(backup));
        fs::create_dir_all(&parent).await?;

        // Copy beside the target and rename so readers never see a torn object.
        let staging = parent.join(format!(".cloudsync-{}.partial", Uuid::new_v4()));
        let bytes = match fs::copy(path, &staging).await {
            Ok(bytes) => bytes,
            Err(e) => {
                let _ = fs::remove_file(&staging).await;
                return Err(e.into());
            }
        };
        fs::File::open(&staging).await?.sync_all().await?;
        fs::rename(&staging, &target).await?;

        debug!(bytes, object = %target.display(), "Mirrored file");
        Ok(())
    }

    async fn remove_file(&self, backup: &Backup, path: &Path) -> Result<(), RemoteError> {
        let target = self.object_path(backup, path)?;
        match fs::remove_file(&target).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_upload_and_remove_round_trip() {
        let source = TempDir::new().unwrap();
        let remote = TempDir::new().unwrap();
        let backup = Backup::new("photos", source.path());
        let store = MirrorStore::new(remote.path());

        std::fs::create_dir(source.path().join("2024")).unwrap();
        let file = source.path().join("2024/a.jpg");
        std::fs::write(&file, b"jpeg bytes").unwrap();

        store.create_container(&backup).await.unwrap();
        store.upload_file(&backup, &file).await.unwrap();

        let object = remote.path().join("photos/2024/a.jpg");
        assert_eq!(std::fs::read(&object).unwrap(), b"jpeg bytes");

        store.remove_file(&backup, &file).await.unwrap();
        assert!(!object.exists());

        // Removing again is still a success.
        store.remove_file(&backup, &file).await.unwrap();
    }

    #[tokio::test]
    async fn test_upload_of_missing_file_is_permanent() {
        let source = TempDir::new().unwrap();
        let remote = TempDir::new().unwrap();
        let backup = Backup::new("photos", source.path());
        let store = MirrorStore::new(remote.path());

        let err = store
            .upload_file(&backup, &source.path().join("gone.jpg"))
            .await
            .unwrap_err();
        assert!(err.is_permanent());
    }

    #[tokio::test]
    async fn test_path_outside_root_is_rejected() {
        let remote = TempDir::new().unwrap();
        let backup = Backup::new("photos", "/data/photos");
        let store = MirrorStore::new(remote.path());

        let err = store
            .upload_file(&backup, Path::new("/etc/passwd"))
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::OutsideRoot(_)));
    }
}
