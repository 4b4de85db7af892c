use crate::collaborators::{ImageUploader, StoreError, StoreResult};
use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};

/// Stores uploaded photos as plain files under a media root.
pub struct FsUploader {
    root: PathBuf,
}

impl FsUploader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path_hint: &str) -> StoreResult<PathBuf> {
        let hint = Path::new(path_hint);
        let relative = !path_hint.is_empty()
            && hint.components().all(|c| matches!(c, Component::Normal(_)));
        if !relative {
            return Err(StoreError::Upload(format!("path hint {path_hint:?} escapes media root")));
        }
        Ok(self.root.join(hint))
    }
}

#[async_trait]
impl ImageUploader for FsUploader {
    async fn upload(&self, image: Vec<u8>, path_hint: &str) -> StoreResult<String> {
        let path = self.resolve(path_hint)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, &image).await?;
        tracing::debug!(path = %path.display(), bytes = image.len(), "image stored");
        Ok(format!("file://{}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_upload_writes_under_root() {
        let dir = tempfile::tempdir().unwrap();
        let up = FsUploader::new(dir.path());
        let url = up
            .upload(vec![1, 2, 3], "attendance/nurse-1/abc.jpg")
            .await
            .unwrap();

        let expected = dir.path().join("attendance/nurse-1/abc.jpg");
        assert_eq!(std::fs::read(&expected).unwrap(), vec![1, 2, 3]);
        assert_eq!(url, format!("file://{}", expected.display()));
    }

    #[tokio::test]
    async fn test_upload_rejects_escaping_hints() {
        let dir = tempfile::tempdir().unwrap();
        let up = FsUploader::new(dir.path());
        for hint in ["../x.jpg", "/etc/x.jpg", "a/../../x.jpg", ""] {
            let err = up.upload(vec![0], hint).await.unwrap_err();
            assert!(matches!(err, StoreError::Upload(_)), "{hint}");
        }
    }

    #[tokio::test]
    async fn test_upload_overwrites_same_hint() {
        let dir = tempfile::tempdir().unwrap();
        let up = FsUploader::new(dir.path());
        up.upload(vec![1], "profiles/a/x.jpg").await.unwrap();
        up.upload(vec![2], "profiles/a/x.jpg").await.unwrap();
        assert_eq!(std::fs::read(dir.path().join("profiles/a/x.jpg")).unwrap(), vec![2]);
    }
}
