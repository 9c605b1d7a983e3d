//! Directory cache backend, one file per key

use super::{CacheBackend, CacheError};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Cache backend storing each entry as a file under a root directory
pub struct DirBackend {
    root: PathBuf,
    tmp_counter: AtomicU64,
}

impl DirBackend {
    /// Open `root`, creating it with owner-only permissions if it is missing
    pub async fn new(root: impl AsRef<Path>) -> Result<Self, CacheError> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root).await.map_err(|e| {
            CacheError::Config(format!("cannot create cache directory {}: {}", root.display(), e))
        })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = tokio::fs::metadata(&root).await?.permissions();
            perms.set_mode(0o700);
            tokio::fs::set_permissions(&root, perms).await?;
        }

        debug!(root = %root.display(), "Directory certificate cache ready");
        Ok(Self {
            root,
            tmp_counter: AtomicU64::new(0),
        })
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, CacheError> {
        if key.is_empty()
            || key == "."
            || key == ".."
            || key.contains(['/', '\\', '\0'])
        {
            return Err(CacheError::Backend(format!("invalid cache key: {:?}", key)));
        }
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl CacheBackend for DirBackend {
    async fn get(&self, key: &str) -> Result<Vec<u8>, CacheError> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(CacheError::NotFound),
            Err(e) => Err(CacheError::Io(e)),
        }
    }

    async fn put(&self, key: &str, data: &[u8]) -> Result<(), CacheError> {
        let path = self.path_for(key)?;
        let n = self.tmp_counter.fetch_add(1, Ordering::Relaxed);
        let tmp = self.root.join(format!(".{}.tmp{}", key, n));

        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        options.mode(0o600);

        let write = async {
            use tokio::io::AsyncWriteExt;
            let mut file = options.open(&tmp).await?;
            file.write_all(data).await?;
            file.sync_all().await?;
            tokio::fs::rename(&tmp, &path).await
        };

        if let Err(e) = write.await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(CacheError::Io(e));
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CacheError::Io(e)),
        }
    }
}
