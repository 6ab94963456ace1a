// src/connection/file.rs
//
// Mounted filesystem backend. The target is a directory (usually the mount
// point of the filesystem under test); objects live in `<target>/<bucket>/`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info};

use super::{with_timeout, ConnResult, Connection};
use crate::constants::DEFAULT_OPERATION_TIMEOUT;
use crate::error::ConnectionError;

pub struct FileConnection {
    root: String,
    dir: PathBuf,
    /// A hung mount fails each put/get after this long.
    op_timeout: Duration,
}

impl FileConnection {
    pub fn new(root: &str, bucket: &str) -> ConnResult<Self> {
        if bucket.contains('/') || bucket == ".." || bucket == "." {
            return Err(ConnectionError::InvalidCredentials(format!(
                "directory name `{bucket}` must be a single path component"
            )));
        }
        debug!("file connection on {} with dir {}", root, bucket);
        Ok(Self {
            root: root.to_string(),
            dir: Path::new(root).join(bucket),
            op_timeout: DEFAULT_OPERATION_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, op_timeout: Duration) -> Self {
        self.op_timeout = op_timeout;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(key)
    }
}

#[async_trait]
impl Connection for FileConnection {
    fn target(&self) -> &str {
        &self.root
    }

    async fn create_namespace(&self) -> ConnResult<()> {
        // The root is the mount under test; creating it would benchmark the
        // wrong filesystem.
        match tokio::fs::metadata(&self.root).await {
            Ok(m) if m.is_dir() => {}
            Ok(_) => {
                return Err(ConnectionError::BackendUnavailable(format!(
                    "{} is not a directory",
                    self.root
                )))
            }
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                return Err(ConnectionError::PermissionDenied(format!("{}: {e}", self.root)))
            }
            Err(e) => {
                return Err(ConnectionError::BackendUnavailable(format!("{}: {e}", self.root)))
            }
        }
        info!("creating directory {}", self.dir.display());
        tokio::fs::create_dir_all(&self.dir).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::PermissionDenied => {
                ConnectionError::PermissionDenied(format!("{}: {e}", self.dir.display()))
            }
            _ => ConnectionError::BackendUnavailable(format!("{}: {e}", self.dir.display())),
        })
    }

    async fn delete_namespace(&self) -> ConnResult<()> {
        info!("deleting directory {}", self.dir.display());
        match tokio::fs::remove_dir_all(&self.dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ConnectionError::from_io(e, &self.dir.display().to_string())),
        }
    }

    async fn put(&self, key: &str, _id: u64, buf: &[u8]) -> ConnResult<()> {
        with_timeout(self.op_timeout, async {
            let mut file = tokio::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(self.path(key))
                .await
                .map_err(|e| ConnectionError::from_io(e, key))?;
            // write_all loops over short writes until the buffer is drained.
            file.write_all(buf)
                .await
                .map_err(|e| ConnectionError::Io(format!("{key}: {e}")))?;
            file.flush()
                .await
                .map_err(|e| ConnectionError::Io(format!("{key}: {e}")))
        })
        .await
    }

    async fn get(&self, key: &str, _id: u64, buf: &mut [u8]) -> ConnResult<()> {
        with_timeout(self.op_timeout, async {
            let mut file = tokio::fs::File::open(self.path(key))
                .await
                .map_err(|e| ConnectionError::from_io(e, key))?;
            let size = file
                .metadata()
                .await
                .map_err(|e| ConnectionError::from_io(e, key))?
                .len();
            if size != buf.len() as u64 {
                return Err(ConnectionError::SizeMismatch {
                    expected: buf.len() as u64,
                    actual: size,
                });
            }
            file.read_exact(buf)
                .await
                .map_err(|e| ConnectionError::Io(format!("{key}: {e}")))?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_nested_directory_names() {
        assert!(FileConnection::new("/tmp", "a/b").is_err());
        assert!(FileConnection::new("/tmp", "..").is_err());
        let c = FileConnection::new("/mnt/x", "bench").unwrap();
        assert_eq!(c.dir(), Path::new("/mnt/x/bench"));
        assert_eq!(c.target(), "/mnt/x");
    }
}
