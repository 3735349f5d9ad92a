use async_trait::async_trait;
use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncSeekExt, BufWriter};

use crate::core::error::{DownloadError, DownloadResult, StorageOperation};
use crate::core::task::request::Destination;
use super::auth::{AuthorizationBroker, AuthorizationProvider, StorageCapability};
use super::{Artifact, StorageGateway, WriteTarget};

const PARTIAL_SUFFIX: &str = ".part";
const WRITE_BUFFER_SIZE: usize = 64 * 1024;

/// 本地文件系统存储
///
/// 默认任何目录都不需要授权；落在 `protected_roots` 下的目标需要先经过
/// 授权握手。
pub struct FsStorageGateway {
    protected_roots: Vec<PathBuf>,
    broker: AuthorizationBroker,
    seekable: bool,
}

impl FsStorageGateway {
    pub fn new(authorizer: Arc<dyn AuthorizationProvider>, authorization_timeout: Duration) -> Self {
        Self {
            protected_roots: Vec::new(),
            broker: AuthorizationBroker::new(authorizer, authorization_timeout),
            seekable: true,
        }
    }

    pub fn with_protected_roots(mut self, roots: Vec<PathBuf>) -> Self {
        self.protected_roots = roots;
        self
    }

    /// 只能顺序追加写入的存储，断点续传会退化为从头下载
    pub fn append_only(mut self) -> Self {
        self.seekable = false;
        self
    }

    pub fn partial_path(destination: &Destination) -> PathBuf {
        destination
            .parent()
            .join(format!("{}{}", destination.file_name(), PARTIAL_SUFFIX))
    }

    fn protected_root_for(&self, path: &Path) -> Option<&PathBuf> {
        self.protected_roots
            .iter()
            .filter(|root| path.starts_with(root))
            .max_by_key(|root| root.components().count())
    }

    fn check_capability(&self, destination: &Destination, capability: Option<&StorageCapability>) -> DownloadResult<()> {
        let Some(root) = self.protected_root_for(destination.parent()) else {
            return Ok(());
        };
        match capability {
            Some(cap) if cap.covers(root) => Ok(()),
            Some(cap) => {
                log::warn!("授权 {} 不适用于 {}", cap.token(), root.display());
                Err(DownloadError::AuthorizationDenied { root: root.clone() })
            }
            None => Err(DownloadError::AuthorizationDenied { root: root.clone() }),
        }
    }
}

#[async_trait]
impl StorageGateway for FsStorageGateway {
    fn resolve_root(&self, destination: &Destination) -> Option<PathBuf> {
        if destination.parent().as_os_str().is_empty() {
            return None;
        }
        match self.protected_root_for(destination.parent()) {
            Some(root) => Some(root.clone()),
            None => Some(destination.parent().to_path_buf()),
        }
    }

    fn requires_authorization(&self, root: &Path) -> bool {
        self.protected_roots.iter().any(|r| r == root)
    }

    async fn request_authorization(&self, root: &Path) -> DownloadResult<StorageCapability> {
        self.broker.acquire(root).await
    }

    async fn exists(&self, destination: &Destination, capability: Option<&StorageCapability>) -> DownloadResult<bool> {
        self.check_capability(destination, capability)?;
        let partial = Self::partial_path(destination);
        fs::try_exists(&partial)
            .await
            .map_err(|e| DownloadError::storage(partial, StorageOperation::Open, e))
    }

    async fn create_or_find(&self, destination: &Destination, capability: Option<&StorageCapability>) -> DownloadResult<Artifact> {
        self.check_capability(destination, capability)?;
        fs::create_dir_all(destination.parent())
            .await
            .map_err(|e| DownloadError::storage(destination.parent(), StorageOperation::Create, e))?;
        let partial = Self::partial_path(destination);
        OpenOptions::new()
            .create(true)
            .write(true)
            .open(&partial)
            .await
            .map_err(|e| DownloadError::storage(&partial, StorageOperation::Create, e))?;
        Ok(Artifact {
            partial,
            target: destination.path(),
        })
    }

    async fn open_for_write(&self, artifact: &Artifact, offset: u64) -> DownloadResult<WriteTarget> {
        let path = &artifact.partial;
        let open_error = |e: std::io::Error| DownloadError::storage(path, StorageOperation::Open, e);
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(path)
            .await
            .map_err(open_error)?;

        let existing = file.metadata().await.map_err(open_error)?.len();
        // 不能定位写入或者已有数据不足时，只能从头开始
        let start = if self.seekable && offset > 0 && existing >= offset {
            offset
        } else {
            if offset > 0 {
                log::warn!(
                    "{} 无法从 {} 字节处续写（已有 {} 字节），从头开始",
                    path.display(),
                    offset,
                    existing
                );
            }
            0
        };
        file.set_len(start).await.map_err(open_error)?;
        file.seek(SeekFrom::Start(start)).await.map_err(open_error)?;

        Ok(WriteTarget::new(
            Box::new(BufWriter::with_capacity(WRITE_BUFFER_SIZE, file)),
            path.clone(),
            start,
        ))
    }

    async fn finalize(&self, artifact: &Artifact) -> DownloadResult<()> {
        match fs::remove_file(&artifact.target).await {
            Ok(()) => log::debug!("覆盖已存在的文件: {}", artifact.target.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(DownloadError::storage(&artifact.target, StorageOperation::Delete, e)),
        }
        fs::rename(&artifact.partial, &artifact.target)
            .await
            .map_err(|e| DownloadError::storage(&artifact.target, StorageOperation::Rename, e))
    }

    async fn remove_finalized(&self, artifact: &Artifact) -> DownloadResult<()> {
        match fs::remove_file(&artifact.target).await {
            Ok(()) => {
                log::info!("已删除文件: {}", artifact.target.display());
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(DownloadError::storage(&artifact.target, StorageOperation::Delete, e)),
        }
    }

    async fn delete(&self, destination: &Destination, capability: Option<&StorageCapability>) -> DownloadResult<()> {
        self.check_capability(destination, capability)?;
        let partial = Self::partial_path(destination);
        match fs::remove_file(&partial).await {
            Ok(()) => {
                log::info!("已删除未完成文件: {}", partial.display());
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(DownloadError::storage(partial, StorageOperation::Delete, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::auth::tests::ScriptedAuthorizer;
    use crate::storage::{authorize_destination, discard_artifact, AutoGrant};

    fn gateway() -> FsStorageGateway {
        FsStorageGateway::new(Arc::new(AutoGrant), Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_write_and_finalize() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = gateway();
        let destination = Destination::new(dir.path().join("sub"), "a.bin");

        assert_eq!(gateway.resolve_root(&destination), Some(dir.path().join("sub")));
        assert!(!gateway.requires_authorization(&dir.path().join("sub")));

        let artifact = gateway.create_or_find(&destination, None).await.unwrap();
        assert!(gateway.exists(&destination, None).await.unwrap());

        let mut target = gateway.open_for_write(&artifact, 0).await.unwrap();
        target.write(b"hello ").await.unwrap();
        target.write(b"world").await.unwrap();
        target.close().await.unwrap();

        gateway.finalize(&artifact).await.unwrap();
        assert_eq!(std::fs::read(destination.path()).unwrap(), b"hello world");
        assert!(!gateway.exists(&destination, None).await.unwrap());

        gateway.remove_finalized(&artifact).await.unwrap();
        assert!(!destination.path().exists());
        // 文件已不存在时不报错
        gateway.remove_finalized(&artifact).await.unwrap();
    }

    #[tokio::test]
    async fn test_open_at_offset_truncates_tail() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = gateway();
        let destination = Destination::new(dir.path(), "b.bin");
        let artifact = gateway.create_or_find(&destination, None).await.unwrap();
        std::fs::write(&artifact.partial, b"0123456789").unwrap();

        let mut target = gateway.open_for_write(&artifact, 4).await.unwrap();
        assert_eq!(target.start_offset(), 4);
        target.write(b"ab").await.unwrap();
        target.close().await.unwrap();
        assert_eq!(std::fs::read(&artifact.partial).unwrap(), b"0123ab");
    }

    #[tokio::test]
    async fn test_offset_beyond_data_restarts() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = gateway();
        let destination = Destination::new(dir.path(), "c.bin");
        let artifact = gateway.create_or_find(&destination, None).await.unwrap();
        std::fs::write(&artifact.partial, b"012").unwrap();

        let target = gateway.open_for_write(&artifact, 8).await.unwrap();
        assert_eq!(target.start_offset(), 0);
    }

    #[tokio::test]
    async fn test_append_only_degrades_to_restart() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = gateway().append_only();
        let destination = Destination::new(dir.path(), "d.bin");
        let artifact = gateway.create_or_find(&destination, None).await.unwrap();
        std::fs::write(&artifact.partial, b"0123456789").unwrap();

        let mut target = gateway.open_for_write(&artifact, 5).await.unwrap();
        assert_eq!(target.start_offset(), 0);
        target.write(b"xy").await.unwrap();
        target.close().await.unwrap();
        assert_eq!(std::fs::read(&artifact.partial).unwrap(), b"xy");
    }

    #[tokio::test]
    async fn test_protected_root_requires_capability() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("card");
        let gateway = FsStorageGateway::new(Arc::new(ScriptedAuthorizer::new(true, true)), Duration::from_secs(1))
            .with_protected_roots(vec![root.clone()]);
        let destination = Destination::new(root.join("music"), "song.mp3");

        assert_eq!(gateway.resolve_root(&destination), Some(root.clone()));
        assert!(gateway.requires_authorization(&root));
        assert!(matches!(
            gateway.create_or_find(&destination, None).await,
            Err(DownloadError::AuthorizationDenied { .. })
        ));

        let capability = authorize_destination(&gateway, &destination).await.unwrap();
        assert!(capability.is_some());
        gateway.create_or_find(&destination, capability.as_ref()).await.unwrap();
        assert!(gateway.exists(&destination, capability.as_ref()).await.unwrap());
    }

    #[tokio::test]
    async fn test_discard_skips_on_denied_authorization() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("card");
        let gateway = FsStorageGateway::new(Arc::new(ScriptedAuthorizer::new(false, true)), Duration::from_secs(1))
            .with_protected_roots(vec![root.clone()]);
        let destination = Destination::new(&root, "x.bin");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(FsStorageGateway::partial_path(&destination), b"abc").unwrap();

        assert!(!discard_artifact(&gateway, &destination).await);
        assert!(FsStorageGateway::partial_path(&destination).exists());
    }
}
