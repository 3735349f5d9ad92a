//! Storage: 下载目标的存储抽象
//!
//! - `StorageGateway`: 解析存储根目录、按需授权、提供写入目标、删除残留文件
//! - `auth`: 与外部授权方的异步握手，按根目录缓存授权
//! - `fs`: 本地文件系统实现

pub mod auth;
pub mod fs;

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::core::error::{DownloadError, DownloadResult, StorageOperation};
use crate::core::task::request::Destination;

pub use auth::{AuthorizationBroker, AuthorizationProvider, AuthorizationResponder, AutoGrant, StorageCapability};
pub use fs::FsStorageGateway;

/// 下载过程中写入的残留文件，完成后改名为最终文件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub partial: PathBuf,
    pub target: PathBuf,
}

/// 写入目标
///
/// `start_offset` 是实际的写入起点：不支持定位写入的实现会从 0 开始，
/// 调用方需要据此重置已下载字节数。
pub struct WriteTarget {
    writer: Box<dyn AsyncWrite + Send + Unpin>,
    path: PathBuf,
    start_offset: u64,
}

impl WriteTarget {
    pub fn new(writer: Box<dyn AsyncWrite + Send + Unpin>, path: PathBuf, start_offset: u64) -> Self {
        Self { writer, path, start_offset }
    }

    pub fn start_offset(&self) -> u64 {
        self.start_offset
    }

    pub async fn write(&mut self, data: &[u8]) -> DownloadResult<()> {
        self.writer
            .write_all(data)
            .await
            .map_err(|e| DownloadError::storage(&self.path, StorageOperation::Write, e))
    }

    pub async fn flush(&mut self) -> DownloadResult<()> {
        self.writer
            .flush()
            .await
            .map_err(|e| DownloadError::storage(&self.path, StorageOperation::Write, e))
    }

    pub async fn close(mut self) -> DownloadResult<()> {
        self.flush().await?;
        self.writer
            .shutdown()
            .await
            .map_err(|e| DownloadError::storage(&self.path, StorageOperation::Write, e))
    }
}

/// 存储网关
///
/// 需要授权的根目录上，除 `resolve_root`/`requires_authorization` 外的操作
/// 都要带上 `request_authorization` 得到的授权。
#[async_trait]
pub trait StorageGateway: Send + Sync {
    fn resolve_root(&self, destination: &Destination) -> Option<PathBuf>;

    fn requires_authorization(&self, root: &Path) -> bool;

    async fn request_authorization(&self, root: &Path) -> DownloadResult<StorageCapability>;

    /// 目标的未完成文件是否存在
    async fn exists(&self, destination: &Destination, capability: Option<&StorageCapability>) -> DownloadResult<bool>;

    async fn create_or_find(&self, destination: &Destination, capability: Option<&StorageCapability>) -> DownloadResult<Artifact>;

    async fn open_for_write(&self, artifact: &Artifact, offset: u64) -> DownloadResult<WriteTarget>;

    /// 下载完成后把未完成文件改为最终文件
    async fn finalize(&self, artifact: &Artifact) -> DownloadResult<()>;

    /// 删除已经改名完成的最终文件
    async fn remove_finalized(&self, artifact: &Artifact) -> DownloadResult<()>;

    async fn delete(&self, destination: &Destination, capability: Option<&StorageCapability>) -> DownloadResult<()>;
}

/// 解析根目录并在需要时取得授权
pub async fn authorize_destination(
    gateway: &dyn StorageGateway,
    destination: &Destination,
) -> DownloadResult<Option<StorageCapability>> {
    let root = gateway.resolve_root(destination).ok_or_else(|| {
        DownloadError::storage(destination.path(), StorageOperation::Open, "无法解析存储根目录")
    })?;
    if gateway.requires_authorization(&root) {
        Ok(Some(gateway.request_authorization(&root).await?))
    } else {
        Ok(None)
    }
}

/// 删除目标的残留文件，授权或删除失败只记录日志
pub async fn discard_artifact(gateway: &dyn StorageGateway, destination: &Destination) -> bool {
    let capability = match authorize_destination(gateway, destination).await {
        Ok(capability) => capability,
        Err(e) => {
            log::warn!("清理 {} 时无法取得授权，跳过: {}", destination.path().display(), e);
            return false;
        }
    };
    match gateway.delete(destination, capability.as_ref()).await {
        Ok(()) => true,
        Err(e) => {
            log::warn!("清理 {} 失败: {}", destination.path().display(), e);
            false
        }
    }
}
