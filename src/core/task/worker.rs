use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::core::context::EngineContext;
use crate::core::error::{DownloadError, DownloadResult};
use crate::events::{DownloadEvent, Progress};
use crate::net::{connect_following_redirects, Connection, ConnectRequest};
use crate::persistence::PersistedRecord;
use crate::storage::{authorize_destination, StorageCapability, WriteTarget};
use super::handle::TransferHandle;
use super::request::DownloadRequest;
use super::state::Status;
use super::util::SyncThrottle;

/// 一次下载尝试的结果
#[derive(Debug, Clone, PartialEq)]
pub enum DownloadResponse {
    Completed,
    Paused,
    Cancelled,
    Failed(DownloadError),
}

impl DownloadResponse {
    pub fn is_successful(&self) -> bool {
        matches!(self, DownloadResponse::Completed)
    }
}

/// 下载线程结束时交给队列的报告
#[derive(Debug)]
pub struct WorkerReport {
    pub outcome: DownloadResponse,
    /// 跟随重定向后的地址，恢复下载时直接使用
    pub url: String,
}

/// 驱动单个任务的一次下载尝试
///
/// 连接 -> 流式写入 -> {完成 | 失败 | 暂停 | 取消}。暂停和取消通过 `stop`
/// 令牌通知，在数据块之间检查，正在等待的连接和读取也会被打断。
pub struct TransferWorker {
    ctx: Arc<EngineContext>,
    request: DownloadRequest,
    handle: Arc<TransferHandle>,
    stop: CancellationToken,
}

impl TransferWorker {
    pub fn new(
        ctx: Arc<EngineContext>,
        request: DownloadRequest,
        handle: Arc<TransferHandle>,
        stop: CancellationToken,
    ) -> Self {
        Self { ctx, request, handle, stop }
    }

    pub async fn run(mut self) -> WorkerReport {
        let result = if self.stop.is_cancelled() {
            Err(self.interruption())
        } else {
            self.handle
                .deliver_if(&[Status::Running], DownloadEvent::StartOrResume);
            self.transfer().await
        };
        let outcome = self.settle(result);
        WorkerReport {
            outcome,
            url: self.request.current_url().to_string(),
        }
    }

    /// 根据结果做最终的状态迁移和事件投递
    fn settle(&self, result: DownloadResult<()>) -> DownloadResponse {
        let id = self.request.id();
        match result {
            Ok(()) => {
                log::info!("下载完成: {} -> {}", id, self.request.destination().path().display());
                DownloadResponse::Completed
            }
            Err(error) if error.is_interruption() => {
                if error == DownloadError::Cancelled {
                    log::info!("下载已取消: {}", id);
                    DownloadResponse::Cancelled
                } else {
                    self.paused()
                }
            }
            Err(error) => {
                if self.handle.transition(
                    &[Status::Running],
                    Status::Failed,
                    Some(DownloadEvent::Failed(error.clone())),
                ) {
                    if let Some(code) = error.response_code() {
                        log::error!("下载失败: {} - 服务器返回 {}", id, code);
                    } else if error.is_connection_error() {
                        log::error!("下载失败: {} - 连接中断，已保留断点: {}", id, error);
                    } else {
                        log::error!("下载失败: {} - {}", id, error);
                    }
                    DownloadResponse::Failed(error)
                } else if self.handle.status() == Status::Cancelled {
                    DownloadResponse::Cancelled
                } else {
                    // 暂停请求和错误同时发生，按暂停处理
                    self.paused()
                }
            }
        }
    }

    fn paused(&self) -> DownloadResponse {
        let progress = self.handle.progress();
        self.handle
            .deliver_if(&[Status::Paused, Status::Queued], DownloadEvent::Paused);
        log::info!(
            "下载已暂停: {} ({}/{} 字节)",
            self.request.id(),
            progress.current_bytes,
            progress.total_bytes
        );
        DownloadResponse::Paused
    }

    /// 被打断的原因：取消以外都按暂停处理
    fn interruption(&self) -> DownloadError {
        if self.handle.status() == Status::Cancelled {
            DownloadError::Cancelled
        } else {
            DownloadError::Paused
        }
    }

    async fn interruptible<T>(&self, fut: impl Future<Output = DownloadResult<T>>) -> DownloadResult<T> {
        tokio::select! {
            biased;
            _ = self.stop.cancelled() => Err(self.interruption()),
            result = fut => result,
        }
    }

    fn connect_timeout(&self) -> Duration {
        self.request
            .connect_timeout()
            .unwrap_or_else(|| self.ctx.config.connect_timeout())
    }

    fn read_timeout(&self) -> Duration {
        self.request
            .read_timeout()
            .unwrap_or_else(|| self.ctx.config.read_timeout())
    }

    async fn transfer(&mut self) -> DownloadResult<()> {
        let ctx = Arc::clone(&self.ctx);
        let destination = self.request.destination().clone();

        let capability = self
            .interruptible(authorize_destination(ctx.storage.as_ref(), &destination))
            .await?;

        let record = self.load_record()?;
        let (mut offset, mut etag, recorded_total) = match &record {
            Some(r) => (r.downloaded_bytes, r.etag.clone(), r.total_bytes),
            None => {
                let progress = self.handle.progress();
                (progress.current_bytes, None, progress.total_bytes)
            }
        };
        if offset > 0 && !ctx.storage.exists(&destination, capability.as_ref()).await? {
            log::warn!("{} 的未完成文件不存在，从头下载", self.request.id());
            offset = 0;
            etag = None;
        }

        let (mut connection, start) = self.open_connection(offset, etag.as_deref(), capability.as_ref()).await?;
        let mut total = if start > 0 {
            connection
                .content_length()
                .map(|len| start + len)
                .unwrap_or(recorded_total)
        } else {
            connection.content_length().unwrap_or(0)
        };
        offset = start;

        let artifact = ctx.storage.create_or_find(&destination, capability.as_ref()).await?;
        let mut target = ctx.storage.open_for_write(&artifact, offset).await?;
        if target.start_offset() != offset {
            // 存储不支持从断点写入，只能重新请求完整内容
            connection.close();
            connection = self.connect(None).await?;
            self.ensure_success(connection.as_ref())?;
            offset = 0;
            total = connection.content_length().unwrap_or(0);
        }
        let etag = connection.response_header("etag");
        self.handle.set_progress(offset, total);

        let downloaded = self.stream(connection, &mut target, offset, total, etag.as_deref()).await?;

        target.close().await?;
        if total > 0 && downloaded < total {
            self.save_record(downloaded, total, etag.as_deref());
            return Err(DownloadError::network(
                self.request.current_url(),
                format!("连接提前关闭: 已收到 {} / {} 字节", downloaded, total),
            ));
        }
        if self.handle.status() == Status::Cancelled {
            return Err(DownloadError::Cancelled);
        }
        ctx.storage.finalize(&artifact).await?;
        if let Err(e) = ctx.store.remove(self.request.id()) {
            log::warn!("删除断点记录失败: {} - {}", self.request.id(), e);
        }
        if !self.handle.transition(
            &[Status::Running, Status::Paused, Status::Queued],
            Status::Completed,
            Some(DownloadEvent::Completed),
        ) {
            // 改名期间被取消，清理只会删除未完成文件，最终文件在这里删除
            if let Err(e) = ctx.storage.remove_finalized(&artifact).await {
                log::warn!("删除已取消任务的文件失败: {} - {}", self.request.id(), e);
            }
            return Err(DownloadError::Cancelled);
        }
        Ok(())
    }

    /// 写数据直到流结束，返回最终的已下载字节数
    async fn stream(
        &self,
        mut connection: Box<dyn Connection>,
        target: &mut WriteTarget,
        offset: u64,
        total: u64,
        etag: Option<&str>,
    ) -> DownloadResult<u64> {
        let config = &self.ctx.config;
        let read_timeout = self.read_timeout();
        let chunk_size = config.chunk_size.max(1);
        let mut downloaded = offset;
        let mut throttle = SyncThrottle::new(config.sync_bytes_threshold, config.sync_interval(), downloaded);

        loop {
            let next = tokio::select! {
                biased;
                _ = self.stop.cancelled() => None,
                read = tokio::time::timeout(read_timeout, connection.read_chunk()) => Some(read),
            };
            let Some(read) = next else {
                return self.interrupted(target, downloaded, total, etag).await;
            };

            let chunk = match read {
                Ok(Ok(Some(chunk))) => chunk,
                Ok(Ok(None)) => break,
                Ok(Err(e)) => {
                    self.checkpoint(target, downloaded, total, etag).await;
                    return Err(e);
                }
                Err(_) => {
                    self.checkpoint(target, downloaded, total, etag).await;
                    return Err(DownloadError::network(
                        self.request.current_url(),
                        format!("读取超时 ({} 毫秒)", read_timeout.as_millis()),
                    ));
                }
            };

            if total > 0 && downloaded + chunk.len() as u64 > total {
                self.checkpoint(target, downloaded, total, etag).await;
                return Err(DownloadError::network(
                    self.request.current_url(),
                    format!("收到的数据超过声明的长度 {}", total),
                ));
            }

            // 网络层的数据块可能很大，按 chunk_size 拆开写入
            let mut chunk = chunk;
            while !chunk.is_empty() {
                let piece = chunk.split_to(chunk.len().min(chunk_size));
                if let Err(e) = target.write(&piece).await {
                    self.save_record(downloaded, total, etag);
                    return Err(e);
                }
                downloaded += piece.len() as u64;
                self.handle.set_progress(downloaded, total);
                self.handle.deliver_if(
                    &[Status::Running],
                    DownloadEvent::Progress(Progress::new(downloaded, total)),
                );

                if throttle.should_sync(downloaded) {
                    self.checkpoint(target, downloaded, total, etag).await;
                    throttle.mark(downloaded);
                }
                if self.stop.is_cancelled() {
                    return self.interrupted(target, downloaded, total, etag).await;
                }
            }
        }
        connection.close();
        Ok(downloaded)
    }

    async fn interrupted(
        &self,
        target: &mut WriteTarget,
        downloaded: u64,
        total: u64,
        etag: Option<&str>,
    ) -> DownloadResult<u64> {
        match self.interruption() {
            DownloadError::Paused => {
                self.checkpoint(target, downloaded, total, etag).await;
                Err(DownloadError::Paused)
            }
            other => Err(other),
        }
    }

    /// 连接并检查状态码，返回连接和实际的起始偏移
    ///
    /// 续传时服务器返回 416 或 ETag 变化说明内容已经不同，丢弃旧数据从头开始；
    /// 返回 200 说明不支持 Range，同样从头开始。
    async fn open_connection(
        &mut self,
        offset: u64,
        etag: Option<&str>,
        capability: Option<&StorageCapability>,
    ) -> DownloadResult<(Box<dyn Connection>, u64)> {
        let range = (offset > 0).then_some(offset);
        let connection = self.connect(range).await?;
        if offset == 0 {
            self.ensure_success(connection.as_ref())?;
            return Ok((connection, 0));
        }

        let code = connection.response_code();
        let current_etag = connection.response_header("etag");
        let etag_changed = matches!((etag, current_etag.as_deref()), (Some(old), Some(new)) if old != new);
        if code == 416 || etag_changed {
            log::warn!(
                "{} 无法从 {} 字节续传（状态 {}，ETag {}），从头下载",
                self.request.id(),
                offset,
                code,
                if etag_changed { "已变化" } else { "未变化" }
            );
            connection.close();
            self.discard_partial(capability).await?;
            let connection = self.connect(None).await?;
            self.ensure_success(connection.as_ref())?;
            return Ok((connection, 0));
        }

        self.ensure_success(connection.as_ref())?;
        if code == 206 {
            log::info!("从 {} 字节继续下载 {}", offset, self.request.id());
            Ok((connection, offset))
        } else {
            log::warn!("服务器不支持断点续传，从头下载 {}", self.request.id());
            Ok((connection, 0))
        }
    }

    async fn connect(&mut self, range: Option<u64>) -> DownloadResult<Box<dyn Connection>> {
        let url = self.request.current_url().to_string();
        let user_agent = self
            .request
            .user_agent()
            .unwrap_or(self.ctx.config.user_agent.as_str())
            .to_string();
        let request = ConnectRequest {
            url: &url,
            headers: self.request.headers(),
            user_agent: &user_agent,
            connect_timeout: self.connect_timeout(),
            read_timeout: self.read_timeout(),
        };
        let (connection, final_url) = self
            .interruptible(connect_following_redirects(self.ctx.client.as_ref(), &request, range))
            .await?;
        self.request.set_current_url(final_url);
        Ok(connection)
    }

    fn ensure_success(&self, connection: &dyn Connection) -> DownloadResult<()> {
        let code = connection.response_code();
        if (200..300).contains(&code) {
            return Ok(());
        }
        let message = reqwest::StatusCode::from_u16(code)
            .ok()
            .and_then(|s| s.canonical_reason())
            .unwrap_or("unknown")
            .to_string();
        Err(DownloadError::Server {
            url: self.request.current_url().to_string(),
            code,
            message,
        })
    }

    fn load_record(&self) -> DownloadResult<Option<PersistedRecord>> {
        let id = self.request.id();
        let record = match self.ctx.store.get(id) {
            Ok(record) => record,
            Err(e) => {
                log::warn!("读取断点记录失败，从头下载: {} - {}", id, e);
                return Ok(None);
            }
        };
        match record {
            Some(r) if !r.matches(self.request.url(), self.request.destination()) => {
                log::error!("断点记录与请求不一致，标识冲突: {} ({} vs {})", id, r.url, self.request.url());
                Err(DownloadError::IdentityCollision(id))
            }
            other => Ok(other),
        }
    }

    async fn discard_partial(&self, capability: Option<&StorageCapability>) -> DownloadResult<()> {
        if let Err(e) = self.ctx.store.remove(self.request.id()) {
            log::warn!("删除断点记录失败: {} - {}", self.request.id(), e);
        }
        self.handle.set_progress(0, 0);
        self.ctx
            .storage
            .delete(self.request.destination(), capability)
            .await
    }

    /// 刷新已写入的数据后保存断点
    async fn checkpoint(&self, target: &mut WriteTarget, downloaded: u64, total: u64, etag: Option<&str>) {
        match target.flush().await {
            Ok(()) => self.save_record(downloaded, total, etag),
            Err(e) => log::warn!("刷新文件失败，跳过保存断点: {}", e),
        }
    }

    fn save_record(&self, downloaded: u64, total: u64, etag: Option<&str>) {
        if downloaded == 0 {
            return;
        }
        let record = PersistedRecord {
            id: self.request.id(),
            url: self.request.url().to_string(),
            destination: self.request.destination().clone(),
            downloaded_bytes: downloaded,
            total_bytes: total,
            etag: etag.map(str::to_string),
            last_modified_at: Utc::now(),
        };
        if let Err(e) = self.ctx.store.upsert(record) {
            log::warn!("保存断点记录失败: {} - {}", self.request.id(), e);
        }
    }
}
