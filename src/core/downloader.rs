use actix::prelude::*;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::core::context::EngineContext;
use crate::core::error::{DownloadError, DownloadResult};
use crate::core::queue::RequestQueue;
use crate::core::task::messages::{
    BeginInline, Cancel, CancelAll, CancelByTag, EndInline, Enqueue, EvictStale, Pause, QueryProgress, QueryStatus,
    Resume,
};
use crate::core::task::{DownloadId, DownloadRequest, DownloadResponse, Status, TransferHandle, TransferWorker};
use crate::events::{listener_slot, EventDispatcher, Listeners, Progress};

/// 下载引擎的入口
///
/// 克隆后共用同一个队列。必须在 actix System 内创建，例如 `#[actix::main]`。
#[derive(Clone)]
pub struct Downloader {
    queue: Addr<RequestQueue>,
    ctx: Arc<EngineContext>,
    dispatcher: EventDispatcher,
}

impl Downloader {
    pub fn start(ctx: EngineContext) -> DownloadResult<Self> {
        let ctx = Arc::new(ctx);
        let dispatcher = EventDispatcher::start()
            .map_err(|e| DownloadError::Unknown(format!("无法启动事件分发线程: {}", e)))?;
        let queue = RequestQueue::new(Arc::clone(&ctx), dispatcher.clone()).start();
        Ok(Self { queue, ctx, dispatcher })
    }

    pub fn context(&self) -> &EngineContext {
        &self.ctx
    }

    /// 提交请求，返回任务标识
    ///
    /// 相同标识的任务还在进行中时不会重复下载；已暂停的任务会换上新的回调
    /// 后继续。
    pub async fn enqueue(&self, request: DownloadRequest, listeners: Listeners) -> DownloadResult<DownloadId> {
        self.queue.send(Enqueue { request, listeners }).await?
    }

    pub async fn pause(&self, id: DownloadId) -> DownloadResult<()> {
        self.queue.send(Pause { id }).await?
    }

    pub async fn resume(&self, id: DownloadId) -> DownloadResult<()> {
        self.queue.send(Resume { id }).await?
    }

    pub async fn cancel(&self, id: DownloadId) -> DownloadResult<()> {
        self.queue.send(Cancel { id }).await?
    }

    pub async fn cancel_by_tag(&self, tag: impl Into<String>) -> DownloadResult<usize> {
        Ok(self.queue.send(CancelByTag { tag: tag.into() }).await?)
    }

    pub async fn cancel_all(&self) -> DownloadResult<usize> {
        Ok(self.queue.send(CancelAll).await?)
    }

    /// 队列不可用时返回 `Status::Unknown`
    pub async fn status(&self, id: DownloadId) -> Status {
        self.queue.send(QueryStatus { id }).await.unwrap_or(Status::Unknown)
    }

    pub async fn progress(&self, id: DownloadId) -> Option<Progress> {
        self.queue.send(QueryProgress { id }).await.ok().flatten()
    }

    /// 清理超过 `max_age_days` 天没有更新的未完成下载
    pub async fn evict_stale_transfers(&self, max_age_days: u32) -> DownloadResult<usize> {
        self.queue.send(EvictStale { max_age_days }).await?
    }

    /// 按配置的 `stale_after_days` 清理过期的未完成下载
    pub async fn evict_expired_transfers(&self) -> DownloadResult<usize> {
        self.evict_stale_transfers(self.ctx.config.stale_after_days).await
    }

    /// 在当前任务中直接下载，不占用队列的下载线程
    ///
    /// 同一个标识正在队列中时拒绝执行。下载期间标识登记在队列里，可以用
    /// `pause`/`cancel` 控制，重复提交同一请求不会启动第二个下载。
    pub async fn execute(&self, request: DownloadRequest, listeners: Listeners) -> DownloadResponse {
        let id = request.id();
        let handle = Arc::new(TransferHandle::new(self.dispatcher.sink(id, listener_slot(listeners))));
        let stop = CancellationToken::new();
        let reservation = BeginInline {
            request: request.clone(),
            handle: Arc::clone(&handle),
            stop: stop.clone(),
        };
        match self.queue.send(reservation).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                log::warn!("拒绝直接下载 {}: {}", id, e);
                return DownloadResponse::Failed(e);
            }
            Err(e) => return DownloadResponse::Failed(e.into()),
        }

        log::info!("直接下载 {}: {}", id, request.url());
        let worker = TransferWorker::new(Arc::clone(&self.ctx), request, handle, stop);
        let report = worker.run().await;
        let outcome = report.outcome.clone();
        self.queue.do_send(EndInline { id, report });
        outcome
    }
}

impl DownloadRequest {
    /// 提交到下载器，等同于 `Downloader::enqueue`
    pub async fn start(self, downloader: &Downloader, listeners: Listeners) -> DownloadResult<DownloadId> {
        downloader.enqueue(self, listeners).await
    }
}
