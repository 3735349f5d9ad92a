use actix::prelude::*;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::core::cleanup::{cleanup_transfer, evict_stale};
use crate::core::context::EngineContext;
use crate::core::error::DownloadError;
use crate::core::task::admission::AdmissionQueue;
use crate::core::task::messages::{
    BeginInline, Cancel, CancelAll, CancelByTag, CleanupDone, EndInline, Enqueue, EvictStale, Finish, Pause, QueryProgress,
    QueryStatus, Resume,
};
use crate::core::task::{DownloadId, DownloadRequest, DownloadResponse, Status, TransferHandle, TransferWorker, WorkerReport};
use crate::events::{listener_slot, DownloadEvent, EventDispatcher};

/// 一个下载线程
struct TransferSlot {
    arbiter: Arbiter,
    current: Option<DownloadId>,
}

/// 队列中的一个任务
struct Entry {
    request: DownloadRequest,
    handle: Arc<TransferHandle>,
    sequence: u64,
    stop: Option<CancellationToken>,
    slot: Option<usize>,
    /// 正在由 `Downloader::execute` 直接下载
    inline: bool,
    /// 等当前的下载线程或清理结束后再进入等待队列
    deferred: bool,
    cleanup_pending: bool,
    cleaning: bool,
}

impl Entry {
    fn has_worker(&self) -> bool {
        self.slot.is_some() || self.inline
    }

    fn idle(&self) -> bool {
        !self.has_worker() && !self.cleaning && !self.cleanup_pending
    }

    fn busy(&self) -> bool {
        !self.handle.status().is_terminal() || !self.idle()
    }
}

/// 下载队列 Actor
///
/// 持有全部任务，按优先级把等待中的任务分配给空闲的下载线程。每个下载线程
/// 是一个独立的 `Arbiter`，同时只运行一个任务；取消后的清理和过期记录清理
/// 在后台 `Arbiter` 上执行。已结束的任务保留在表中，用于状态查询。
pub struct RequestQueue {
    ctx: Arc<EngineContext>,
    dispatcher: EventDispatcher,
    entries: HashMap<DownloadId, Entry>,
    admission: AdmissionQueue,
    slots: Vec<TransferSlot>,
    background: Arbiter,
    next_sequence: u64,
}

impl RequestQueue {
    /// 必须在 actix System 内调用
    pub fn new(ctx: Arc<EngineContext>, dispatcher: EventDispatcher) -> Self {
        let slots = (0..ctx.config.max_concurrent_downloads)
            .map(|_| TransferSlot {
                arbiter: Arbiter::new(),
                current: None,
            })
            .collect();
        Self {
            ctx,
            dispatcher,
            entries: HashMap::new(),
            admission: AdmissionQueue::new(),
            slots,
            background: Arbiter::new(),
            next_sequence: 0,
        }
    }

    fn next_sequence(&mut self) -> u64 {
        self.next_sequence += 1;
        self.next_sequence
    }

    /// 空闲时进入等待队列，否则等当前工作结束
    fn admit_or_defer(&mut self, id: DownloadId) {
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };
        if entry.idle() {
            entry.deferred = false;
            if !self.admission.contains(id) {
                self.admission.push(id, entry.request.priority(), entry.sequence);
            }
        } else {
            entry.deferred = true;
        }
    }

    fn admit_deferred(&mut self, id: DownloadId) {
        let ready = self
            .entries
            .get(&id)
            .map(|e| e.deferred && e.idle() && e.handle.status() == Status::Queued)
            .unwrap_or(false);
        if ready {
            self.admit_or_defer(id);
        }
    }

    /// 把等待中的任务分配给空闲的下载线程
    fn pump(&mut self, ctx: &mut Context<Self>) {
        loop {
            let Some(slot) = self.slots.iter().position(|s| s.current.is_none()) else {
                break;
            };
            let Some(id) = self.admission.pop() else {
                break;
            };
            let Some(entry) = self.entries.get_mut(&id) else {
                continue;
            };
            if !entry.idle() {
                entry.deferred = true;
                continue;
            }
            if !entry.handle.transition(&[Status::Queued], Status::Running, None) {
                continue;
            }

            let stop = CancellationToken::new();
            let worker = TransferWorker::new(
                Arc::clone(&self.ctx),
                entry.request.clone(),
                Arc::clone(&entry.handle),
                stop.clone(),
            );
            let addr = ctx.address();
            let spawned = self.slots[slot].arbiter.spawn(async move {
                let report = worker.run().await;
                addr.do_send(Finish { id, slot, report });
            });

            if spawned {
                log::info!("开始下载 {} (线程 {}): {}", id, slot, entry.request.current_url());
                entry.stop = Some(stop);
                entry.slot = Some(slot);
                self.slots[slot].current = Some(id);
            } else {
                let error = DownloadError::Unknown(format!("下载线程 {} 已停止", slot));
                log::error!("无法启动任务 {}: {}", id, error);
                entry.handle.transition(
                    &[Status::Running],
                    Status::Failed,
                    Some(DownloadEvent::Failed(error)),
                );
            }
        }
    }

    fn spawn_cleanup(&mut self, id: DownloadId, ctx: &mut Context<Self>) {
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };
        entry.cleanup_pending = false;
        entry.cleaning = true;

        let cleanup = cleanup_transfer(Arc::clone(&self.ctx), id, entry.request.destination().clone());
        let addr = ctx.address();
        if !self.background.spawn(async move {
            cleanup.await;
            addr.do_send(CleanupDone { id });
        }) {
            log::warn!("后台线程已停止，跳过清理: {}", id);
            entry.cleaning = false;
        }
    }

    /// 取消一个未结束的任务，返回是否真正取消
    fn cancel_entry(&mut self, id: DownloadId, ctx: &mut Context<Self>) -> bool {
        let Some(entry) = self.entries.get_mut(&id) else {
            return false;
        };
        if !entry.handle.transition(
            &[Status::Queued, Status::Running, Status::Paused],
            Status::Cancelled,
            Some(DownloadEvent::Cancelled),
        ) {
            return false;
        }
        log::info!("取消任务: {}", id);
        entry.deferred = false;
        self.admission.remove(id);
        if let Some(stop) = &entry.stop {
            stop.cancel();
        }
        if entry.has_worker() {
            // 等下载线程退出后再删除文件
            entry.cleanup_pending = true;
        } else {
            self.spawn_cleanup(id, ctx);
        }
        true
    }

    fn cancel_matching(&mut self, ctx: &mut Context<Self>, filter: impl Fn(&Entry) -> bool) -> usize {
        let ids: Vec<DownloadId> = self
            .entries
            .iter()
            .filter(|(_, e)| !e.handle.status().is_terminal() && filter(e))
            .map(|(id, _)| *id)
            .collect();
        ids.into_iter().filter(|id| self.cancel_entry(*id, ctx)).count()
    }

    /// 下载线程或直接下载结束后释放任务，按需清理或重新排队
    fn worker_exited(&mut self, id: DownloadId, report: WorkerReport, ctx: &mut Context<Self>) {
        let cleanup = match self.entries.get_mut(&id) {
            Some(entry) => {
                entry.slot = None;
                entry.inline = false;
                entry.stop = None;
                entry.request.set_current_url(report.url);
                if let DownloadResponse::Failed(error) = &report.outcome {
                    if error.is_fatal() {
                        entry.cleanup_pending = true;
                    }
                }
                entry.cleanup_pending
            }
            None => false,
        };

        if cleanup {
            self.spawn_cleanup(id, ctx);
        } else {
            self.admit_deferred(id);
        }
        self.pump(ctx);
    }

    fn unknown(id: DownloadId) -> DownloadError {
        DownloadError::Unknown(format!("任务ID不存在: {}", id))
    }
}

impl Actor for RequestQueue {
    type Context = Context<Self>;

    fn started(&mut self, _ctx: &mut Self::Context) {
        log::info!("下载队列已启动，{} 个下载线程", self.slots.len());
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        for entry in self.entries.values() {
            if let Some(stop) = &entry.stop {
                stop.cancel();
            }
        }
        for slot in &self.slots {
            slot.arbiter.stop();
        }
        self.background.stop();
        log::info!("下载队列已停止");
    }
}

/// 处理提交下载请求
impl Handler<Enqueue> for RequestQueue {
    type Result = Result<DownloadId, DownloadError>;
    fn handle(&mut self, msg: Enqueue, ctx: &mut Self::Context) -> Self::Result {
        let Enqueue { request, listeners } = msg;
        let id = request.id();

        if let Some(entry) = self.entries.get_mut(&id) {
            if !entry.request.same_transfer(&request) {
                log::error!("任务标识冲突: {} ({} 与 {})", id, entry.request.url(), request.url());
                return Err(DownloadError::IdentityCollision(id));
            }
            match entry.handle.status() {
                status if status.is_active() => {
                    log::info!("任务已在队列中，忽略重复提交: {}", id);
                    return Ok(id);
                }
                Status::Paused => {
                    let current_url = entry.request.current_url().to_string();
                    entry.request = request;
                    entry.request.set_current_url(current_url);
                    entry.handle.replace_listeners(listeners);
                    entry.handle.transition(&[Status::Paused], Status::Queued, None);
                    log::info!("重新提交已暂停的任务: {}", id);
                }
                _ => {
                    let sink = self.dispatcher.sink(id, listener_slot(listeners));
                    entry.handle = Arc::new(TransferHandle::new(sink));
                    entry.request = request;
                    self.next_sequence += 1;
                    entry.sequence = self.next_sequence;
                    log::info!("重新提交任务: {}", id);
                }
            }
        } else {
            let sequence = self.next_sequence();
            let sink = self.dispatcher.sink(id, listener_slot(listeners));
            log::info!("添加任务 {} ({:?}): {}", id, request.priority(), request.url());
            self.entries.insert(
                id,
                Entry {
                    request,
                    handle: Arc::new(TransferHandle::new(sink)),
                    sequence,
                    stop: None,
                    slot: None,
                    inline: false,
                    deferred: false,
                    cleanup_pending: false,
                    cleaning: false,
                },
            );
        }

        self.admit_or_defer(id);
        self.pump(ctx);
        Ok(id)
    }
}

/// 暂停任务
impl Handler<Pause> for RequestQueue {
    type Result = Result<(), DownloadError>;
    fn handle(&mut self, msg: Pause, _ctx: &mut Self::Context) -> Self::Result {
        let id = msg.id;
        let entry = self.entries.get_mut(&id).ok_or_else(|| Self::unknown(id))?;
        match entry.handle.status() {
            Status::Running => {
                if entry.handle.transition(&[Status::Running], Status::Paused, None) {
                    log::info!("暂停任务: {}", id);
                    if let Some(stop) = &entry.stop {
                        stop.cancel();
                    }
                }
            }
            Status::Queued => {
                // 下载线程还没退出时由它投递暂停事件
                let event = (!entry.has_worker()).then_some(DownloadEvent::Paused);
                if entry.handle.transition(&[Status::Queued], Status::Paused, event) {
                    log::info!("暂停等待中的任务: {}", id);
                    entry.deferred = false;
                    self.admission.remove(id);
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// 恢复任务
impl Handler<Resume> for RequestQueue {
    type Result = Result<(), DownloadError>;
    fn handle(&mut self, msg: Resume, ctx: &mut Self::Context) -> Self::Result {
        let id = msg.id;
        let entry = self.entries.get(&id).ok_or_else(|| Self::unknown(id))?;
        if entry.handle.transition(&[Status::Paused], Status::Queued, None) {
            log::info!("恢复任务: {}", id);
            self.admit_or_defer(id);
            self.pump(ctx);
        }
        Ok(())
    }
}

/// 取消任务
impl Handler<Cancel> for RequestQueue {
    type Result = Result<(), DownloadError>;
    fn handle(&mut self, msg: Cancel, ctx: &mut Self::Context) -> Self::Result {
        if !self.entries.contains_key(&msg.id) {
            return Err(Self::unknown(msg.id));
        }
        self.cancel_entry(msg.id, ctx);
        Ok(())
    }
}

impl Handler<CancelByTag> for RequestQueue {
    type Result = usize;
    fn handle(&mut self, msg: CancelByTag, ctx: &mut Self::Context) -> Self::Result {
        let cancelled = self.cancel_matching(ctx, |e| e.request.tag() == Some(msg.tag.as_str()));
        log::info!("按标签 {} 取消了 {} 个任务", msg.tag, cancelled);
        cancelled
    }
}

impl Handler<CancelAll> for RequestQueue {
    type Result = usize;
    fn handle(&mut self, _msg: CancelAll, ctx: &mut Self::Context) -> Self::Result {
        let cancelled = self.cancel_matching(ctx, |_| true);
        log::info!("取消了全部 {} 个任务", cancelled);
        cancelled
    }
}

/// 查询任务状态
impl Handler<QueryStatus> for RequestQueue {
    type Result = MessageResult<QueryStatus>;
    fn handle(&mut self, msg: QueryStatus, _ctx: &mut Self::Context) -> Self::Result {
        MessageResult(
            self.entries
                .get(&msg.id)
                .map(|e| e.handle.status())
                .unwrap_or(Status::Unknown),
        )
    }
}

/// 查询任务进度
impl Handler<QueryProgress> for RequestQueue {
    type Result = MessageResult<QueryProgress>;
    fn handle(&mut self, msg: QueryProgress, _ctx: &mut Self::Context) -> Self::Result {
        MessageResult(self.entries.get(&msg.id).map(|e| e.handle.progress()))
    }
}

/// 登记直接下载：登记期间同一标识的提交会被合并，不会再启动下载线程
impl Handler<BeginInline> for RequestQueue {
    type Result = Result<(), DownloadError>;
    fn handle(&mut self, msg: BeginInline, _ctx: &mut Self::Context) -> Self::Result {
        let BeginInline { request, handle, stop } = msg;
        let id = request.id();
        if let Some(entry) = self.entries.get(&id) {
            if !entry.request.same_transfer(&request) {
                return Err(DownloadError::IdentityCollision(id));
            }
            if entry.busy() {
                return Err(DownloadError::Unknown(format!("任务已在队列中: {}", id)));
            }
        }
        if !handle.transition(&[Status::Queued], Status::Running, None) {
            return Err(DownloadError::Unknown(format!("任务状态异常: {}", id)));
        }

        let sequence = self.next_sequence();
        self.entries.insert(
            id,
            Entry {
                request,
                handle,
                sequence,
                stop: Some(stop),
                slot: None,
                inline: true,
                deferred: false,
                cleanup_pending: false,
                cleaning: false,
            },
        );
        Ok(())
    }
}

impl Handler<EndInline> for RequestQueue {
    type Result = ();
    fn handle(&mut self, msg: EndInline, ctx: &mut Self::Context) {
        self.worker_exited(msg.id, msg.report, ctx);
    }
}

/// 清理过期记录，在后台线程执行
impl Handler<EvictStale> for RequestQueue {
    type Result = ResponseFuture<Result<usize, DownloadError>>;
    fn handle(&mut self, msg: EvictStale, _ctx: &mut Self::Context) -> Self::Result {
        let active: HashSet<DownloadId> = self
            .entries
            .iter()
            .filter(|(_, e)| e.busy())
            .map(|(id, _)| *id)
            .collect();
        let (tx, rx) = oneshot::channel();
        let eviction = evict_stale(Arc::clone(&self.ctx), msg.max_age_days, active);
        self.background.spawn(async move {
            let _ = tx.send(eviction.await);
        });
        Box::pin(async move {
            rx.await
                .unwrap_or_else(|_| Err(DownloadError::Unknown("后台清理线程已停止".to_string())))
        })
    }
}

/// 下载线程结束
impl Handler<Finish> for RequestQueue {
    type Result = ();
    fn handle(&mut self, msg: Finish, ctx: &mut Self::Context) {
        let Finish { id, slot, report } = msg;
        if let Some(s) = self.slots.get_mut(slot) {
            if s.current == Some(id) {
                s.current = None;
            }
        }
        log::debug!("线程 {} 空闲，任务 {} 结果: {:?}", slot, id, report.outcome);
        self.worker_exited(id, report, ctx);
    }
}

/// 后台清理结束
impl Handler<CleanupDone> for RequestQueue {
    type Result = ();
    fn handle(&mut self, msg: CleanupDone, ctx: &mut Self::Context) {
        if let Some(entry) = self.entries.get_mut(&msg.id) {
            entry.cleaning = false;
        }
        self.admit_deferred(msg.id);
        self.pump(ctx);
    }
}
