use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::events::{DownloadEvent, EventSink, Listeners, Progress};
use super::request::DownloadId;
use super::state::Status;

/// 队列和下载线程共享的任务状态
///
/// 状态迁移和事件投递在同一把锁内完成，所以同一个任务的事件顺序与状态
/// 迁移顺序一致；取消之后其它事件都不会再投递。
pub struct TransferHandle {
    status: Mutex<Status>,
    downloaded: AtomicU64,
    total: AtomicU64,
    events: EventSink,
}

impl TransferHandle {
    pub fn new(events: EventSink) -> Self {
        Self {
            status: Mutex::new(Status::Queued),
            downloaded: AtomicU64::new(0),
            total: AtomicU64::new(0),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Status> {
        self.status.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn id(&self) -> DownloadId {
        self.events.id()
    }

    pub fn status(&self) -> Status {
        *self.lock()
    }

    pub fn progress(&self) -> Progress {
        Progress::new(
            self.downloaded.load(Ordering::Acquire),
            self.total.load(Ordering::Acquire),
        )
    }

    pub fn set_progress(&self, downloaded: u64, total: u64) {
        self.total.store(total, Ordering::Release);
        self.downloaded.store(downloaded, Ordering::Release);
    }

    /// 当前状态属于 `from` 时迁移到 `to`，并在锁内投递事件
    pub fn transition(&self, from: &[Status], to: Status, event: Option<DownloadEvent>) -> bool {
        let mut status = self.lock();
        if !from.contains(&*status) {
            return false;
        }
        *status = to;
        if let Some(event) = event {
            self.events.deliver(event);
        }
        true
    }

    /// 当前状态属于 `expected` 时才投递事件
    pub fn deliver_if(&self, expected: &[Status], event: DownloadEvent) -> bool {
        let status = self.lock();
        if !expected.contains(&*status) {
            return false;
        }
        self.events.deliver(event);
        true
    }

    pub fn replace_listeners(&self, listeners: Listeners) {
        self.events.replace_listeners(listeners);
    }
}
