//! Events: 下载生命周期回调与事件分发
//!
//! 所有回调都在同一个专用线程上按顺序执行，回调代码不会和传输 IO 并发。
//! 对单个任务，事件顺序固定为：开始/恢复、若干进度、唯一的终止事件
//! （完成、错误或取消）。终止事件投递后回调会被释放，之后的事件直接丢弃。

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;

use crate::core::error::DownloadError;
use crate::core::task::request::DownloadId;

/// 下载进度
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub current_bytes: u64,
    /// 0 表示总大小未知
    pub total_bytes: u64,
}

impl Progress {
    pub fn new(current_bytes: u64, total_bytes: u64) -> Self {
        Self { current_bytes, total_bytes }
    }

    /// 百分比，总大小未知时返回 None
    pub fn percent(&self) -> Option<u64> {
        if self.total_bytes == 0 {
            None
        } else {
            Some(self.current_bytes.saturating_mul(100) / self.total_bytes)
        }
    }
}

/// 下载生命周期事件
#[derive(Debug, Clone, PartialEq)]
pub enum DownloadEvent {
    StartOrResume,
    Progress(Progress),
    Paused,
    Completed,
    Failed(DownloadError),
    Cancelled,
}

impl DownloadEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DownloadEvent::Completed | DownloadEvent::Failed(_) | DownloadEvent::Cancelled
        )
    }
}

type Callback = Box<dyn FnMut() + Send>;

/// 一组可选的回调，未设置的回调不会被调用
#[derive(Default)]
pub struct Listeners {
    pub on_start_or_resume: Option<Callback>,
    pub on_progress: Option<Box<dyn FnMut(Progress) + Send>>,
    pub on_pause: Option<Callback>,
    pub on_cancel: Option<Callback>,
    pub on_complete: Option<Callback>,
    pub on_error: Option<Box<dyn FnMut(DownloadError) + Send>>,
}

impl Listeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_start_or_resume(mut self, f: impl FnMut() + Send + 'static) -> Self {
        self.on_start_or_resume = Some(Box::new(f));
        self
    }

    pub fn on_progress(mut self, f: impl FnMut(Progress) + Send + 'static) -> Self {
        self.on_progress = Some(Box::new(f));
        self
    }

    pub fn on_pause(mut self, f: impl FnMut() + Send + 'static) -> Self {
        self.on_pause = Some(Box::new(f));
        self
    }

    pub fn on_cancel(mut self, f: impl FnMut() + Send + 'static) -> Self {
        self.on_cancel = Some(Box::new(f));
        self
    }

    pub fn on_complete(mut self, f: impl FnMut() + Send + 'static) -> Self {
        self.on_complete = Some(Box::new(f));
        self
    }

    pub fn on_error(mut self, f: impl FnMut(DownloadError) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }

    fn invoke(&mut self, event: DownloadEvent) {
        match event {
            DownloadEvent::StartOrResume => {
                if let Some(f) = self.on_start_or_resume.as_mut() {
                    f()
                }
            }
            DownloadEvent::Progress(progress) => {
                if let Some(f) = self.on_progress.as_mut() {
                    f(progress)
                }
            }
            DownloadEvent::Paused => {
                if let Some(f) = self.on_pause.as_mut() {
                    f()
                }
            }
            DownloadEvent::Completed => {
                if let Some(f) = self.on_complete.as_mut() {
                    f()
                }
            }
            DownloadEvent::Failed(error) => {
                if let Some(f) = self.on_error.as_mut() {
                    f(error)
                }
            }
            DownloadEvent::Cancelled => {
                if let Some(f) = self.on_cancel.as_mut() {
                    f()
                }
            }
        }
    }
}

impl fmt::Debug for Listeners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listeners")
            .field("on_start_or_resume", &self.on_start_or_resume.is_some())
            .field("on_progress", &self.on_progress.is_some())
            .field("on_pause", &self.on_pause.is_some())
            .field("on_cancel", &self.on_cancel.is_some())
            .field("on_complete", &self.on_complete.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

/// 单个任务的回调槽，终止事件之后被清空
pub type ListenerSlot = Arc<Mutex<Option<Listeners>>>;

pub fn listener_slot(listeners: Listeners) -> ListenerSlot {
    Arc::new(Mutex::new(Some(listeners)))
}

struct Delivery {
    id: DownloadId,
    event: DownloadEvent,
    listeners: ListenerSlot,
}

/// 事件分发器：一个专用线程按到达顺序执行回调
///
/// 所有克隆共用同一个线程，最后一个发送端释放后线程退出。
#[derive(Clone)]
pub struct EventDispatcher {
    sender: mpsc::Sender<Delivery>,
}

impl EventDispatcher {
    pub fn start() -> std::io::Result<Self> {
        let (sender, receiver) = mpsc::channel::<Delivery>();
        thread::Builder::new()
            .name("dlqueue-events".to_string())
            .spawn(move || {
                for delivery in receiver {
                    run_delivery(delivery);
                }
                log::debug!("事件分发线程退出");
            })?;
        Ok(Self { sender })
    }

    /// 为某个任务创建事件出口
    pub fn sink(&self, id: DownloadId, listeners: ListenerSlot) -> EventSink {
        EventSink {
            id,
            sender: self.sender.clone(),
            listeners,
        }
    }
}

fn run_delivery(delivery: Delivery) {
    let Delivery { id, event, listeners } = delivery;
    let terminal = event.is_terminal();
    let mut slot = match listeners.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    let Some(callbacks) = slot.as_mut() else {
        log::debug!("任务 {} 的回调已释放，丢弃事件 {:?}", id, event);
        return;
    };
    let name = format!("{:?}", event);
    if panic::catch_unwind(AssertUnwindSafe(|| callbacks.invoke(event))).is_err() {
        log::error!("任务 {} 的回调在处理 {} 时 panic", id, name);
    }
    if terminal {
        // 终止事件之后释放回调，断开回调与请求之间的引用
        *slot = None;
    }
}

/// 某个任务的事件出口，可在任意线程上使用
#[derive(Clone)]
pub struct EventSink {
    id: DownloadId,
    sender: mpsc::Sender<Delivery>,
    listeners: ListenerSlot,
}

impl EventSink {
    pub fn id(&self) -> DownloadId {
        self.id
    }

    pub fn deliver(&self, event: DownloadEvent) {
        let delivery = Delivery {
            id: self.id,
            event,
            listeners: Arc::clone(&self.listeners),
        };
        if self.sender.send(delivery).is_err() {
            log::warn!("事件分发线程已停止，任务 {} 的事件被丢弃", self.id);
        }
    }

    /// 换上新的回调（重新提交一个已结束的任务时使用）
    pub fn replace_listeners(&self, listeners: Listeners) {
        let mut slot = match self.listeners.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = Some(listeners);
    }
}
