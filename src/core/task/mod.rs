//! `task` 模块包含了与单个下载任务相关的所有逻辑
//!
//! 主要包括：
//! - `request`: 下载请求和任务标识
//! - `state`: 任务状态和优先级
//! - `handle`: 队列与下载线程共享的状态
//! - `admission`: 按优先级排序的等待队列
//! - `messages`: 队列 Actor 的消息
//! - `worker`: 实际的下载逻辑
//! - `util`: 断点写入节流

pub mod admission;
pub mod handle;
pub mod messages;
pub mod request;
pub mod state;
pub mod util;
pub mod worker;

pub use handle::TransferHandle;
pub use request::{Destination, DownloadId, DownloadRequest, DownloadRequestBuilder, HeaderSet};
pub use state::{Priority, Status};
pub use worker::{DownloadResponse, TransferWorker, WorkerReport};
