use actix::Message;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::core::error::DownloadError;
use crate::events::{Listeners, Progress};
use super::handle::TransferHandle;
use super::request::{DownloadId, DownloadRequest};
use super::state::Status;
use super::worker::WorkerReport;

/// 提交下载请求
pub struct Enqueue {
    pub request: DownloadRequest,
    pub listeners: Listeners,
}
impl Message for Enqueue { type Result = Result<DownloadId, DownloadError>; }

/// 暂停任务
pub struct Pause {
    pub id: DownloadId,
}
impl Message for Pause { type Result = Result<(), DownloadError>; }

/// 恢复已暂停的任务
pub struct Resume {
    pub id: DownloadId,
}
impl Message for Resume { type Result = Result<(), DownloadError>; }

/// 取消任务并清理未完成的文件
pub struct Cancel {
    pub id: DownloadId,
}
impl Message for Cancel { type Result = Result<(), DownloadError>; }

/// 取消带有指定标签的全部任务，返回被取消的数量
pub struct CancelByTag {
    pub tag: String,
}
impl Message for CancelByTag { type Result = usize; }

pub struct CancelAll;
impl Message for CancelAll { type Result = usize; }

/// 查询任务状态，未知的任务返回 `Status::Unknown`
pub struct QueryStatus {
    pub id: DownloadId,
}
impl Message for QueryStatus { type Result = Status; }

pub struct QueryProgress {
    pub id: DownloadId,
}
impl Message for QueryProgress { type Result = Option<Progress>; }

/// 在队列中登记一次直接下载，同一标识已有任务未结束时拒绝
pub struct BeginInline {
    pub request: DownloadRequest,
    pub handle: Arc<TransferHandle>,
    pub stop: CancellationToken,
}
impl Message for BeginInline { type Result = Result<(), DownloadError>; }

/// 直接下载结束，释放登记
pub struct EndInline {
    pub id: DownloadId,
    pub report: WorkerReport,
}
impl Message for EndInline { type Result = (); }

/// 清理超过指定天数没有更新的断点记录
pub struct EvictStale {
    pub max_age_days: u32,
}
impl Message for EvictStale { type Result = Result<usize, DownloadError>; }

/// 下载线程结束
pub struct Finish {
    pub id: DownloadId,
    pub slot: usize,
    pub report: WorkerReport,
}
impl Message for Finish { type Result = (); }

/// 后台清理结束
pub struct CleanupDone {
    pub id: DownloadId,
}
impl Message for CleanupDone { type Result = (); }
