//! Core: 下载队列、下载线程调度、错误处理等核心逻辑模块

pub mod cleanup;
pub mod context;
pub mod downloader;
pub mod error;
pub mod queue;
pub mod task;


pub use context::{EngineBuilder, EngineContext};
pub use downloader::Downloader;
pub use error::{DownloadError, DownloadResult, StorageOperation};
pub use queue::RequestQueue;
pub use task::{
    Destination, DownloadId, DownloadRequest, DownloadRequestBuilder, HeaderSet, Priority, Status, DownloadResponse,
};
