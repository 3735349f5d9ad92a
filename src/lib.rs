//! dlqueue: 带优先级队列、暂停恢复和断点续传的下载引擎
//!
//! - `core`: 下载队列、下载线程和对外的 `Downloader`
//! - `net`: HTTP 连接和重定向
//! - `storage`: 存储目标和授权
//! - `persistence`: 断点记录
//! - `events`: 事件回调分发

pub mod cli;
pub mod config;
pub mod core;
pub mod events;
pub mod net;
pub mod persistence;
pub mod storage;
pub mod ui;
pub mod utils;

pub use crate::config::Config;
pub use crate::core::{DownloadError, DownloadResult, Downloader, EngineBuilder};
pub use crate::events::{DownloadEvent, Listeners, Progress};
