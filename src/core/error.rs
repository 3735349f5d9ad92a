use std::fmt;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::core::task::request::DownloadId;

/// 存储操作类型，用于描述失败发生在哪一步
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageOperation {
    Create,
    Open,
    Write,
    Rename,
    Delete,
}

impl fmt::Display for StorageOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StorageOperation::Create => "创建",
            StorageOperation::Open => "打开",
            StorageOperation::Write => "写入",
            StorageOperation::Rename => "重命名",
            StorageOperation::Delete => "删除",
        };
        f.write_str(name)
    }
}

/// 下载引擎的错误类型
///
/// 所有变体都只携带字符串等可克隆的数据，这样同一个错误既能交给 `on_error`
/// 回调，也能作为 `execute` 的返回值。
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DownloadError {
    #[error("网络错误 ({url}): {message}")]
    Network { url: String, message: String },

    #[error("服务器返回错误状态 {code} ({url}): {message}")]
    Server {
        url: String,
        code: u16,
        message: String,
    },

    #[error("重定向次数超过上限 {limit} ({url})")]
    RedirectLimitExceeded { url: String, limit: usize },

    #[error("重定向响应缺少 Location 头 ({url})")]
    RedirectLocationMissing { url: String },

    #[error("存储授权被拒绝: {}", root.display())]
    AuthorizationDenied { root: PathBuf },

    #[error("等待存储授权超时 ({timeout_ms} 毫秒): {}", root.display())]
    AuthorizationTimedOut { root: PathBuf, timeout_ms: u64 },

    #[error("存储{operation}失败 ({}): {message}", path.display())]
    Storage {
        path: PathBuf,
        operation: StorageOperation,
        message: String,
    },

    #[error("持久化存储错误: {0}")]
    Persistence(String),

    #[error("下载标识冲突: {0}")]
    IdentityCollision(DownloadId),

    #[error("无效的URL: {0}")]
    InvalidUrl(String),

    #[error("配置错误: {0}")]
    Config(String),

    #[error("下载被取消")]
    Cancelled,

    #[error("下载暂停")]
    Paused,

    #[error("未知错误: {0}")]
    Unknown(String),
}

impl DownloadError {
    pub fn network(url: impl Into<String>, message: impl fmt::Display) -> Self {
        DownloadError::Network {
            url: url.into(),
            message: message.to_string(),
        }
    }

    pub fn storage(path: impl Into<PathBuf>, operation: StorageOperation, err: impl fmt::Display) -> Self {
        DownloadError::Storage {
            path: path.into(),
            operation,
            message: err.to_string(),
        }
    }

    /// 不可恢复的错误：失败后应清理残留文件和记录
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DownloadError::AuthorizationDenied { .. } | DownloadError::InvalidUrl(_)
        )
    }

    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            DownloadError::Network { .. }
                | DownloadError::RedirectLimitExceeded { .. }
                | DownloadError::RedirectLocationMissing { .. }
        )
    }

    /// 服务器返回的状态码（仅服务器错误有）
    pub fn response_code(&self) -> Option<u16> {
        match self {
            DownloadError::Server { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// 暂停与取消只是流程标记，不会作为错误事件投递
    pub fn is_interruption(&self) -> bool {
        matches!(self, DownloadError::Paused | DownloadError::Cancelled)
    }
}

impl From<String> for DownloadError {
    fn from(error: String) -> Self {
        DownloadError::Unknown(error)
    }
}

impl From<&str> for DownloadError {
    fn from(error: &str) -> Self {
        DownloadError::Unknown(error.to_string())
    }
}

impl From<serde_json::Error> for DownloadError {
    fn from(error: serde_json::Error) -> Self {
        DownloadError::Persistence(error.to_string())
    }
}

impl From<actix::MailboxError> for DownloadError {
    fn from(error: actix::MailboxError) -> Self {
        DownloadError::Unknown(format!("下载队列不可用: {}", error))
    }
}

/// 没有路径上下文的 IO 错误
impl From<io::Error> for DownloadError {
    fn from(error: io::Error) -> Self {
        DownloadError::Storage {
            path: PathBuf::new(),
            operation: StorageOperation::Write,
            message: error.to_string(),
        }
    }
}

pub type DownloadResult<T> = Result<T, DownloadError>;
