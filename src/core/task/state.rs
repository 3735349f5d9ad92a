use serde::{Deserialize, Serialize};
use std::fmt;

/// 下载任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    Queued,
    Running,
    Paused,
    Cancelled,
    Completed,
    Failed,
    /// 队列中不存在该任务
    Unknown,
}

impl Status {
    /// 终止状态：之后不会再有状态迁移
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Cancelled | Status::Completed | Status::Failed)
    }

    /// 正在排队或下载中
    pub fn is_active(self) -> bool {
        matches!(self, Status::Queued | Status::Running)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Status::Queued => "排队中",
            Status::Running => "下载中",
            Status::Paused => "已暂停",
            Status::Cancelled => "已取消",
            Status::Completed => "已完成",
            Status::Failed => "失败",
            Status::Unknown => "未知",
        };
        f.write_str(text)
    }
}

/// 任务优先级，越大越先被调度
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Immediate,
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "medium" | "default" => Ok(Priority::Medium),
            "high" => Ok(Priority::High),
            "immediate" => Ok(Priority::Immediate),
            other => Err(format!("未知的优先级: {}", other)),
        }
    }
}
