use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use crate::core::error::DownloadError;

/// 配置结构体
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    /// 默认下载目录
    pub download_dir: String,
    /// 最大并发下载数（传输线程数）
    pub max_concurrent_downloads: usize,
    /// 连接超时（毫秒）
    pub connect_timeout_ms: u64,
    /// 读取超时（毫秒），单次读取数据块的最长等待时间
    pub read_timeout_ms: u64,
    /// User-Agent
    pub user_agent: String,
    /// 是否持久化下载进度（进程重启后可续传）
    pub persistence_enabled: bool,
    /// 下载进度记录文件
    pub state_file: String,
    /// 单次写入文件的最大数据块（字节），更大的网络数据块会被拆开
    pub chunk_size: usize,
    /// 两次写入进度记录之间至少新增的字节数
    pub sync_bytes_threshold: u64,
    /// 两次写入进度记录之间的最短间隔（毫秒）
    pub sync_interval_ms: u64,
    /// 等待存储授权的超时（毫秒）
    pub authorization_timeout_ms: u64,
    /// 超过多少天未更新的记录视为过期
    pub stale_after_days: u32,
    /// 需要授权才能写入的存储根目录
    pub protected_roots: Vec<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            download_dir: "./downloads".to_string(),
            max_concurrent_downloads: 3,
            connect_timeout_ms: 20_000,
            read_timeout_ms: 20_000,
            user_agent: "dlqueue/0.1".to_string(),
            persistence_enabled: true,
            state_file: "./downloads/transfers.json".to_string(),
            chunk_size: 8192,
            sync_bytes_threshold: 65_536,
            sync_interval_ms: 2_000,
            authorization_timeout_ms: 30_000,
            stale_after_days: 7,
            protected_roots: Vec::new(),
        }
    }
}

impl Config {
    /// 加载配置文件，不存在时写入默认配置
    pub fn load(path: &str) -> Result<Self, DownloadError> {
        if Path::new(path).exists() {
            let content = fs::read_to_string(path)
                .map_err(|e| DownloadError::Config(format!("无法读取配置文件 {}: {}", path, e)))?;
            match toml::from_str(&content) {
                Ok(config) => Ok(config),
                Err(e) => {
                    log::warn!("配置文件格式错误: {}，将使用默认配置", e);
                    Ok(Config::default())
                }
            }
        } else {
            let config = Config::default();
            config.save_with_tutorial(path)?;
            Ok(config)
        }
    }

    /// 保存带教程的配置文件
    pub fn save_with_tutorial(&self, path: &str) -> Result<(), DownloadError> {
        if let Some(parent) = Path::new(path).parent() {
            fs::create_dir_all(parent)
                .map_err(|e| DownloadError::Config(format!("无法创建配置目录: {}", e)))?;
        }
        let config_content = toml::to_string_pretty(self)
            .map_err(|e| DownloadError::Config(format!("无法序列化配置: {}", e)))?;
        let full_content = format!("{}\n{}", Config::generate_tutorial_content(), config_content);
        fs::write(path, full_content)
            .map_err(|e| DownloadError::Config(format!("无法写入配置文件 {}: {}", path, e)))?;
        Ok(())
    }

    fn generate_tutorial_content() -> &'static str {
        r#"# dlqueue 配置文件
# ====================
#
# TOML 格式。命令行参数会覆盖这里的设置，优先级：命令行 > 配置文件 > 默认值
#
# 使用示例：
#   dlqueue https://example.com/file.zip
#   dlqueue -p high -d /path/to/downloads https://example.com/file.zip
#   dlqueue -H "Authorization: Bearer xxx" https://example.com/file.zip
#   dlqueue --evict
#   dlqueue --evict-days 7
#
# ==================== 配置项说明 ====================
#
# download_dir              默认下载目录
# max_concurrent_downloads  同时进行的下载任务数，建议 1-5
# connect_timeout_ms        建立连接并收到响应头的最长时间（毫秒）
# read_timeout_ms           单次读取数据块的最长等待时间（毫秒）
# user_agent                请求头中的 User-Agent，请求可单独覆盖
# persistence_enabled       是否把下载进度写入 state_file，关闭后重启无法续传
# state_file                下载进度记录文件（JSON）
# chunk_size                单次写入文件的最大数据块（字节），也是进度回调的最大间隔
# sync_bytes_threshold      两次写入进度记录之间至少新增的字节数
# sync_interval_ms          两次写入进度记录之间的最短间隔（毫秒）
# authorization_timeout_ms  等待受保护目录授权的最长时间（毫秒）
# stale_after_days          超过多少天未更新的未完成下载会被清理（配合 --evict 使用）
# protected_roots           需要授权才能写入的目录列表
#
# ==================== 故障排除 ====================
#
# 问题：经常超时
# 解决：增大 connect_timeout_ms 或 read_timeout_ms
#
# 问题：重启后无法续传
# 解决：确保 persistence_enabled = true 且 state_file 可写
#
"#
    }

    /// 校验配置合法性
    pub fn validate(&self) -> Result<(), DownloadError> {
        if self.max_concurrent_downloads == 0 {
            return Err(DownloadError::Config("并发下载数必须大于0".to_string()));
        }
        if self.connect_timeout_ms == 0 || self.read_timeout_ms == 0 {
            return Err(DownloadError::Config("超时时间必须大于0".to_string()));
        }
        if self.authorization_timeout_ms == 0 {
            return Err(DownloadError::Config("授权超时时间必须大于0".to_string()));
        }
        if self.download_dir.trim().is_empty() {
            return Err(DownloadError::Config("下载目录不能为空".to_string()));
        }
        if self.chunk_size == 0 {
            return Err(DownloadError::Config("缓冲区大小必须大于0".to_string()));
        }
        if self.persistence_enabled && self.state_file.trim().is_empty() {
            return Err(DownloadError::Config("启用持久化时必须指定记录文件".to_string()));
        }
        Ok(())
    }

    /// 合并命令行参数到配置
    pub fn merge_from_args(&mut self, args: &crate::cli::Args) {
        if let Some(dir) = &args.download_dir {
            self.download_dir = dir.clone();
        }
        if let Some(concurrency) = args.concurrency {
            self.max_concurrent_downloads = concurrency;
        }
        if args.no_persist {
            self.persistence_enabled = false;
        }
        if let Some(days) = args.evict_days {
            self.stale_after_days = days;
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    pub fn authorization_timeout(&self) -> Duration {
        Duration::from_millis(self.authorization_timeout_ms)
    }

    /// 获取配置摘要信息
    pub fn get_summary(&self) -> String {
        format!(
            "配置摘要:\n\
            - 下载目录: {}\n\
            - 并发数: {}\n\
            - 连接超时: {} 毫秒\n\
            - 读取超时: {} 毫秒\n\
            - 断点记录: {}\n\
            - 过期清理: {} 天",
            self.download_dir,
            self.max_concurrent_downloads,
            self.connect_timeout_ms,
            self.read_timeout_ms,
            if self.persistence_enabled { self.state_file.as_str() } else { "禁用" },
            self.stale_after_days,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.max_concurrent_downloads, 3);
        assert_eq!(config.connect_timeout(), Duration::from_secs(20));
        assert_eq!(config.sync_bytes_threshold, 65_536);
        assert!(config.persistence_enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        config.max_concurrent_downloads = 0;
        assert!(config.validate().is_err());

        config = Config::default();
        config.read_timeout_ms = 0;
        assert!(config.validate().is_err());

        config = Config::default();
        config.state_file = String::new();
        assert!(config.validate().is_err());
        config.persistence_enabled = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dlqueue.conf");
        let path = path.to_str().unwrap();

        let mut config = Config::default();
        config.max_concurrent_downloads = 5;
        config.protected_roots = vec![PathBuf::from("/mnt/sd")];
        config.save_with_tutorial(path).expect("保存配置失败");

        let content = fs::read_to_string(path).unwrap();
        assert!(content.contains("dlqueue 配置文件"));
        assert!(content.contains("故障排除"));

        let loaded = Config::load(path).expect("加载配置失败");
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_missing_file_creates_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("dlqueue.conf");
        let path = path.to_str().unwrap();

        let config = Config::load(path).unwrap();
        assert_eq!(config, Config::default());
        assert!(Path::new(path).exists());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.conf");
        fs::write(&path, "max_concurrent_downloads = 1\n").unwrap();

        let config = Config::load(path.to_str().unwrap()).unwrap();
        assert_eq!(config.max_concurrent_downloads, 1);
        assert_eq!(config.user_agent, Config::default().user_agent);
    }

    #[test]
    fn test_config_summary() {
        let summary = Config::default().get_summary();
        assert!(summary.contains("配置摘要"));
        assert!(summary.contains("并发数"));
    }
}
