//! CLI: 命令行接口和参数解析模块
//!
//! ## 主要功能
//!
//! - 命令行参数解析和验证
//! - 配置文件路径管理
//! - URL 列表处理（命令行参数和文件）
//! - 自定义请求头解析
//! - 配置文件编辑器集成
//!
//! ## 支持的命令
//!
//! - 基本下载：`dlqueue <url>`
//! - 批量下载：`dlqueue -f urls.txt`
//! - 编辑配置：`dlqueue -e`
//! - 指定配置：`dlqueue -c config.conf <url>`
//! - 附加请求头：`dlqueue -H "Authorization: Bearer xxx" <url>`
//! - 清理过期下载：`dlqueue --evict`（天数取自配置文件）或 `dlqueue --evict-days 7`
//!
//! ## 平台支持
//!
//! - Windows: `%APPDATA%/dlqueue/dlqueue.conf`
//! - macOS: `~/Library/Application Support/dlqueue/dlqueue.conf`
//! - Linux: `~/.config/dlqueue/dlqueue.conf`

use clap::Parser;
use regex::Regex;
use std::env;
use std::fs;
use std::path::Path;

use crate::config::Config;
use crate::core::error::DownloadError;
use crate::core::task::{HeaderSet, Priority};

/// 获取平台默认配置文件路径
pub fn default_config_path() -> String {
    #[cfg(target_os = "windows")]
    {
        let appdata = env::var("APPDATA").unwrap_or_else(|_| ".".to_string());
        format!("{}/dlqueue/dlqueue.conf", appdata)
    }
    #[cfg(target_os = "macos")]
    {
        let home = env::var("HOME").unwrap_or_else(|_| ".".to_string());
        format!("{}/Library/Application Support/dlqueue/dlqueue.conf", home)
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        let home = env::var("HOME").unwrap_or_else(|_| ".".to_string());
        format!("{}/.config/dlqueue/dlqueue.conf", home)
    }
}

/// 打开配置文件编辑器
pub fn open_config_in_editor(config_path: &str) {
    #[cfg(target_os = "windows")]
    {
        std::process::Command::new("notepad").arg(config_path).status().ok();
    }
    #[cfg(target_os = "macos")]
    {
        std::process::Command::new("open").arg("-e").arg(config_path).status().ok();
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        // 优先 xdg-open，否则 nano
        if std::process::Command::new("xdg-open").arg(config_path).status().is_err() {
            let _ = std::process::Command::new("nano").arg(config_path).status();
        }
    }
}

fn long_version() -> &'static str {
    match option_env!("VERGEN_GIT_SHA") {
        Some(sha) => Box::leak(format!("{} ({})", env!("CARGO_PKG_VERSION"), sha).into_boxed_str()),
        None => env!("CARGO_PKG_VERSION"),
    }
}

/// dlqueue 命令行参数
///
/// 示例用法：
///   dlqueue https://example.com/file.zip
///   dlqueue -e  # 编辑配置文件
///   dlqueue -p high -H "Referer: https://example.com" https://example.com/file.zip
///
/// 更多用法请加 --help 查看
#[derive(Parser, Debug, Clone)]
#[command(
    name = "dlqueue",
    version = env!("CARGO_PKG_VERSION"),
    long_version = long_version(),
    about = "带优先级队列和断点续传的下载器",
    long_about = "按优先级排队下载，支持暂停、恢复、取消和断点续传。\n\n运行时按 p 暂停/恢复全部任务，按 c 取消全部任务，按 q 退出。\n\n示例：\n  dlqueue https://example.com/file.zip\n  dlqueue -e\n  dlqueue -c /path/to/config.conf -d ./downloads https://example.com/file.zip\n"
)]
pub struct Args {
    /// 要下载的URL列表（可同时指定多个）
    #[arg(required = false, help = "要下载的URL列表，可以同时指定多个URL。")]
    pub urls: Vec<String>,

    /// 包含URL列表的文件路径
    #[arg(short, long, help = "包含URL列表的文件路径，每行一个URL。")]
    pub file: Option<String>,

    /// 配置文件路径，默认为平台推荐路径
    #[arg(short = 'c', long, default_value_t = default_config_path(), help = "配置文件路径，默认为平台推荐路径。")]
    pub config: String,

    /// 编辑配置文件（-e 或 --edit）
    #[arg(short = 'e', long = "edit", help = "用系统默认编辑器打开配置文件并退出。")]
    pub edit_config: bool,

    /// 指定下载目录
    #[arg(long, short = 'd', help = "指定下载目录，覆盖配置文件中的设置。")]
    pub download_dir: Option<String>,

    /// 指定下载文件名
    #[arg(long, short = 'n', help = "指定下载文件名，覆盖URL自动推断。只在下载单个URL时生效。")]
    pub file_name: Option<String>,

    /// 任务优先级
    #[arg(long, short = 'p', default_value = "medium", value_parser = parse_priority, help = "任务优先级：low、medium、high 或 immediate。")]
    pub priority: Priority,

    /// 附加请求头，可重复
    #[arg(long = "header", short = 'H', help = "附加请求头，格式为 \"Name: value\"，可重复指定。")]
    pub headers: Vec<String>,

    /// 同时下载的任务数
    #[arg(long, help = "同时下载的任务数，覆盖配置文件中的设置。")]
    pub concurrency: Option<usize>,

    /// 不保存断点记录
    #[arg(long, help = "不保存断点记录，中断后只能从头下载。")]
    pub no_persist: bool,

    /// 清理过期的未完成下载，天数取自配置文件的 stale_after_days
    #[arg(long, help = "启动时清理超过 stale_after_days 天未更新的未完成下载。")]
    pub evict: bool,

    /// 清理过期的未完成下载并指定天数
    #[arg(long, value_name = "DAYS", help = "启动时清理超过指定天数未更新的未完成下载，覆盖 stale_after_days。")]
    pub evict_days: Option<u32>,
}

fn parse_priority(value: &str) -> Result<Priority, String> {
    value.parse::<Priority>().map_err(|e| e.to_string())
}

impl Args {
    /// 是否需要在启动时清理过期下载
    pub fn wants_eviction(&self) -> bool {
        self.evict || self.evict_days.is_some()
    }

    /// 解析命令行参数并加载配置
    pub fn parse_args() -> Result<(Self, Config), DownloadError> {
        let args = Args::parse();

        if args.edit_config {
            if !Path::new(&args.config).exists() {
                Self::ensure_config_dir(&args.config)?;
                Config::default().save_with_tutorial(&args.config)?;
            }
            open_config_in_editor(&args.config);
            std::process::exit(0);
        }

        Self::ensure_config_dir(&args.config)?;
        let mut config = Config::load(&args.config)?;

        // 合并命令行参数到配置
        config.merge_from_args(&args);
        config.validate()?;

        Ok((args, config))
    }

    fn ensure_config_dir(config_path: &str) -> Result<(), DownloadError> {
        if let Some(parent) = Path::new(config_path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .map_err(|e| DownloadError::Config(format!("无法创建配置目录: {}", e)))?;
            }
        }
        Ok(())
    }

    /// 命令行和URL文件中的全部URL
    pub fn get_urls(&self) -> Result<Vec<String>, DownloadError> {
        let mut urls = Vec::new();
        urls.extend_from_slice(&self.urls);

        if let Some(file_path) = &self.file {
            let content = fs::read_to_string(file_path)
                .map_err(|e| DownloadError::Config(format!("无法读取URL文件 {}: {}", file_path, e)))?;

            // 按行读取URL，忽略空行和注释
            for line in content.lines() {
                let line = line.trim();
                if !line.is_empty() && !line.starts_with('#') {
                    urls.push(line.to_string());
                }
            }
        }

        for url in &urls {
            if !crate::utils::validator::is_valid_url(url) {
                return Err(DownloadError::InvalidUrl(url.clone()));
            }
        }
        Ok(urls)
    }

    /// 解析 `-H` 指定的请求头，同名的头按顺序保留
    pub fn get_headers(&self) -> Result<HeaderSet, DownloadError> {
        let pattern = Regex::new(r"^\s*([^:\s][^:]*?)\s*:\s*(.*?)\s*$")
            .map_err(|e| DownloadError::Unknown(e.to_string()))?;
        let mut headers = HeaderSet::new();
        for raw in &self.headers {
            let captures = pattern
                .captures(raw)
                .ok_or_else(|| DownloadError::Config(format!("请求头格式错误，应为 \"Name: value\": {}", raw)))?;
            headers
                .entry(captures[1].to_string())
                .or_default()
                .push(captures[2].to_string());
        }
        Ok(headers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_parsing() {
        let args = Args::try_parse_from(["dlqueue", "https://example.com/file.zip"]).unwrap();
        assert_eq!(args.urls, vec!["https://example.com/file.zip"]);
        assert_eq!(args.priority, Priority::Medium);
        assert!(args.download_dir.is_none());
        assert!(!args.no_persist);
    }

    #[test]
    fn test_priority_and_overrides() {
        let args = Args::try_parse_from([
            "dlqueue", "-p", "high", "--concurrency", "5", "--no-persist", "--evict-days", "3",
            "-d", "/tmp/x", "https://example.com/a",
        ])
        .unwrap();
        assert_eq!(args.priority, Priority::High);
        assert_eq!(args.concurrency, Some(5));
        assert!(args.no_persist);
        assert_eq!(args.evict_days, Some(3));
        assert!(args.wants_eviction());

        let mut config = Config::default();
        config.merge_from_args(&args);
        assert_eq!(config.max_concurrent_downloads, 5);
        assert_eq!(config.stale_after_days, 3);
        assert!(!config.persistence_enabled);
        assert_eq!(config.download_dir, "/tmp/x");
    }

    #[test]
    fn test_invalid_priority() {
        assert!(Args::try_parse_from(["dlqueue", "-p", "urgent", "https://example.com/a"]).is_err());
    }

    #[test]
    fn test_headers() {
        let args = Args::try_parse_from([
            "dlqueue",
            "-H", "Accept: text/plain",
            "-H", "X-Trace:  a:b ",
            "-H", "Accept: */*",
            "https://example.com/a",
        ])
        .unwrap();
        let headers = args.get_headers().unwrap();
        assert_eq!(headers["Accept"], vec!["text/plain", "*/*"]);
        assert_eq!(headers["X-Trace"], vec!["a:b"]);

        let bad = Args::try_parse_from(["dlqueue", "-H", "no-colon", "https://example.com/a"]).unwrap();
        assert!(bad.get_headers().is_err());
    }

    #[test]
    fn test_url_file_parsing() {
        let dir = tempfile::tempdir().unwrap();
        let url_file = dir.path().join("urls.txt");
        let content = "# 这是一个注释\nhttps://example.com/file1.zip\n\nhttps://example.com/file2.zip\n";
        fs::write(&url_file, content).unwrap();

        let args = Args::try_parse_from(["dlqueue", "-f", url_file.to_str().unwrap()]).unwrap();
        let urls = args.get_urls().unwrap();
        assert_eq!(urls, vec!["https://example.com/file1.zip", "https://example.com/file2.zip"]);
    }

    #[test]
    fn test_invalid_url_rejected() {
        let args = Args::try_parse_from(["dlqueue", "ftp://example.com/a"]).unwrap();
        assert!(matches!(args.get_urls(), Err(DownloadError::InvalidUrl(_))));
    }
}
