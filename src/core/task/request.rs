use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::core::error::{DownloadError, DownloadResult};
use crate::utils::validator;
use super::state::Priority;

/// 额外请求头：名称 -> 按顺序发送的多个值
pub type HeaderSet = BTreeMap<String, Vec<String>>;

/// 下载任务标识
///
/// 由 URL、目标目录和文件名确定性地计算出来：描述同一个传输的两个请求
/// 会得到同一个标识，它既是去重的依据，也是断点记录的主键。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DownloadId(u64);

impl DownloadId {
    pub fn derive(url: &str, parent: &Path, file_name: &str) -> Self {
        let raw = format!("{}/{}/{}", url, parent.display(), file_name);
        let digest = Sha256::digest(raw.as_bytes());
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest[..8]);
        DownloadId(u64::from_be_bytes(head))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl From<u64> for DownloadId {
    fn from(value: u64) -> Self {
        DownloadId(value)
    }
}

impl fmt::Display for DownloadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for DownloadId {
    type Err = DownloadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)
            .map_err(|e| DownloadError::Unknown(format!("无效的任务标识 {}: {}", s, e)))?;
        let head: [u8; 8] = bytes
            .try_into()
            .map_err(|_| DownloadError::Unknown(format!("任务标识长度错误: {}", s)))?;
        Ok(DownloadId(u64::from_be_bytes(head)))
    }
}

/// 下载目标：父目录、文件名和可选的内容类型
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    parent: PathBuf,
    file_name: String,
    content_type: Option<String>,
}

impl Destination {
    pub fn new(parent: impl AsRef<Path>, file_name: impl Into<String>) -> Self {
        Self {
            parent: normalize_parent(parent.as_ref()),
            file_name: file_name.into(),
            content_type: None,
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn parent(&self) -> &Path {
        &self.parent
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    /// 最终文件的完整路径
    pub fn path(&self) -> PathBuf {
        self.parent.join(&self.file_name)
    }

    /// 与另一个目标指向同一个文件（不比较内容类型）
    pub fn same_location(&self, other: &Destination) -> bool {
        self.parent == other.parent && self.file_name == other.file_name
    }
}

/// 去掉末尾的路径分隔符，根目录保持不变
fn normalize_parent(parent: &Path) -> PathBuf {
    let raw = parent.to_string_lossy();
    let trimmed = raw.trim_end_matches(['/', '\\']);
    if trimmed.is_empty() && !raw.is_empty() {
        PathBuf::from(&raw[..1])
    } else {
        PathBuf::from(trimmed)
    }
}

/// 一个下载请求
///
/// 请求本身是不可变的描述信息，下载过程中变化的字节数和状态由队列里的
/// `TransferHandle` 维护。
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    id: DownloadId,
    url: String,
    redirected_url: Option<String>,
    destination: Destination,
    headers: HeaderSet,
    priority: Priority,
    tag: Option<String>,
    connect_timeout: Option<Duration>,
    read_timeout: Option<Duration>,
    user_agent: Option<String>,
}

impl DownloadRequest {
    pub fn builder(
        url: impl Into<String>,
        parent: impl AsRef<Path>,
        file_name: impl Into<String>,
    ) -> DownloadRequestBuilder {
        DownloadRequestBuilder::new(url, parent, file_name)
    }

    pub fn id(&self) -> DownloadId {
        self.id
    }

    /// 提交时的 URL，参与标识计算
    pub fn url(&self) -> &str {
        &self.url
    }

    /// 实际请求的 URL：跟随过重定向后为最后一跳的地址
    pub fn current_url(&self) -> &str {
        self.redirected_url.as_deref().unwrap_or(&self.url)
    }

    pub(crate) fn set_current_url(&mut self, url: String) {
        if url == self.url {
            self.redirected_url = None;
        } else {
            self.redirected_url = Some(url);
        }
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    pub fn headers(&self) -> &HeaderSet {
        &self.headers
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.user_agent.as_deref()
    }

    /// 两个请求描述的是同一个传输（标识相同时用于检测哈希冲突）
    pub fn same_transfer(&self, other: &DownloadRequest) -> bool {
        self.url == other.url && self.destination.same_location(&other.destination)
    }
}

/// 下载请求构建器
#[derive(Debug, Clone)]
pub struct DownloadRequestBuilder {
    url: String,
    destination: Destination,
    headers: HeaderSet,
    priority: Priority,
    tag: Option<String>,
    connect_timeout: Option<Duration>,
    read_timeout: Option<Duration>,
    user_agent: Option<String>,
}

impl DownloadRequestBuilder {
    pub fn new(url: impl Into<String>, parent: impl AsRef<Path>, file_name: impl Into<String>) -> Self {
        Self {
            url: url.into().trim().to_string(),
            destination: Destination::new(parent, file_name),
            headers: HeaderSet::new(),
            priority: Priority::default(),
            tag: None,
            connect_timeout: None,
            read_timeout: None,
            user_agent: None,
        }
    }

    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.destination = self.destination.with_content_type(content_type);
        self
    }

    /// 追加一个请求头，同名的多个值按添加顺序发送
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.entry(name.into()).or_default().push(value.into());
        self
    }

    pub fn headers(mut self, headers: HeaderSet) -> Self {
        for (name, values) in headers {
            self.headers.entry(name).or_default().extend(values);
        }
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    /// 0 表示使用全局配置
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    /// 0 表示使用全局配置
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn build(self) -> DownloadResult<DownloadRequest> {
        validator::validate_download_url(&self.url)?;
        if self.destination.file_name().trim().is_empty() {
            return Err(DownloadError::Config("文件名不能为空".to_string()));
        }
        let id = DownloadId::derive(&self.url, self.destination.parent(), self.destination.file_name());
        Ok(DownloadRequest {
            id,
            url: self.url,
            redirected_url: None,
            destination: self.destination,
            headers: self.headers,
            priority: self.priority,
            tag: self.tag,
            connect_timeout: self.connect_timeout,
            read_timeout: self.read_timeout,
            user_agent: self.user_agent,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_is_deterministic() {
        let a = DownloadId::derive("http://host/a.bin", Path::new("/downloads"), "a.bin");
        let b = DownloadId::derive("http://host/a.bin", Path::new("/downloads"), "a.bin");
        assert_eq!(a, b);

        let other_name = DownloadId::derive("http://host/a.bin", Path::new("/downloads"), "b.bin");
        let other_dir = DownloadId::derive("http://host/a.bin", Path::new("/tmp"), "a.bin");
        assert_ne!(a, other_name);
        assert_ne!(a, other_dir);
    }

    #[test]
    fn test_trailing_separator_does_not_change_identity() {
        let a = DownloadRequest::builder("http://host/a.bin", "/downloads/", "a.bin").build().unwrap();
        let b = DownloadRequest::builder("http://host/a.bin", "/downloads", "a.bin").build().unwrap();
        assert_eq!(a.id(), b.id());
        assert_eq!(a.destination().parent(), Path::new("/downloads"));
        assert_eq!(Destination::new("/", "x").parent(), Path::new("/"));
    }

    #[test]
    fn test_id_display_round_trip() {
        let id = DownloadId::derive("http://host/a.bin", Path::new("/downloads"), "a.bin");
        let text = id.to_string();
        assert_eq!(text.len(), 16);
        assert_eq!(text.parse::<DownloadId>().unwrap(), id);
        assert!("xyz".parse::<DownloadId>().is_err());
    }

    #[test]
    fn test_builder_options() {
        let request = DownloadRequest::builder("https://host/file.zip", "/data", "file.zip")
            .content_type("application/zip")
            .header("Accept", "*/*")
            .header("X-Token", "a")
            .header("X-Token", "b")
            .priority(Priority::High)
            .tag("batch-1")
            .connect_timeout(Duration::from_secs(5))
            .read_timeout(Duration::ZERO)
            .user_agent("custom/1.0")
            .build()
            .unwrap();

        assert_eq!(request.priority(), Priority::High);
        assert_eq!(request.tag(), Some("batch-1"));
        assert_eq!(request.headers()["X-Token"], vec!["a".to_string(), "b".to_string()]);
        assert_eq!(request.connect_timeout(), Some(Duration::from_secs(5)));
        assert_eq!(request.read_timeout(), None);
        assert_eq!(request.destination().content_type(), Some("application/zip"));
        assert_eq!(request.user_agent(), Some("custom/1.0"));
    }

    #[test]
    fn test_builder_rejects_bad_input() {
        assert!(matches!(
            DownloadRequest::builder("ftp://host/a", "/d", "a").build(),
            Err(DownloadError::InvalidUrl(_))
        ));
        assert!(DownloadRequest::builder("http://host/a", "/d", " ").build().is_err());
    }

    #[test]
    fn test_redirected_url_keeps_identity() {
        let mut request = DownloadRequest::builder("http://host/a", "/d", "a").build().unwrap();
        let id = request.id();
        request.set_current_url("http://mirror/a".to_string());
        assert_eq!(request.current_url(), "http://mirror/a");
        assert_eq!(request.url(), "http://host/a");
        assert_eq!(request.id(), id);
    }
}
