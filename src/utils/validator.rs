use anyhow::Result;
use url::Url;

use crate::core::error::{DownloadError, DownloadResult};

pub fn is_valid_url(url: &str) -> bool {
    validate_download_url(url).is_ok()
}

/// 只接受带主机名的 http/https 地址
pub fn validate_download_url(url: &str) -> DownloadResult<Url> {
    let parsed = Url::parse(url).map_err(|e| DownloadError::InvalidUrl(format!("{} ({})", url, e)))?;
    match parsed.scheme() {
        "http" | "https" if parsed.host_str().is_some() => Ok(parsed),
        _ => Err(DownloadError::InvalidUrl(url.to_string())),
    }
}

pub fn validate_output_path(path: &str) -> Result<()> {
    if path.trim().is_empty() {
        anyhow::bail!("输出路径不能为空");
    }
    Ok(())
}

pub fn validate_urls(urls: &[String]) -> Result<()> {
    if urls.is_empty() {
        anyhow::bail!("URL列表不能为空");
    }
    if let Some(bad) = urls.iter().find(|u| !is_valid_url(u)) {
        anyhow::bail!("无效的URL: {}", bad);
    }
    Ok(())
}

/// 从 URL 路径推断文件名，推断不出时返回 None
pub fn file_name_from_url(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    parsed
        .path_segments()?
        .filter(|segment| !segment.is_empty())
        .last()
        .map(|segment| segment.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_validation() {
        assert!(is_valid_url("https://example.com"));
        assert!(is_valid_url("http://example.com/file.zip"));
        assert!(!is_valid_url("ftp://example.com/file.zip"));
        assert!(!is_valid_url("invalid-url"));
        assert!(!is_valid_url("http://"));
    }

    #[test]
    fn test_output_path_validation() {
        assert!(validate_output_path("./").is_ok());
        assert!(validate_output_path("  ").is_err());
    }

    #[test]
    fn test_urls_validation() {
        let valid_urls = vec![
            "https://example.com".to_string(),
            "http://example.com".to_string(),
        ];
        assert!(validate_urls(&valid_urls).is_ok());

        let invalid_urls = vec![
            "invalid-url".to_string(),
            "https://example.com".to_string(),
        ];
        assert!(validate_urls(&invalid_urls).is_err());
        assert!(validate_urls(&[]).is_err());
    }

    #[test]
    fn test_file_name_from_url() {
        assert_eq!(file_name_from_url("http://host/dir/a.bin?x=1"), Some("a.bin".to_string()));
        assert_eq!(file_name_from_url("http://host/dir/"), Some("dir".to_string()));
        assert_eq!(file_name_from_url("http://host"), None);
    }
}
