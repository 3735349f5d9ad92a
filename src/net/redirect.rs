use url::Url;

use crate::core::error::{DownloadError, DownloadResult};
use super::{Connection, ConnectionClient, ConnectRequest};

/// 单次连接最多跟随的重定向次数
pub const MAX_REDIRECTS: usize = 10;

pub fn is_redirect(code: u16) -> bool {
    matches!(code, 300 | 301 | 302 | 303 | 307 | 308)
}

/// 相对地址按当前 URL 解析
fn resolve_location(current: &str, location: &str) -> DownloadResult<String> {
    let base = Url::parse(current).map_err(|e| DownloadError::InvalidUrl(format!("{} ({})", current, e)))?;
    base.join(location)
        .map(|u| u.to_string())
        .map_err(|e| DownloadError::InvalidUrl(format!("{} ({})", location, e)))
}

/// 建立连接并跟随重定向，返回最终连接和最终 URL
pub async fn connect_following_redirects(
    client: &dyn ConnectionClient,
    request: &ConnectRequest<'_>,
    range_start: Option<u64>,
) -> DownloadResult<(Box<dyn Connection>, String)> {
    let mut url = request.url.to_string();
    let mut hops = 0usize;
    loop {
        let attempt = ConnectRequest {
            url: &url,
            ..request.clone()
        };
        let connection = client.connect(&attempt, range_start).await?;
        let code = connection.response_code();
        if !is_redirect(code) {
            return Ok((connection, url));
        }

        let location = connection.response_header("location");
        connection.close();
        let Some(location) = location else {
            log::error!("{} 返回 {} 但没有 Location 头", url, code);
            return Err(DownloadError::RedirectLocationMissing { url });
        };
        if hops >= MAX_REDIRECTS {
            log::error!("重定向次数超过 {}: {}", MAX_REDIRECTS, url);
            return Err(DownloadError::RedirectLimitExceeded {
                url,
                limit: MAX_REDIRECTS,
            });
        }
        hops += 1;
        let next = resolve_location(&url, &location)?;
        log::info!("重定向 ({}/{}): {} -> {}", hops, MAX_REDIRECTS, url, next);
        url = next;
    }
}
