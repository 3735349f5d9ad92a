//! Net: 单次 HTTP 交换
//!
//! `ConnectionClient` 每次 `connect` 建立一个连接，调用方通过 `Connection`
//! 读取状态码、响应头和数据。客户端本身不跟随重定向也不重试，
//! 重定向由 `redirect::connect_following_redirects` 负责。

pub mod redirect;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, RANGE, USER_AGENT};
use std::time::Duration;

use crate::core::error::{DownloadError, DownloadResult};
use crate::core::task::request::HeaderSet;

pub use redirect::{connect_following_redirects, is_redirect, MAX_REDIRECTS};

/// 一次连接需要的参数，超时和 User-Agent 已经按请求和全局配置合并好
#[derive(Debug, Clone)]
pub struct ConnectRequest<'a> {
    pub url: &'a str,
    pub headers: &'a HeaderSet,
    pub user_agent: &'a str,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
}

/// 一个已收到响应头的连接
#[async_trait]
pub trait Connection: Send {
    fn response_code(&self) -> u16;

    fn response_header(&self, name: &str) -> Option<String>;

    fn content_length(&self) -> Option<u64>;

    /// 读取下一块数据，流结束时返回 None
    async fn read_chunk(&mut self) -> DownloadResult<Option<Bytes>>;

    fn close(self: Box<Self>) {}
}

#[async_trait]
pub trait ConnectionClient: Send + Sync {
    /// `range_start` 不为 None 时发送 `Range: bytes=<start>-`
    async fn connect(&self, request: &ConnectRequest<'_>, range_start: Option<u64>) -> DownloadResult<Box<dyn Connection>>;
}

/// 基于 reqwest 的默认实现
#[derive(Clone)]
pub struct HttpConnectionClient {
    client: reqwest::Client,
}

impl HttpConnectionClient {
    pub fn new() -> DownloadResult<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| DownloadError::Config(format!("无法创建 HTTP 客户端: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ConnectionClient for HttpConnectionClient {
    async fn connect(&self, request: &ConnectRequest<'_>, range_start: Option<u64>) -> DownloadResult<Box<dyn Connection>> {
        let mut builder = self
            .client
            .get(request.url)
            .header(USER_AGENT, request.user_agent);
        for (name, values) in request.headers {
            for value in values {
                builder = builder.header(name.as_str(), value.as_str());
            }
        }
        if let Some(start) = range_start {
            builder = builder.header(RANGE, format!("bytes={}-", start));
        }

        let response = tokio::time::timeout(request.connect_timeout, builder.send())
            .await
            .map_err(|_| {
                DownloadError::network(
                    request.url,
                    format!("连接超时 ({} 毫秒)", request.connect_timeout.as_millis()),
                )
            })?
            .map_err(|e| DownloadError::network(request.url, e))?;

        log::debug!("{} -> {}", request.url, response.status());
        Ok(Box::new(HttpConnection {
            url: request.url.to_string(),
            code: response.status().as_u16(),
            headers: response.headers().clone(),
            content_length: response.content_length(),
            response,
        }))
    }
}

struct HttpConnection {
    url: String,
    code: u16,
    headers: HeaderMap,
    content_length: Option<u64>,
    response: reqwest::Response,
}

#[async_trait]
impl Connection for HttpConnection {
    fn response_code(&self) -> u16 {
        self.code
    }

    fn response_header(&self, name: &str) -> Option<String> {
        self.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string())
    }

    fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    async fn read_chunk(&mut self) -> DownloadResult<Option<Bytes>> {
        self.response
            .chunk()
            .await
            .map_err(|e| DownloadError::network(&self.url, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn connect_request<'a>(url: &'a str, headers: &'a HeaderSet) -> ConnectRequest<'a> {
        ConnectRequest {
            url,
            headers,
            user_agent: "dlqueue-test",
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn test_sends_headers_and_range() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/file"))
            .and(header("user-agent", "dlqueue-test"))
            .and(header("x-token", "abc"))
            .and(header("range", "bytes=5-"))
            .respond_with(ResponseTemplate::new(206).set_body_bytes(b"56789".to_vec()))
            .expect(1)
            .mount(&server)
            .await;

        let mut headers = HeaderSet::new();
        headers.insert("X-Token".to_string(), vec!["abc".to_string()]);
        let url = format!("{}/file", server.uri());
        let client = HttpConnectionClient::new().unwrap();
        let mut conn = client.connect(&connect_request(&url, &headers), Some(5)).await.unwrap();

        assert_eq!(conn.response_code(), 206);
        assert_eq!(conn.content_length(), Some(5));
        let mut body = Vec::new();
        while let Some(chunk) = conn.read_chunk().await.unwrap() {
            body.extend_from_slice(&chunk);
        }
        assert_eq!(body, b"56789");
    }

    #[tokio::test]
    async fn test_does_not_follow_redirects() {
        let server = MockServer::start().await;
        Mock::given(path("/old"))
            .respond_with(ResponseTemplate::new(302).insert_header("Location", "/new"))
            .mount(&server)
            .await;

        let headers = HeaderSet::new();
        let url = format!("{}/old", server.uri());
        let client = HttpConnectionClient::new().unwrap();
        let conn = client.connect(&connect_request(&url, &headers), None).await.unwrap();
        assert_eq!(conn.response_code(), 302);
        assert_eq!(conn.response_header("location"), Some("/new".to_string()));
    }

    #[tokio::test]
    async fn test_connection_refused_is_network_error() {
        let headers = HeaderSet::new();
        let client = HttpConnectionClient::new().unwrap();
        let result = client
            .connect(&connect_request("http://127.0.0.1:9/never", &headers), None)
            .await;
        assert!(matches!(result, Err(DownloadError::Network { .. })));
    }
}
