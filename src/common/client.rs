use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{
    Client, ClientBuilder, Response, StatusCode,
    header::{ACCEPT, HeaderMap, HeaderName, HeaderValue, RANGE, REFERER, USER_AGENT},
};
use tracing::{debug, warn};

use crate::downloader::error::FetchError;
use crate::parser::models::ByteSpan;

/// 下载核心依赖的 HTTP 能力。测试中可以替换为内存实现
#[async_trait]
pub trait HttpSource: Send + Sync {
    /// 获取完整响应体；`range` 存在时只取对应区间
    async fn get_bytes(&self, url: &str, range: Option<ByteSpan>) -> Result<Bytes, FetchError>;
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub user_agent: String,
    pub referer: Option<String>,
    pub connect_timeout: Duration,
    /// 附加请求头
    pub headers: Vec<(String, String)>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/135.0.0.0 Safari/537.36".to_string(),
            referer: None,
            connect_timeout: Duration::from_secs(10),
            headers: Vec::new(),
        }
    }
}

// 基于 reqwest 的 HTTP 客户端
#[derive(Debug, Clone)]
pub struct HttpClient {
    inner: Client,
}

impl HttpClient {
    pub fn new(config: &HttpClientConfig) -> Result<Self, FetchError> {
        let inner = ClientBuilder::new()
            .connect_timeout(config.connect_timeout)
            .default_headers(Self::get_default_headers(config)?)
            .build()
            .map_err(|e| FetchError::Transport(format!("创建 HTTP 客户端失败: {}", e)))?;
        Ok(Self { inner })
    }

    pub fn get_default_headers(config: &HttpClientConfig) -> Result<HeaderMap, FetchError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
        headers.insert(USER_AGENT, header_value(&config.user_agent)?);
        if let Some(referer) = &config.referer {
            headers.insert(REFERER, header_value(referer)?);
        }
        for (name, value) in &config.headers {
            let name = HeaderName::from_bytes(name.trim().as_bytes())
                .map_err(|e| FetchError::Transport(format!("无效的请求头名称 {}: {}", name, e)))?;
            headers.insert(name, header_value(value.trim())?);
        }
        Ok(headers)
    }

    pub async fn get_raw_response(
        &self,
        url: &str,
        range: Option<ByteSpan>,
    ) -> Result<Response, FetchError> {
        let mut request = self.inner.get(url);
        if let Some(range) = range {
            request = request.header(RANGE, range.header_value());
        }
        let response = request.send().await?;
        Self::check_response_status(&response, url)?;
        Ok(response)
    }

    // 检查响应状态
    fn check_response_status(response: &Response, url: &str) -> Result<(), FetchError> {
        let status = response.status();
        debug!("Response Status: {} <- {}", status, url);

        if status.is_success() {
            return Ok(());
        }
        match status {
            StatusCode::FORBIDDEN | StatusCode::TOO_MANY_REQUESTS => {
                warn!("⚠️ 服务器拒绝访问 ({})，可能触发了风控机制: {}", status, url);
            }
            _ => warn!("❌ 非成功状态码: {}", status),
        }
        Err(FetchError::Status {
            status: status.as_u16(),
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl HttpSource for HttpClient {
    async fn get_bytes(&self, url: &str, range: Option<ByteSpan>) -> Result<Bytes, FetchError> {
        let response = self.get_raw_response(url, range).await?;
        let honoured_range = response.status() == StatusCode::PARTIAL_CONTENT;
        let body = response.bytes().await?;

        match range {
            // 服务器忽略了 Range 头，自行截取
            Some(range) if !honoured_range => slice_range(body, range, url),
            _ => Ok(body),
        }
    }
}

fn slice_range(body: Bytes, range: ByteSpan, url: &str) -> Result<Bytes, FetchError> {
    let start = range.offset as usize;
    let end = start + range.length as usize;
    if end > body.len() {
        return Err(FetchError::Transport(format!(
            "响应长度 {} 不足以截取区间 {}，URL: {}",
            body.len(),
            range.header_value(),
            url
        )));
    }
    debug!("服务器未返回 206，本地截取区间 {}", range.header_value());
    Ok(body.slice(start..end))
}

fn header_value(value: &str) -> Result<HeaderValue, FetchError> {
    HeaderValue::from_str(value)
        .map_err(|e| FetchError::Transport(format!("无效的请求头取值 {}: {}", value, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_headers_include_extras() {
        let config = HttpClientConfig {
            referer: Some("https://example.com/".to_string()),
            headers: vec![("X-Token".to_string(), " abc ".to_string())],
            ..Default::default()
        };
        let headers = HttpClient::get_default_headers(&config).unwrap();
        assert_eq!(headers.get(REFERER).unwrap(), "https://example.com/");
        assert_eq!(headers.get("x-token").unwrap(), "abc");
    }

    #[test]
    fn test_invalid_header_name_is_rejected() {
        let config = HttpClientConfig {
            headers: vec![("bad header".to_string(), "v".to_string())],
            ..Default::default()
        };
        assert!(HttpClient::get_default_headers(&config).is_err());
    }

    #[test]
    fn test_slice_range_when_server_ignores_range() {
        let body = Bytes::from_static(b"0123456789");
        let sliced = slice_range(body.clone(), ByteSpan { offset: 2, length: 3 }, "u").unwrap();
        assert_eq!(&sliced[..], b"234");
        assert!(slice_range(body, ByteSpan { offset: 8, length: 5 }, "u").is_err());
    }
}
