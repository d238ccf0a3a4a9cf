//! HTTP client for feeds and media files

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("Connection timeout")]
    Timeout,

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Too many redirects")]
    TooManyRedirects,

    #[error("HTTP {status} from {url}")]
    Status { status: u16, url: String },

    #[error("Write failed: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout
        } else if err.is_redirect() {
            FetchError::TooManyRedirects
        } else if err.is_builder() {
            FetchError::InvalidUrl(err.to_string())
        } else {
            FetchError::RequestFailed(err.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, FetchError>;

/// Outbound HTTP used by crawl and download workers
#[async_trait]
pub trait HttpFetcher: Send + Sync {
    /// Fetch a whole (small) body such as a feed document
    async fn fetch(&self, url: &str) -> Result<Bytes>;

    /// Stream a body into `sink`, returning the bytes written
    async fn download_to(
        &self,
        url: &str,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<u64>;
}

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub connect_timeout: Duration,
    /// Whole-request bound for `fetch`, per-chunk stall bound for `download_to`
    pub request_timeout: Duration,
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(60),
            user_agent: concat!("feedpipe/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// reqwest-backed fetcher
pub struct ReqwestFetcher {
    client: Client,
    config: HttpConfig,
}

impl ReqwestFetcher {
    pub fn new(config: HttpConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .map_err(|e| FetchError::RequestFailed(e.to_string()))?;

        Ok(Self { client, config })
    }

    async fn send(&self, url: &str, timeout: Option<Duration>) -> Result<reqwest::Response> {
        let mut request = self.client.get(url);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl HttpFetcher for ReqwestFetcher {
    async fn fetch(&self, url: &str) -> Result<Bytes> {
        debug!(url, "Fetching");
        let response = self.send(url, Some(self.config.request_timeout)).await?;
        let bytes = response.bytes().await?;
        debug!(url, size = bytes.len(), "Fetch completed");
        Ok(bytes)
    }

    async fn download_to(
        &self,
        url: &str,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<u64> {
        debug!(url, "Starting download");
        let mut response = self.send(url, None).await?;
        let mut written = 0u64;

        loop {
            let chunk = tokio::time::timeout(self.config.request_timeout, response.chunk())
                .await
                .map_err(|_| FetchError::Timeout)??;
            let Some(chunk) = chunk else {
                break;
            };
            sink.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        sink.flush().await?;

        debug!(url, size = written, "Download completed");
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Router, http::StatusCode, routing::get};
    use tokio::net::TcpListener;

    async fn serve(app: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[test]
    fn test_http_config_defaults() {
        let config = HttpConfig::default();
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.request_timeout, Duration::from_secs(60));
        assert!(config.user_agent.starts_with("feedpipe/"));
    }

    #[tokio::test]
    async fn test_fetch_and_download() {
        let app = Router::new().route("/file", get(|| async { "hello world" }));
        let base = serve(app).await;
        let fetcher = ReqwestFetcher::new(HttpConfig::default()).unwrap();

        let body = fetcher.fetch(&format!("{base}/file")).await.unwrap();
        assert_eq!(&body[..], b"hello world");

        let mut sink: Vec<u8> = Vec::new();
        let written = fetcher
            .download_to(&format!("{base}/file"), &mut sink)
            .await
            .unwrap();
        assert_eq!(written, 11);
        assert_eq!(sink, b"hello world");
    }

    #[tokio::test]
    async fn test_non_success_status_is_error() {
        let app = Router::new().route("/gone", get(|| async { (StatusCode::NOT_FOUND, "nope") }));
        let base = serve(app).await;
        let fetcher = ReqwestFetcher::new(HttpConfig::default()).unwrap();

        let err = fetcher.fetch(&format!("{base}/gone")).await.unwrap_err();
        assert!(matches!(err, FetchError::Status { status: 404, .. }));
    }

    #[tokio::test]
    async fn test_invalid_url() {
        let fetcher = ReqwestFetcher::new(HttpConfig::default()).unwrap();
        let err = fetcher.fetch("not a url").await.unwrap_err();
        assert!(matches!(err, FetchError::InvalidUrl(_)));
    }
}
