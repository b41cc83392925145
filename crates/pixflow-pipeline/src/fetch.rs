//! HTTP transport for the Downloader

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use std::time::Duration;
use thiserror::Error;

pub type ByteStream = BoxStream<'static, Result<Bytes, FetchError>>;

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(String),

    #[error("response body interrupted: {0}")]
    Body(String),

    #[error("HTTP client setup failed: {0}")]
    Client(String),
}

/// Response head plus a streaming body
pub struct FetchResponse {
    pub status: u16,
    pub content_length: Option<u64>,
    pub body: ByteStream,
}

impl std::fmt::Debug for FetchResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchResponse")
            .field("status", &self.status)
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait HttpFetcher: Send + Sync {
    /// Issue a GET; any status is returned, only transport failures are errors
    async fn get(&self, url: &str) -> Result<FetchResponse, FetchError>;
}

#[derive(Clone)]
pub struct ReqwestFetcher {
    client: reqwest::Client,
}

impl ReqwestFetcher {
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("pixflow/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FetchError::Client(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpFetcher for ReqwestFetcher {
    async fn get(&self, url: &str) -> Result<FetchResponse, FetchError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::Request(e.to_string()))?;

        Ok(FetchResponse {
            status: response.status().as_u16(),
            content_length: response.content_length(),
            body: response
                .bytes_stream()
                .map(|chunk| chunk.map_err(|e| FetchError::Body(e.to_string())))
                .boxed(),
        })
    }
}
