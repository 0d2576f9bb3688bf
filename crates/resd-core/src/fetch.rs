//! Downloading captured resources from their source.
//!
//! The registry fetches through [`ResourceFetcher`] so downloads can be
//! served from somewhere other than the network in tests.

use std::collections::BTreeMap;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::ResdConfig;

/// Download errors.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The request failed: connect, TLS, timeout or a broken body.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The source answered with a non-success status.
    #[error("unexpected HTTP status {0}")]
    Status(u16),

    /// The configured upstream proxy is not a valid proxy URL.
    #[error("invalid upstream proxy: {0}")]
    InvalidProxy(String),
}

/// What to fetch and which captured headers to replay.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchRequest {
    pub url: String,
    pub headers: BTreeMap<String, String>,
    /// Overrides any captured `user-agent` header.
    pub user_agent: Option<String>,
}

impl FetchRequest {
    /// Creates a request for `url`.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }
}

/// A response body read chunk by chunk.
#[async_trait]
pub trait FetchBody: Send {
    /// Declared length, if any.
    fn content_length(&self) -> Option<u64>;

    /// Next chunk, or `None` at end of body.
    async fn chunk(&mut self) -> Result<Option<Vec<u8>>, FetchError>;
}

/// Opens resource bodies.
#[async_trait]
pub trait ResourceFetcher: Send + Sync {
    async fn fetch(&self, request: &FetchRequest) -> Result<Box<dyn FetchBody>, FetchError>;
}

/// Fetcher backed by a shared reqwest client.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    /// Builds the client from configuration: connect and read deadlines and
    /// an optional upstream proxy.
    pub fn from_config(config: &ResdConfig) -> Result<Self, FetchError> {
        let mut builder = reqwest::Client::builder()
            .user_agent(format!("resd/{}", env!("CARGO_PKG_VERSION")))
            .connect_timeout(config.timeouts.connect())
            .read_timeout(config.timeouts.download_read());

        let upstream = config.upstream_proxy.trim();
        builder = if upstream.is_empty() {
            // The system proxy may well be us.
            builder.no_proxy()
        } else {
            let proxy = reqwest::Proxy::all(upstream)
                .map_err(|e| FetchError::InvalidProxy(e.to_string()))?;
            builder.proxy(proxy)
        };

        Ok(Self {
            client: builder.build()?,
        })
    }
}

struct HttpBody {
    response: reqwest::Response,
}

#[async_trait]
impl FetchBody for HttpBody {
    fn content_length(&self) -> Option<u64> {
        self.response.content_length()
    }

    async fn chunk(&mut self) -> Result<Option<Vec<u8>>, FetchError> {
        Ok(self.response.chunk().await?.map(|bytes| bytes.to_vec()))
    }
}

#[async_trait]
impl ResourceFetcher for HttpFetcher {
    async fn fetch(&self, request: &FetchRequest) -> Result<Box<dyn FetchBody>, FetchError> {
        let mut builder = self.client.get(&request.url);
        for (name, value) in &request.headers {
            if name.eq_ignore_ascii_case("user-agent") && request.user_agent.is_some() {
                continue;
            }
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(agent) = &request.user_agent {
            builder = builder.header(reqwest::header::USER_AGENT, agent.as_str());
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }
        tracing::debug!("Fetching {} ({:?} bytes)", request.url, response.content_length());
        Ok(Box::new(HttpBody { response }))
    }
}
