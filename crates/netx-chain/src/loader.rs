//! Dynamic node sources for hops.
//!
//! A [`SourceLoader`] fetches raw documents from files or HTTP endpoints and
//! turns them into nodes through a caller-supplied decoder. The decoder owns
//! the document format and the construction of dialers and connectors, so
//! this crate stays independent of the configuration model.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use netx_core::DEFAULT_HTTP_LOADER_TIMEOUT_SECS;

use crate::error::ChainError;
use crate::node::Node;

#[async_trait]
pub trait Source: Send + Sync {
    async fn fetch(&self) -> Result<Vec<u8>, ChainError>;

    /// Human-readable origin for logs.
    fn describe(&self) -> String;
}

pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl Source for FileSource {
    async fn fetch(&self) -> Result<Vec<u8>, ChainError> {
        tokio::fs::read(&self.path)
            .await
            .map_err(|e| ChainError::Load(format!("{}: {e}", self.path.display())))
    }

    fn describe(&self) -> String {
        format!("file:{}", self.path.display())
    }
}

pub struct HttpSource {
    url: String,
    client: reqwest::Client,
}

impl HttpSource {
    pub fn new(url: impl Into<String>, timeout: Option<Duration>) -> Result<Self, ChainError> {
        let timeout =
            timeout.unwrap_or(Duration::from_secs(DEFAULT_HTTP_LOADER_TIMEOUT_SECS));
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ChainError::Load(format!("http client: {e}")))?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }
}

#[async_trait]
impl Source for HttpSource {
    async fn fetch(&self) -> Result<Vec<u8>, ChainError> {
        let resp = self
            .client
            .get(&self.url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| ChainError::Load(format!("{}: {e}", self.url)))?;
        let body = resp
            .bytes()
            .await
            .map_err(|e| ChainError::Load(format!("{}: {e}", self.url)))?;
        Ok(body.to_vec())
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}

#[async_trait]
pub trait NodeLoader: Send + Sync {
    async fn load(&self) -> Result<Vec<Arc<Node>>, ChainError>;
}

pub type NodeDecoder = Arc<dyn Fn(&[u8]) -> Result<Vec<Arc<Node>>, ChainError> + Send + Sync>;

/// Loads nodes from every source in turn. Any failing source fails the
/// whole load, so a hop never swaps in a partial list.
pub struct SourceLoader {
    sources: Vec<Arc<dyn Source>>,
    decode: NodeDecoder,
}

impl SourceLoader {
    pub fn new(sources: Vec<Arc<dyn Source>>, decode: NodeDecoder) -> Self {
        Self { sources, decode }
    }
}

#[async_trait]
impl NodeLoader for SourceLoader {
    async fn load(&self) -> Result<Vec<Arc<Node>>, ChainError> {
        let mut nodes = Vec::new();
        for src in &self.sources {
            let raw = src.fetch().await?;
            let decoded = (self.decode)(&raw)
                .map_err(|e| ChainError::Load(format!("{}: {e}", src.describe())))?;
            nodes.extend(decoded);
        }
        Ok(nodes)
    }
}
