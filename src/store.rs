//! Read-only access to the published JSON artifacts
//!
//! Artifacts are addressed by relative path (`git-graph.json`,
//! `<hash>/<machine>/run.json`, ...) against either a local directory or an
//! HTTP origin such as a GitHub Pages site.

use crate::error::{Error, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::debug;
use url::Url;

/// A store that serves artifact bytes by relative path
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch the artifact at `path`. A missing artifact is `Error::NotFound`.
    async fn get(&self, path: &str) -> Result<Vec<u8>>;

    /// Human readable location, for log lines
    fn describe(&self) -> String;
}

/// Fetch and decode a JSON artifact
pub async fn get_json<T: DeserializeOwned>(store: &dyn ObjectStore, path: &str) -> Result<T> {
    let bytes = store.get(path).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Open the store at `location`: an `http(s)://` URL or a directory
pub fn open_store(location: &str) -> Result<Arc<dyn ObjectStore>> {
    if location.starts_with("http://") || location.starts_with("https://") {
        Ok(Arc::new(HttpStore::new(location)?))
    } else {
        Ok(Arc::new(LocalStore::new(location)))
    }
}

/// Reject paths that would escape the store root
fn checked_relative(path: &str) -> Result<&Path> {
    let relative = Path::new(path);
    let escapes = relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if path.is_empty() || escapes {
        return Err(Error::Other(format!("Invalid artifact path: '{}'", path)));
    }
    Ok(relative)
}

/// Artifacts in a local directory
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl ObjectStore for LocalStore {
    async fn get(&self, path: &str) -> Result<Vec<u8>> {
        let full = self.root.join(checked_relative(path)?);
        debug!("Reading {}", full.display());

        match tokio::fs::read(&full).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(full.display().to_string()))
            }
            Err(e) => Err(Error::FileReadError {
                path: full.display().to_string(),
                source: e,
            }),
        }
    }

    fn describe(&self) -> String {
        self.root.display().to_string()
    }
}

/// Artifacts served over HTTP
#[derive(Debug, Clone)]
pub struct HttpStore {
    client: reqwest::Client,
    base: Url,
}

impl HttpStore {
    pub fn new(base: &str) -> Result<Self> {
        // Url::join replaces the last segment unless the base ends in '/'
        let base = if base.ends_with('/') {
            Url::parse(base)?
        } else {
            Url::parse(&format!("{}/", base))?
        };

        let client = reqwest::Client::builder()
            .user_agent(concat!("bench-history/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self { client, base })
    }

    /// Absolute URL of an artifact
    pub fn url_for(&self, path: &str) -> Result<Url> {
        checked_relative(path)?;
        Ok(self.base.join(path)?)
    }
}

#[async_trait]
impl ObjectStore for HttpStore {
    async fn get(&self, path: &str) -> Result<Vec<u8>> {
        let url = self.url_for(path)?;
        debug!("GET {}", url);

        let response = self.client.get(url.clone()).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(Error::NotFound(url.to_string()));
        }

        let bytes = response.error_for_status()?.bytes().await?;
        Ok(bytes.to_vec())
    }

    fn describe(&self) -> String {
        self.base.to_string()
    }
}
