//! Durable permit store + HTTP page fetch utilities.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use permits_core::Permit;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tracing::info_span;
use uuid::Uuid;

pub const CRATE_NAME: &str = "permits-storage";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// Hard cap on simultaneous page fetches across the whole run.
    pub max_concurrent_fetches: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            max_concurrent_fetches: 2,
        }
    }
}

/// One long-lived HTTP session shared by every page fetch in a run.
///
/// Built once at run start and passed by reference into the scrape
/// operations; the underlying connection pool is released when the client
/// drops, on success and failure paths alike.
#[derive(Debug)]
pub struct PageClient {
    client: reqwest::Client,
    fetch_limit: Arc<Semaphore>,
}

impl PageClient {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            fetch_limit: Arc::new(Semaphore::new(config.max_concurrent_fetches.max(1))),
        })
    }

    /// Fetch a page body as text. No retries; a failure is the caller's to
    /// classify as fatal or per-record.
    pub async fn fetch_page(&self, run_id: Uuid, url: &str) -> Result<String, FetchError> {
        let _slot = self.fetch_limit.acquire().await.expect("semaphore not closed");

        let span = info_span!("http_fetch", %run_id, url);
        let _guard = span.enter();

        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();

        if status.is_success() {
            Ok(resp.text().await?)
        } else {
            Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            })
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("reading store {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("store {} is malformed: {source}", .path.display())]
    Malformed {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("serializing store {}: {source}", .path.display())]
    Serialize {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("writing store {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// The full historical permit set as a single JSON file.
///
/// Reads fail fast when the file is missing or malformed; there is no
/// empty-store fallback, so a read bug can never overwrite good data with
/// an empty set. Saves sort by permit number and replace the file through
/// a temp-file rename.
#[derive(Debug, Clone)]
pub struct PermitStore {
    path: PathBuf,
}

impl PermitStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> Result<Vec<Permit>, StoreError> {
        let text = fs::read_to_string(&self.path)
            .await
            .map_err(|source| StoreError::Read {
                path: self.path.clone(),
                source,
            })?;
        serde_json::from_str(&text).map_err(|source| StoreError::Malformed {
            path: self.path.clone(),
            source,
        })
    }

    /// Sort ascending by `number` and persist the complete set, replacing
    /// prior contents atomically.
    pub async fn save(&self, records: &mut Vec<Permit>) -> Result<(), StoreError> {
        records.sort_by(|a, b| a.number.cmp(&b.number));

        let bytes =
            serde_json::to_vec_pretty(&records).map_err(|source| StoreError::Serialize {
                path: self.path.clone(),
                source,
            })?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .map_err(|source| StoreError::Write {
                        path: self.path.clone(),
                        source,
                    })?;
            }
        }

        let temp_name = format!(".{}.tmp", Uuid::new_v4());
        let temp_path = self
            .path
            .parent()
            .map(|p| p.join(&temp_name))
            .unwrap_or_else(|| PathBuf::from(&temp_name));

        let write_result = async {
            let mut file = fs::OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&temp_path)
                .await?;
            file.write_all(&bytes).await?;
            file.flush().await?;
            drop(file);
            fs::rename(&temp_path, &self.path).await
        }
        .await;

        match write_result {
            Ok(()) => Ok(()),
            Err(source) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(StoreError::Write {
                    path: self.path.clone(),
                    source,
                })
            }
        }
    }
}
