//! Getting a checkpoint onto local disk: read the cached file, and if that fails
//! download it once, cache it, and read it again.

use std::future::Future;
use std::path::PathBuf;

use burn::config::Config;
use thiserror::Error;

use crate::checkpoint::{Checkpoint, CheckpointError, write_file};

/// Where a checkpoint lives locally, and where to get it when it doesn't.
#[derive(Config, Debug)]
pub struct WeightSource {
    /// Local cache path of the safetensors checkpoint.
    pub path: PathBuf,
    /// Fetched (unauthenticated GET) when `path` can't be read.
    pub url: String,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("Got a status page instead of content: \n\n {0}")]
    InvalidHtml(String),
    #[error("Fetch failed: {0}")]
    Other(String),
}

#[derive(Debug, Error)]
pub enum InitError {
    #[error("Failed to download weights from {url}")]
    Fetch {
        url: String,
        #[source]
        source: FetchError,
    },
    #[error("Failed to cache downloaded weights at {path:?}")]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to load weights from {path:?}")]
    Load {
        path: PathBuf,
        #[source]
        source: CheckpointError,
    },
    #[error("Weights at {path:?} don't fit the model")]
    Incompatible {
        path: PathBuf,
        #[source]
        source: CheckpointError,
    },
}

/// Downloads raw checkpoint bytes.
pub trait WeightFetcher {
    fn fetch(&self, url: &str) -> impl Future<Output = Result<Vec<u8>, FetchError>>;
}

/// Plain HTTP(S) download.
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpFetcher;

impl WeightFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let response = reqwest::get(url).await?.error_for_status()?;
        let bytes = response.bytes().await?;

        // Some hosts answer a dead link with a 200 and a login/status page.
        if bytes.starts_with(b"<!DOCTYPE html>") || bytes.starts_with(b"<html") {
            return Err(FetchError::InvalidHtml(
                String::from_utf8_lossy(&bytes).into_owned(),
            ));
        }
        Ok(bytes.to_vec())
    }
}

impl WeightSource {
    /// Read the cached checkpoint, falling back to exactly one download.
    ///
    /// The second read is final: if the freshly downloaded file doesn't parse either,
    /// that's an error, not a reason to download again.
    pub async fn acquire(&self, fetcher: &impl WeightFetcher) -> Result<Checkpoint, InitError> {
        match Checkpoint::read(&self.path).await {
            Ok(checkpoint) => {
                log::info!("Loaded checkpoint {:?} ({} tensors)", self.path, checkpoint.len());
                return Ok(checkpoint);
            }
            Err(e) => {
                log::warn!("Failed to load {:?} ({e}), downloading {}", self.path, self.url);
            }
        }

        let fetched = fetcher.fetch(&self.url).await;
        let bytes = fetched.map_err(|source| InitError::Fetch {
            url: self.url.clone(),
            source,
        })?;
        log::info!("Downloaded {} bytes from {}", bytes.len(), self.url);

        let written = write_file(&self.path, &bytes).await;
        written.map_err(|source| InitError::Persist {
            path: self.path.clone(),
            source,
        })?;

        let reread = Checkpoint::read(&self.path).await;
        reread.map_err(|source| InitError::Load {
            path: self.path.clone(),
            source,
        })
    }
}
