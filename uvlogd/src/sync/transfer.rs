use std::{io, path::Path, path::PathBuf, time::Duration};

use futures_util::StreamExt;
use reqwest::Client;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use url::Url;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("transfer timed out after {0:?}")]
    Timeout(Duration),
    #[error("transfer was cancelled")]
    Cancelled,
}

/// Streams remote files to disk. Admission control lives in the ticket
/// queue; this client only moves bytes.
#[derive(Clone)]
pub struct TransferClient {
    http: Client,
    request_timeout: Duration,
}

impl TransferClient {
    pub fn new(request_timeout: Duration) -> Self {
        Self {
            http: Client::new(),
            request_timeout,
        }
    }

    /// Downloads `url` into `target`, writing through a `.partial` sibling
    /// that is renamed into place only after a full, fsynced write. The
    /// partial file is removed on any failure.
    pub async fn download_to_path(&self, url: Url, target: &Path) -> Result<u64, TransferError> {
        match tokio::time::timeout(self.request_timeout, self.download_inner(url, target)).await {
            Ok(result) => result,
            Err(_) => {
                let _ = tokio::fs::remove_file(partial_path(target)).await;
                Err(TransferError::Timeout(self.request_timeout))
            }
        }
    }

    async fn download_inner(&self, url: Url, target: &Path) -> Result<u64, TransferError> {
        let response = self.http.get(url).send().await?.error_for_status()?;

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let partial = partial_path(target);
        let result = self.write_stream(response, &partial).await;
        match result {
            Ok(written) => {
                tokio::fs::rename(&partial, target).await?;
                Ok(written)
            }
            Err(err) => {
                let _ = tokio::fs::remove_file(&partial).await;
                Err(err)
            }
        }
    }

    async fn write_stream(
        &self,
        response: reqwest::Response,
        partial: &Path,
    ) -> Result<u64, TransferError> {
        let mut file = tokio::fs::File::create(partial).await?;
        let mut stream = response.bytes_stream();
        let mut written = 0u64;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }

        file.flush().await?;
        file.sync_all().await?;
        Ok(written)
    }
}

fn partial_path(target: &Path) -> PathBuf {
    target.with_extension(format!(
        "{}partial",
        target
            .extension()
            .map(|ext| format!("{}.", ext.to_string_lossy()))
            .unwrap_or_default()
    ))
}
