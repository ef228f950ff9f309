use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

const DEFAULT_BASE_URL: &str = "http://10.0.10.40:8080";

#[derive(Debug, Error)]
pub enum LogServerError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("base url cannot carry path segments")]
    InvalidBaseUrl,
    #[error("server returned {status}: {body}")]
    Api { status: StatusCode, body: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    RateLimit,
    Transient,
    Permanent,
}

/// Client for the log server's listing and download API.
///
/// Each vehicle CPU ("host") exposes its own log tree; every call is scoped
/// to one host and the caller merges inventories across hosts.
#[derive(Clone)]
pub struct LogServerClient {
    http: Client,
    base_url: Url,
}

impl LogServerClient {
    pub fn new() -> Result<Self, LogServerError> {
        Self::with_base_url(DEFAULT_BASE_URL)
    }

    pub fn with_base_url(base_url: &str) -> Result<Self, LogServerError> {
        Ok(Self {
            http: Client::new(),
            base_url: Url::parse(base_url)?,
        })
    }

    /// Lists the log session folder names a host currently reports.
    pub async fn list_folders(&self, host: &str) -> Result<Vec<String>, LogServerError> {
        let url = self.logs_endpoint(host, None)?;
        let response = self.http.get(url).send().await?;
        let index: FolderIndex = Self::handle_response(response).await?;
        Ok(index.folders.into_iter().map(|f| f.name).collect())
    }

    /// Lists the entries of one folder, including one level of
    /// subdirectory entries inlined by the server.
    pub async fn list_folder(
        &self,
        host: &str,
        folder: &str,
    ) -> Result<Vec<LogEntry>, LogServerError> {
        let url = self.logs_endpoint(host, Some(folder))?;
        let response = self.http.get(url).send().await?;
        let listing: FolderListing = Self::handle_response(response).await?;
        Ok(listing.entries)
    }

    /// URL that streams the bytes of one file inside a folder.
    pub fn file_url(
        &self,
        host: &str,
        folder: &str,
        rel_path: &str,
    ) -> Result<Url, LogServerError> {
        let mut url = self.base_url.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| LogServerError::InvalidBaseUrl)?;
            segments.extend(["v1", "hosts", host, "logs", folder, "files"]);
            segments.extend(rel_path.split('/').filter(|part| !part.is_empty()));
        }
        Ok(url)
    }

    fn logs_endpoint(&self, host: &str, folder: Option<&str>) -> Result<Url, LogServerError> {
        let mut url = self.base_url.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| LogServerError::InvalidBaseUrl)?;
            segments.extend(["v1", "hosts", host, "logs"]);
            if let Some(folder) = folder {
                segments.push(folder);
            }
        }
        Ok(url)
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, LogServerError> {
        if response.status().is_success() {
            Ok(response.json::<T>().await?)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(LogServerError::Api { status, body })
        }
    }
}

impl LogServerError {
    pub fn classification(&self) -> Option<ApiErrorClass> {
        match self {
            LogServerError::Api { status, .. } => Some(classify_api_status(*status)),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            LogServerError::Request(err) => err.is_timeout() || err.is_connect(),
            _ => matches!(
                self.classification(),
                Some(ApiErrorClass::RateLimit | ApiErrorClass::Transient)
            ),
        }
    }
}

fn classify_api_status(status: StatusCode) -> ApiErrorClass {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ApiErrorClass::Auth
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ApiErrorClass::RateLimit
    } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

/// One entry of a folder listing. Directories carry their children inline;
/// the server reports at most one level of nesting.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: EntryKind,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub entries: Vec<LogEntry>,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Dir,
}

#[derive(Debug, Deserialize, Serialize)]
struct FolderIndex {
    folders: Vec<FolderRef>,
}

#[derive(Debug, Deserialize, Serialize)]
struct FolderRef {
    name: String,
}

#[derive(Debug, Deserialize, Serialize)]
struct FolderListing {
    entries: Vec<LogEntry>,
}
