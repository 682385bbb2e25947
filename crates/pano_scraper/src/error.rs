use panocore::CatalogError;
use serde::Serialize;
use std::{io, path::PathBuf};

/// Failure reported by a remote service client.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// Timeouts, connection resets, 5xx and 429: worth retrying.
    #[error("service unavailable: {0}")]
    Unavailable(String),
    /// Authentication or quota refusal; retrying cannot help.
    #[error("request refused: {0}")]
    Permanent(String),
    #[error("resource not found")]
    NotFound,
    #[error("malformed response: {0}")]
    Invalid(String),
}

impl ServiceError {
    #[inline]
    pub fn is_transient(&self) -> bool {
        matches!(self, ServiceError::Unavailable(_))
    }

    /// Maps a non-success HTTP status to the service error taxonomy.
    pub fn from_status(status: reqwest::StatusCode) -> Self {
        use reqwest::StatusCode;
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                ServiceError::Permanent(format!("HTTP {status}"))
            }
            StatusCode::NOT_FOUND | StatusCode::GONE => ServiceError::NotFound,
            StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => {
                ServiceError::Unavailable(format!("HTTP {status}"))
            }
            s if s.is_server_error() => ServiceError::Unavailable(format!("HTTP {s}")),
            s => ServiceError::Invalid(format!("HTTP {s}")),
        }
    }
}

impl From<reqwest::Error> for ServiceError {
    fn from(e: reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            return ServiceError::from_status(status);
        }
        if e.is_decode() {
            ServiceError::Invalid(e.to_string())
        } else {
            ServiceError::Unavailable(e.to_string())
        }
    }
}

/// Errors that end a run (or a stage) as a whole.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("invalid input: {0}")]
    InputInvalid(String),
    #[error("remote service refused the run: {0}")]
    NetworkPermanent(String),
    #[error("storage root {path} is not writable: {source}")]
    StorageUnwritable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{stage} stage needs {what}, which does not exist and is not produced by this run")]
    MissingDependency { stage: &'static str, what: String },
    #[error("compute pool unavailable: {0}")]
    ComputePool(String),
    #[error("run cancelled")]
    Cancelled,
    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

/// Category of a per-item failure in the failure report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// A point's metadata query failed after retries.
    QueryFailed,
    /// A record from the metadata service failed validation.
    MetadataInvalid,
    TileFetchFailed,
    StorageWriteFailed,
    ProjectionFailed,
}

/// One item (point or panorama) that was excluded from the output.
#[derive(Debug, Clone, Serialize)]
pub struct ItemFailure {
    pub item: String,
    pub kind: FailureKind,
    pub attempts: u32,
    pub detail: String,
}

impl ItemFailure {
    pub fn new(item: impl Into<String>, kind: FailureKind, attempts: u32, detail: impl ToString) -> Self {
        Self {
            item: item.into(),
            kind,
            attempts,
            detail: detail.to_string(),
        }
    }
}

/// Outcome of a single unit of work that did not succeed.
#[derive(Debug)]
pub enum ItemError {
    /// Recorded and skipped; the run continues.
    Failed(ItemFailure),
    /// Systemic; the run stops.
    Fatal(PipelineError),
}

impl From<ItemFailure> for ItemError {
    fn from(f: ItemFailure) -> Self {
        ItemError::Failed(f)
    }
}
