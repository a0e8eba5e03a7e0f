use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A table together with the view used to list it. Each distinct pair keeps
/// its own sampling state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CollectionKey {
    pub table: String,
    pub view: String,
}

impl CollectionKey {
    pub fn new(table: impl Into<String>, view: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            view: view.into(),
        }
    }
}

impl fmt::Display for CollectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.table, self.view)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Record {
    pub id: String,
    #[serde(default)]
    pub fields: RecordFields,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RecordFields {
    pub title: Option<String>,
    pub description: Option<String>,
    #[serde(default)]
    pub attachment: Vec<Attachment>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Attachment {
    #[serde(default)]
    pub url: String,
    pub thumbnails: Option<Thumbnails>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Thumbnails {
    pub large: Option<Thumbnail>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Thumbnail {
    pub url: String,
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("server returned {status}: {message}")]
    Status { status: u16, message: String },
    #[error("invalid response: {0}")]
    Decode(String),
    #[error("collection {0} has no records")]
    EmptyCollection(CollectionKey),
    #[error("fetch worker is not running")]
    WorkerStopped,
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            FetchError::Decode(err.to_string())
        } else {
            FetchError::Request(err.to_string())
        }
    }
}

/// Remote record store. Only the two operations the feed needs.
#[async_trait]
pub trait RecordApi: Send + Sync {
    /// Every record identifier visible in the collection's view.
    async fn list_ids(&self, collection: &CollectionKey) -> Result<Vec<String>, FetchError>;

    /// A single record by identifier.
    async fn get_record(&self, table: &str, id: &str) -> Result<Record, FetchError>;
}
