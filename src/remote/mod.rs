//!
//! # Remote storage
//! Read-only view of a shared remote folder: paginated listings and file
//! content streams.
//!

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod dropbox;

pub use dropbox::{Account, DropboxClient, SharedFolder};

pub type ByteStream = BoxStream<'static, Result<Bytes, RemoteError>>;

#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("Http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Remote returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Access token is not a valid bearer token")]
    InvalidToken,

    #[error("Io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Folder,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: EntryKind,
    /// Only files carry a size.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path_lower: Option<String>,
}

impl Entry {
    pub fn file(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            kind: EntryKind::File,
            size: Some(size),
            path_lower: None,
        }
    }

    pub fn folder(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: EntryKind::Folder,
            size: None,
            path_lower: None,
        }
    }

    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListPage {
    pub entries: Vec<Entry>,
    pub cursor: String,
    pub has_more: bool,
}

/// Paths are relative to the shared folder root, which is `""`.
#[async_trait]
pub trait RemoteStorage: Send + Sync {
    async fn list_folder(&self, path: &str) -> Result<ListPage, RemoteError>;

    async fn list_folder_continue(&self, cursor: &str) -> Result<ListPage, RemoteError>;

    async fn fetch_file(&self, path: &str) -> Result<ByteStream, RemoteError>;
}

/// Complete listing of one folder, following continuation cursors.
pub async fn list_all(remote: &dyn RemoteStorage, path: &str) -> Result<Vec<Entry>, RemoteError> {
    let mut page = remote.list_folder(path).await?;
    let mut entries = std::mem::take(&mut page.entries);

    while page.has_more {
        page = remote.list_folder_continue(&page.cursor).await?;
        entries.append(&mut page.entries);
    }

    Ok(entries)
}

pub fn join_path(folder: &str, name: &str) -> String {
    format!("{}/{}", folder.trim_end_matches('/'), name)
}
