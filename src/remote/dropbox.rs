use async_trait::async_trait;
use futures_util::{StreamExt, TryStreamExt};
use headers::{Authorization, HeaderMap, HeaderMapExt};
use log::debug;
use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::remote::{ByteStream, Entry, EntryKind, ListPage, RemoteError, RemoteStorage};

const API_BASE: &str = "https://api.dropboxapi.com/2";
const CONTENT_BASE: &str = "https://content.dropboxapi.com/2";
const API_ARG_HEADER: &str = "Dropbox-API-Arg";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub account_id: String,
    pub display_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

#[derive(Deserialize)]
struct RawAccount {
    account_id: String,
    name: RawName,
    email: Option<String>,
}

#[derive(Deserialize)]
struct RawName {
    display_name: String,
}

#[derive(Deserialize)]
#[serde(tag = ".tag", rename_all = "lowercase")]
enum RawMetadata {
    File {
        name: String,
        size: u64,
        path_lower: Option<String>,
    },
    Folder {
        name: String,
        path_lower: Option<String>,
    },
    Deleted {
        name: String,
    },
}

#[derive(Deserialize)]
struct RawListing {
    entries: Vec<RawMetadata>,
    cursor: String,
    has_more: bool,
}

impl From<RawListing> for ListPage {
    fn from(raw: RawListing) -> Self {
        let entries = raw
            .entries
            .into_iter()
            .filter_map(|meta| match meta {
                RawMetadata::File { name, size, path_lower } => Some(Entry {
                    name,
                    kind: EntryKind::File,
                    size: Some(size),
                    path_lower,
                }),
                RawMetadata::Folder { name, path_lower } => Some(Entry {
                    name,
                    kind: EntryKind::Folder,
                    size: None,
                    path_lower,
                }),
                RawMetadata::Deleted { name } => {
                    debug!("Skipping deleted entry {}", name);
                    None
                }
            })
            .collect();

        ListPage {
            entries,
            cursor: raw.cursor,
            has_more: raw.has_more,
        }
    }
}

/// Bearer-authenticated client for the Dropbox v2 HTTP API.
#[derive(Clone)]
pub struct DropboxClient {
    client: Client,
    api_base: String,
    content_base: String,
}

impl DropboxClient {
    pub fn new(token: &str) -> Result<Self, RemoteError> {
        let mut header_map = HeaderMap::new();
        header_map.typed_insert(Authorization::bearer(token).map_err(|_| RemoteError::InvalidToken)?);
        header_map.typed_insert(headers::Connection::keep_alive());

        let client = Client::builder().default_headers(header_map).build()?;
        Ok(Self {
            client,
            api_base: API_BASE.to_string(),
            content_base: CONTENT_BASE.to_string(),
        })
    }

    pub fn with_endpoints(mut self, api_base: impl Into<String>, content_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self.content_base = content_base.into();
        self
    }

    fn rpc(&self, route: &str) -> RequestBuilder {
        self.client.post(format!("{}/{}", self.api_base, route))
    }

    async fn check(response: Response) -> Result<Response, RemoteError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(RemoteError::Status { status: status.as_u16(), body })
    }

    pub async fn current_account(&self) -> Result<Account, RemoteError> {
        let response = self.rpc("users/get_current_account").send().await?;
        let bytes = Self::check(response).await?.bytes().await?;
        let raw: RawAccount = serde_json::from_slice(&bytes)?;

        Ok(Account {
            account_id: raw.account_id,
            display_name: raw.name.display_name,
            email: raw.email,
        })
    }

    pub async fn list_shared_folder(&self, link: &str, path: &str) -> Result<ListPage, RemoteError> {
        let body = json!({ "path": path, "shared_link": { "url": link } });
        let response = self.rpc("files/list_folder").json(&body).send().await?;
        let bytes = Self::check(response).await?.bytes().await?;
        let raw: RawListing = serde_json::from_slice(&bytes)?;
        Ok(raw.into())
    }

    pub async fn list_continue(&self, cursor: &str) -> Result<ListPage, RemoteError> {
        let body = json!({ "cursor": cursor });
        let response = self.rpc("files/list_folder/continue").json(&body).send().await?;
        let bytes = Self::check(response).await?.bytes().await?;
        let raw: RawListing = serde_json::from_slice(&bytes)?;
        Ok(raw.into())
    }

    pub async fn shared_link_file(&self, link: &str, path: &str) -> Result<ByteStream, RemoteError> {
        let arg = header_safe_json(&json!({ "url": link, "path": path }));
        let response = self
            .client
            .post(format!("{}/sharing/get_shared_link_file", self.content_base))
            .header(API_ARG_HEADER, arg)
            .send()
            .await?;
        let response = Self::check(response).await?;

        Ok(response.bytes_stream().map_err(RemoteError::from).boxed())
    }
}

/// JSON for an HTTP header: everything outside printable ASCII is escaped.
fn header_safe_json(value: &serde_json::Value) -> String {
    let raw = value.to_string();
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if ch.is_ascii() && !ch.is_ascii_control() {
            out.push(ch);
        } else {
            let mut units = [0u16; 2];
            for unit in ch.encode_utf16(&mut units) {
                out.push_str(&format!("\\u{:04x}", unit));
            }
        }
    }
    out
}

/// A shared folder seen through a [`DropboxClient`].
#[derive(Clone)]
pub struct SharedFolder {
    client: DropboxClient,
    link: String,
}

impl SharedFolder {
    pub fn new(client: DropboxClient, link: impl Into<String>) -> Self {
        Self { client, link: link.into() }
    }
}

#[async_trait]
impl RemoteStorage for SharedFolder {
    async fn list_folder(&self, path: &str) -> Result<ListPage, RemoteError> {
        self.client.list_shared_folder(&self.link, path).await
    }

    async fn list_folder_continue(&self, cursor: &str) -> Result<ListPage, RemoteError> {
        self.client.list_continue(cursor).await
    }

    async fn fetch_file(&self, path: &str) -> Result<ByteStream, RemoteError> {
        self.client.shared_link_file(&self.link, path).await
    }
}
