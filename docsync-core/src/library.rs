use std::future::Future;
use std::path::Path;

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LibraryError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("api returned {status}: {body}")]
    Api { status: StatusCode, body: String },
    #[error("change cursor is no longer valid")]
    InvalidCursor,
    #[error("remote item not found: {0}")]
    NotFound(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    RateLimit,
    Transient,
    Permanent,
}

impl LibraryError {
    pub fn classification(&self) -> Option<ApiErrorClass> {
        match self {
            LibraryError::Api { status, .. } => Some(classify_api_status(*status)),
            LibraryError::Request(err) if err.is_timeout() || err.is_connect() => {
                Some(ApiErrorClass::Transient)
            }
            LibraryError::Request(err) => err.status().map(classify_api_status),
            _ => None,
        }
    }

    pub fn is_auth(&self) -> bool {
        matches!(self.classification(), Some(ApiErrorClass::Auth))
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.classification(),
            Some(ApiErrorClass::RateLimit | ApiErrorClass::Transient)
        )
    }

    /// The local side of a transfer failed (reading the upload source or
    /// writing the download target), not the service.
    pub fn local_io(&self) -> Option<&std::io::Error> {
        match self {
            LibraryError::Io(err) => Some(err),
            _ => None,
        }
    }
}

pub(crate) fn classify_api_status(status: StatusCode) -> ApiErrorClass {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ApiErrorClass::Auth
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ApiErrorClass::RateLimit
    } else if status.is_server_error()
        || matches!(
            status,
            StatusCode::REQUEST_TIMEOUT | StatusCode::CONFLICT | StatusCode::TOO_EARLY
        )
    {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Updated,
    Renamed,
    Deleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteItemKind {
    File,
    Folder,
}

/// One observation from the remote change feed.
///
/// `full_path` is relative to the library root and includes `name`;
/// `timestamp` is milliseconds since the Unix epoch. Delete events may carry
/// an empty path since the service no longer knows where the item lived.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RemoteChangeEvent {
    #[serde(rename = "id")]
    pub item_id: i64,
    #[serde(rename = "change")]
    pub change_kind: ChangeKind,
    #[serde(rename = "kind", default = "default_item_kind")]
    pub item_kind: RemoteItemKind,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "version", default)]
    pub version_tag: Option<i64>,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(rename = "path", default)]
    pub full_path: String,
    #[serde(rename = "token", default)]
    pub change_token: Option<String>,
}

fn default_item_kind() -> RemoteItemKind {
    RemoteItemKind::File
}

/// A page of the change feed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ChangePage {
    #[serde(rename = "changes", default)]
    pub events: Vec<RemoteChangeEvent>,
    #[serde(rename = "cursor", default)]
    pub new_cursor: Option<String>,
    #[serde(default)]
    pub has_more: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct UploadedFile {
    #[serde(rename = "id")]
    pub remote_id: i64,
    #[serde(rename = "version")]
    pub version_tag: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct RemoteFileVersion {
    #[serde(rename = "version")]
    pub version_tag: i64,
    pub timestamp: i64,
}

/// The remote document-library collaborator consumed by the sync engine.
///
/// Paths are relative to the library root, `/`-separated, without a leading
/// slash. Calls are awaited one at a time by the engine; any deadline is the
/// implementation's own business.
pub trait RemoteLibrary: Send + Sync {
    /// Returns [`LibraryError::InvalidCursor`] when the service no longer
    /// recognizes `cursor`. An empty cursor asks for the feed head.
    fn list_changes_since(
        &self,
        cursor: &str,
    ) -> impl Future<Output = Result<ChangePage, LibraryError>> + Send;

    /// Enumerates the whole remote tree as `Added` events.
    fn list_all_items(
        &self,
    ) -> impl Future<Output = Result<Vec<RemoteChangeEvent>, LibraryError>> + Send;

    /// Writes the file into `target_dir` under its remote name and returns
    /// the resulting local modification timestamp.
    fn download_file(
        &self,
        remote_path: &str,
        target_dir: &Path,
    ) -> impl Future<Output = Result<i64, LibraryError>> + Send;

    fn upload_file(
        &self,
        remote_path: &str,
        local_file: &Path,
    ) -> impl Future<Output = Result<UploadedFile, LibraryError>> + Send;

    fn get_file_version(
        &self,
        remote_path: &str,
    ) -> impl Future<Output = Result<RemoteFileVersion, LibraryError>> + Send;

    /// Idempotent: an existing folder returns its id.
    fn create_folder(
        &self,
        parent_path: &str,
        name: &str,
    ) -> impl Future<Output = Result<i64, LibraryError>> + Send;

    fn delete_folder(&self, path: &str) -> impl Future<Output = Result<(), LibraryError>> + Send;

    fn delete_file(&self, remote_id: i64) -> impl Future<Output = Result<(), LibraryError>> + Send;

    fn rename_item(
        &self,
        remote_id: i64,
        new_name: &str,
    ) -> impl Future<Output = Result<(), LibraryError>> + Send;

    /// Creates any missing intermediate folders of `relative_path`.
    fn ensure_folder_path(
        &self,
        relative_path: &str,
    ) -> impl Future<Output = Result<(), LibraryError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_auth_statuses() {
        let err = LibraryError::Api {
            status: StatusCode::UNAUTHORIZED,
            body: String::new(),
        };
        assert_eq!(err.classification(), Some(ApiErrorClass::Auth));
        assert!(err.is_auth());
        assert!(!err.is_retryable());
    }

    #[test]
    fn classifies_server_errors_as_transient() {
        let err = LibraryError::Api {
            status: StatusCode::SERVICE_UNAVAILABLE,
            body: String::new(),
        };
        assert!(err.is_retryable());
        let err = LibraryError::Api {
            status: StatusCode::NOT_FOUND,
            body: String::new(),
        };
        assert_eq!(err.classification(), Some(ApiErrorClass::Permanent));
    }

    #[test]
    fn invalid_cursor_and_io_are_unclassified() {
        assert_eq!(LibraryError::InvalidCursor.classification(), None);
        let io = LibraryError::Io(std::io::Error::from(std::io::ErrorKind::ResourceBusy));
        assert!(io.local_io().is_some());
        assert!(!io.is_auth());
    }

    #[test]
    fn change_event_parses_wire_names() {
        let event: RemoteChangeEvent = serde_json::from_value(serde_json::json!({
            "id": 5,
            "change": "renamed",
            "kind": "folder",
            "name": "Docs",
            "timestamp": 1_700_000_000_000i64,
            "path": "Docs",
            "token": "0005"
        }))
        .unwrap();
        assert_eq!(event.change_kind, ChangeKind::Renamed);
        assert_eq!(event.item_kind, RemoteItemKind::Folder);
        assert_eq!(event.version_tag, None);
        assert_eq!(event.change_token.as_deref(), Some("0005"));
    }
}
