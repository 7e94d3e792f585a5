use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use futures_util::StreamExt;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use url::Url;

use crate::library::{
    ChangePage, LibraryError, RemoteChangeEvent, RemoteFileVersion, RemoteLibrary, UploadedFile,
};

/// Suffix of the temporary file a download streams into before it is moved
/// over the target.
pub const PARTIAL_SUFFIX: &str = ".partial";

/// JSON client for a document-library service.
///
/// Endpoints are resolved against `base_url`:
/// `GET changes?cursor=`, `GET items`, `GET|PUT files/content?path=`,
/// `GET files/version?path=`, `POST folders`, `POST folders/ensure`,
/// `DELETE folders?path=`, `DELETE items/{id}`, `PATCH items/{id}`.
/// A `410 Gone` from the change feed means the cursor expired.
#[derive(Clone)]
pub struct LibraryClient {
    http: Client,
    base_url: Url,
    token: String,
}

impl LibraryClient {
    pub fn new(base_url: &str, token: impl Into<String>) -> Result<Self, LibraryError> {
        let mut base_url = Url::parse(base_url)?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Ok(Self {
            http: Client::new(),
            base_url,
            token: token.into(),
        })
    }

    fn auth_header_value(&self) -> String {
        format!("Bearer {}", self.token)
    }

    fn endpoint(&self, path: &str) -> Result<Url, LibraryError> {
        Ok(self.base_url.join(path)?)
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, LibraryError> {
        if response.status().is_success() {
            Ok(response.json::<T>().await?)
        } else {
            Err(Self::api_error(response).await)
        }
    }

    async fn handle_empty(response: reqwest::Response) -> Result<(), LibraryError> {
        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::api_error(response).await)
        }
    }

    async fn api_error(response: reqwest::Response) -> LibraryError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        LibraryError::Api { status, body }
    }
}

#[derive(Debug, Deserialize)]
struct ItemsResponse {
    items: Vec<RemoteChangeEvent>,
}

#[derive(Debug, Deserialize)]
struct FolderResponse {
    id: i64,
}

#[derive(Debug, Serialize)]
struct CreateFolderRequest<'a> {
    parent: &'a str,
    name: &'a str,
}

#[derive(Debug, Serialize)]
struct EnsureFolderRequest<'a> {
    path: &'a str,
}

#[derive(Debug, Serialize)]
struct RenameRequest<'a> {
    name: &'a str,
}

impl RemoteLibrary for LibraryClient {
    async fn list_changes_since(&self, cursor: &str) -> Result<ChangePage, LibraryError> {
        let mut url = self.endpoint("changes")?;
        if !cursor.is_empty() {
            url.query_pairs_mut().append_pair("cursor", cursor);
        }
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        if response.status() == StatusCode::GONE {
            return Err(LibraryError::InvalidCursor);
        }
        Self::handle_response(response).await
    }

    async fn list_all_items(&self) -> Result<Vec<RemoteChangeEvent>, LibraryError> {
        let url = self.endpoint("items")?;
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        let payload: ItemsResponse = Self::handle_response(response).await?;
        Ok(payload.items)
    }

    async fn download_file(&self, remote_path: &str, target_dir: &Path) -> Result<i64, LibraryError> {
        let name = remote_path
            .rsplit('/')
            .next()
            .filter(|name| !name.is_empty())
            .ok_or_else(|| LibraryError::NotFound(remote_path.to_string()))?;
        let target = target_dir.join(name);

        let mut url = self.endpoint("files/content")?;
        url.query_pairs_mut().append_pair("path", remote_path);
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(LibraryError::NotFound(remote_path.to_string()));
        }
        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }
        let remote_modified = response
            .headers()
            .get(reqwest::header::LAST_MODIFIED)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| httpdate::parse_http_date(value).ok());

        tokio::fs::create_dir_all(target_dir).await?;
        let partial = partial_path(&target);
        if let Err(err) = write_download(response, &partial, &target, remote_modified).await {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(err);
        }
        let modified = tokio::fs::metadata(&target).await?.modified()?;
        Ok(unix_millis(modified))
    }

    async fn upload_file(
        &self,
        remote_path: &str,
        local_file: &Path,
    ) -> Result<UploadedFile, LibraryError> {
        let file = tokio::fs::File::open(local_file).await?;
        let body = reqwest::Body::wrap_stream(ReaderStream::new(file));
        let mut url = self.endpoint("files/content")?;
        url.query_pairs_mut().append_pair("path", remote_path);
        let response = self
            .http
            .put(url)
            .header("Authorization", self.auth_header_value())
            .body(body)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    async fn get_file_version(&self, remote_path: &str) -> Result<RemoteFileVersion, LibraryError> {
        let mut url = self.endpoint("files/version")?;
        url.query_pairs_mut().append_pair("path", remote_path);
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(LibraryError::NotFound(remote_path.to_string()));
        }
        Self::handle_response(response).await
    }

    async fn create_folder(&self, parent_path: &str, name: &str) -> Result<i64, LibraryError> {
        let url = self.endpoint("folders")?;
        let response = self
            .http
            .post(url)
            .header("Authorization", self.auth_header_value())
            .json(&CreateFolderRequest {
                parent: parent_path,
                name,
            })
            .send()
            .await?;
        let folder: FolderResponse = Self::handle_response(response).await?;
        Ok(folder.id)
    }

    async fn delete_folder(&self, path: &str) -> Result<(), LibraryError> {
        let mut url = self.endpoint("folders")?;
        url.query_pairs_mut().append_pair("path", path);
        let response = self
            .http
            .delete(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        Self::handle_empty(response).await
    }

    async fn delete_file(&self, remote_id: i64) -> Result<(), LibraryError> {
        let url = self.endpoint(&format!("items/{remote_id}"))?;
        let response = self
            .http
            .delete(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        Self::handle_empty(response).await
    }

    async fn rename_item(&self, remote_id: i64, new_name: &str) -> Result<(), LibraryError> {
        let url = self.endpoint(&format!("items/{remote_id}"))?;
        let response = self
            .http
            .patch(url)
            .header("Authorization", self.auth_header_value())
            .json(&RenameRequest { name: new_name })
            .send()
            .await?;
        Self::handle_empty(response).await
    }

    async fn ensure_folder_path(&self, relative_path: &str) -> Result<(), LibraryError> {
        if relative_path.trim_matches('/').is_empty() {
            return Ok(());
        }
        let url = self.endpoint("folders/ensure")?;
        let response = self
            .http
            .post(url)
            .header("Authorization", self.auth_header_value())
            .json(&EnsureFolderRequest {
                path: relative_path,
            })
            .send()
            .await?;
        Self::handle_empty(response).await
    }
}

/// Streams the body into `partial`, stamps it, then moves it over `target`.
async fn write_download(
    response: reqwest::Response,
    partial: &Path,
    target: &Path,
    remote_modified: Option<SystemTime>,
) -> Result<(), LibraryError> {
    let mut file = tokio::fs::File::create(partial).await?;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        file.write_all(&chunk?).await?;
    }
    file.flush().await?;
    file.sync_all().await?;
    let file = file.into_std().await;
    if let Some(modified) = remote_modified {
        file.set_modified(modified)?;
    }
    drop(file);
    tokio::fs::rename(partial, target).await?;
    Ok(())
}

fn partial_path(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_owned();
    name.push(PARTIAL_SUFFIX);
    PathBuf::from(name)
}

fn unix_millis(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
