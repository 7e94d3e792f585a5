use std::collections::{HashMap, VecDeque};
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};

use docsync_core::{
    ChangeKind, ChangePage, LibraryError, RemoteChangeEvent, RemoteFileVersion, RemoteItemKind,
    RemoteLibrary, StatusCode, UploadedFile,
};

use super::local::from_unix_millis;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    ListChanges(String),
    ListAll,
    Download(String),
    Upload(String),
    GetVersion(String),
    CreateFolder(String, String),
    DeleteFolder(String),
    DeleteFile(i64),
    Rename(i64, String),
    EnsureFolder(String),
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum Failure {
    Auth,
    Locked,
    Server,
}

impl Failure {
    fn error(self) -> LibraryError {
        match self {
            Failure::Auth => LibraryError::Api {
                status: StatusCode::UNAUTHORIZED,
                body: "token expired".into(),
            },
            Failure::Locked => LibraryError::Io(io::Error::from(io::ErrorKind::ResourceBusy)),
            Failure::Server => LibraryError::Api {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                body: "boom".into(),
            },
        }
    }
}

enum Scripted {
    Page(ChangePage),
    InvalidCursor,
    Fail(Failure),
}

#[derive(Debug, Clone)]
struct RemoteFile {
    id: i64,
    version: i64,
    timestamp: i64,
    content: Vec<u8>,
}

#[derive(Default)]
struct FakeState {
    calls: Vec<Call>,
    listing: Vec<RemoteChangeEvent>,
    head: Option<String>,
    pages: VecDeque<Scripted>,
    files: HashMap<String, RemoteFile>,
    folders: HashMap<String, i64>,
    next_id: i64,
    upload_failures: VecDeque<Failure>,
    download_failures: VecDeque<Failure>,
    rename_failures: VecDeque<Failure>,
}

impl FakeState {
    fn allocate_id(&mut self) -> i64 {
        self.next_id += 1;
        1000 + self.next_id
    }
}

/// In-memory document library that records every call.
#[derive(Clone, Default)]
pub(crate) struct FakeLibrary {
    state: Arc<Mutex<FakeState>>,
}

impl FakeLibrary {
    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    /// A file that exists remotely and shows up in the full listing.
    pub fn with_file(self, path: &str, id: i64, version: i64, timestamp: i64, content: &str) -> Self {
        {
            let mut state = self.state();
            state.files.insert(
                path.to_string(),
                RemoteFile {
                    id,
                    version,
                    timestamp,
                    content: content.as_bytes().to_vec(),
                },
            );
            state
                .listing
                .push(event(id, ChangeKind::Added, RemoteItemKind::File, path, Some(version), timestamp));
        }
        self
    }

    pub fn with_folder(self, path: &str, id: i64) -> Self {
        {
            let mut state = self.state();
            state.folders.insert(path.to_string(), id);
            state
                .listing
                .push(event(id, ChangeKind::Added, RemoteItemKind::Folder, path, None, 0));
        }
        self
    }

    /// Cursor returned for the feed head.
    pub fn with_head(self, cursor: &str) -> Self {
        self.state().head = Some(cursor.to_string());
        self
    }

    /// Updates a remote file's content without recording a feed event.
    pub fn put_file(&self, path: &str, id: i64, version: i64, timestamp: i64, content: &str) {
        self.state().files.insert(
            path.to_string(),
            RemoteFile {
                id,
                version,
                timestamp,
                content: content.as_bytes().to_vec(),
            },
        );
    }

    pub fn push_page(&self, events: Vec<RemoteChangeEvent>, cursor: &str, has_more: bool) {
        self.state().pages.push_back(Scripted::Page(ChangePage {
            events,
            new_cursor: Some(cursor.to_string()),
            has_more,
        }));
    }

    pub fn push_invalid_cursor(&self) {
        self.state().pages.push_back(Scripted::InvalidCursor);
    }

    pub fn push_changes_failure(&self, failure: Failure) {
        self.state().pages.push_back(Scripted::Fail(failure));
    }

    pub fn fail_next_upload(&self, failure: Failure) {
        self.state().upload_failures.push_back(failure);
    }

    pub fn fail_next_download(&self, failure: Failure) {
        self.state().download_failures.push_back(failure);
    }

    pub fn fail_next_rename(&self, failure: Failure) {
        self.state().rename_failures.push_back(failure);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    pub fn count(&self, matches: impl Fn(&Call) -> bool) -> usize {
        self.state().calls.iter().filter(|call| matches(call)).count()
    }

    pub fn remote_version(&self, path: &str) -> Option<i64> {
        self.state().files.get(path).map(|file| file.version)
    }

    fn record(&self, call: Call) {
        self.state().calls.push(call);
    }
}

pub(crate) fn event(
    id: i64,
    change_kind: ChangeKind,
    item_kind: RemoteItemKind,
    path: &str,
    version_tag: Option<i64>,
    timestamp: i64,
) -> RemoteChangeEvent {
    RemoteChangeEvent {
        item_id: id,
        change_kind,
        item_kind,
        name: path.rsplit('/').next().unwrap_or(path).to_string(),
        version_tag,
        timestamp,
        full_path: path.to_string(),
        change_token: None,
    }
}

impl RemoteLibrary for FakeLibrary {
    async fn list_changes_since(&self, cursor: &str) -> Result<ChangePage, LibraryError> {
        self.record(Call::ListChanges(cursor.to_string()));
        let mut state = self.state();
        if cursor.is_empty() {
            return Ok(ChangePage {
                events: Vec::new(),
                new_cursor: state.head.clone(),
                has_more: false,
            });
        }
        match state.pages.pop_front() {
            Some(Scripted::Page(page)) => Ok(page),
            Some(Scripted::InvalidCursor) => Err(LibraryError::InvalidCursor),
            Some(Scripted::Fail(failure)) => Err(failure.error()),
            None => Ok(ChangePage::default()),
        }
    }

    async fn list_all_items(&self) -> Result<Vec<RemoteChangeEvent>, LibraryError> {
        self.record(Call::ListAll);
        Ok(self.state().listing.clone())
    }

    async fn download_file(&self, remote_path: &str, target_dir: &Path) -> Result<i64, LibraryError> {
        self.record(Call::Download(remote_path.to_string()));
        let file = {
            let mut state = self.state();
            if let Some(failure) = state.download_failures.pop_front() {
                return Err(failure.error());
            }
            state
                .files
                .get(remote_path)
                .cloned()
                .ok_or_else(|| LibraryError::NotFound(remote_path.to_string()))?
        };
        let name = remote_path.rsplit('/').next().unwrap_or(remote_path);
        std::fs::create_dir_all(target_dir)?;
        let target = target_dir.join(name);
        std::fs::write(&target, &file.content)?;
        std::fs::File::options()
            .write(true)
            .open(&target)?
            .set_modified(from_unix_millis(file.timestamp))?;
        Ok(file.timestamp)
    }

    async fn upload_file(&self, remote_path: &str, local_file: &Path) -> Result<UploadedFile, LibraryError> {
        self.record(Call::Upload(remote_path.to_string()));
        if let Some(failure) = self.state().upload_failures.pop_front() {
            return Err(failure.error());
        }
        let content = std::fs::read(local_file)?;
        let mut state = self.state();
        let (id, version) = match state.files.get(remote_path) {
            Some(existing) => (existing.id, existing.version + 1),
            None => (state.allocate_id(), 1),
        };
        state.files.insert(
            remote_path.to_string(),
            RemoteFile {
                id,
                version,
                timestamp: 0,
                content,
            },
        );
        Ok(UploadedFile {
            remote_id: id,
            version_tag: version,
        })
    }

    async fn get_file_version(&self, remote_path: &str) -> Result<RemoteFileVersion, LibraryError> {
        self.record(Call::GetVersion(remote_path.to_string()));
        self.state()
            .files
            .get(remote_path)
            .map(|file| RemoteFileVersion {
                version_tag: file.version,
                timestamp: file.timestamp,
            })
            .ok_or_else(|| LibraryError::NotFound(remote_path.to_string()))
    }

    async fn create_folder(&self, parent_path: &str, name: &str) -> Result<i64, LibraryError> {
        self.record(Call::CreateFolder(parent_path.to_string(), name.to_string()));
        let path = if parent_path.is_empty() {
            name.to_string()
        } else {
            format!("{parent_path}/{name}")
        };
        let mut state = self.state();
        if let Some(id) = state.folders.get(&path) {
            return Ok(*id);
        }
        let id = state.allocate_id();
        state.folders.insert(path, id);
        Ok(id)
    }

    async fn delete_folder(&self, path: &str) -> Result<(), LibraryError> {
        self.record(Call::DeleteFolder(path.to_string()));
        self.state().folders.remove(path);
        Ok(())
    }

    async fn delete_file(&self, remote_id: i64) -> Result<(), LibraryError> {
        self.record(Call::DeleteFile(remote_id));
        self.state().files.retain(|_, file| file.id != remote_id);
        Ok(())
    }

    async fn rename_item(&self, remote_id: i64, new_name: &str) -> Result<(), LibraryError> {
        self.record(Call::Rename(remote_id, new_name.to_string()));
        match self.state().rename_failures.pop_front() {
            Some(failure) => Err(failure.error()),
            None => Ok(()),
        }
    }

    async fn ensure_folder_path(&self, relative_path: &str) -> Result<(), LibraryError> {
        self.record(Call::EnsureFolder(relative_path.to_string()));
        Ok(())
    }
}
