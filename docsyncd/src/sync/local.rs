use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::paths::{self, PathError, RESERVED_DIR};

#[derive(Debug, Error)]
pub enum LocalFsError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Path(#[from] PathError),
    #[error("trash error: {0}")]
    Trash(#[from] trash::Error),
    #[error("target already exists: {0}")]
    TargetExists(String),
}

impl LocalFsError {
    /// The entry is held open by another process; retry on a later pass.
    pub fn is_locked(&self) -> bool {
        match self {
            LocalFsError::Io(err) => is_lock_error(err),
            _ => false,
        }
    }
}

/// Sharing violations surface as busy/would-block on Unix and as raw
/// `ERROR_SHARING_VIOLATION` / `ERROR_LOCK_VIOLATION` on Windows.
pub fn is_lock_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ResourceBusy | io::ErrorKind::WouldBlock
    ) || (cfg!(windows) && matches!(err.raw_os_error(), Some(32 | 33)))
}

/// Where removed local entries go.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrashMode {
    /// The desktop recycle bin.
    #[default]
    System,
    /// `<root>/.docsync/trash`.
    Directory,
}

/// A file or folder found by a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalEntry {
    pub path: String,
    pub modified: i64,
}

#[derive(Debug, Default)]
pub struct LocalScan {
    pub folders: Vec<LocalEntry>,
    pub files: Vec<LocalEntry>,
}

/// The local side of one pairing.
#[derive(Debug, Clone)]
pub struct LocalTree {
    root: PathBuf,
    trash: TrashMode,
}

impl LocalTree {
    pub fn new(root: impl Into<PathBuf>, trash: TrashMode) -> Self {
        Self {
            root: root.into(),
            trash,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_of(&self, relative: &str) -> Result<PathBuf, PathError> {
        paths::local_path_for(&self.root, relative)
    }

    pub fn relative_of(&self, path: &Path) -> Result<String, PathError> {
        paths::relative_to(&self.root, path)
    }

    /// Walks the tree, skipping hidden entries, sentinel markers, in-flight
    /// downloads and the reserved folder.
    pub async fn scan(&self) -> Result<LocalScan, LocalFsError> {
        let mut scan = LocalScan::default();
        let mut pending = vec![self.root.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if name.starts_with('.') || paths::is_sentinel(&name) || paths::is_partial(&name) {
                    continue;
                }
                let file_type = entry.file_type().await?;
                let path = entry.path();
                let relative = self.relative_of(&path)?;
                let modified = unix_millis(entry.metadata().await?.modified()?);
                if file_type.is_dir() {
                    pending.push(path);
                    scan.folders.push(LocalEntry {
                        path: relative,
                        modified,
                    });
                } else if file_type.is_file() {
                    scan.files.push(LocalEntry {
                        path: relative,
                        modified,
                    });
                }
            }
        }
        Ok(scan)
    }

    /// Modification time of a file in Unix milliseconds, `None` when absent.
    pub async fn modified(&self, relative: &str) -> Result<Option<i64>, LocalFsError> {
        match tokio::fs::metadata(self.path_of(relative)?).await {
            Ok(meta) => Ok(Some(unix_millis(meta.modified()?))),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn file_exists(&self, relative: &str) -> Result<bool, LocalFsError> {
        let path = self.path_of(relative)?;
        Ok(tokio::fs::metadata(path)
            .await
            .map(|meta| meta.is_file())
            .unwrap_or(false))
    }

    pub async fn dir_exists(&self, relative: &str) -> Result<bool, LocalFsError> {
        let path = self.path_of(relative)?;
        Ok(tokio::fs::metadata(path)
            .await
            .map(|meta| meta.is_dir())
            .unwrap_or(false))
    }

    pub async fn sentinel_exists(&self, relative: &str) -> Result<bool, LocalFsError> {
        self.file_exists(&sentinel_path(relative)).await
    }

    pub async fn create_dir_all(&self, relative: &str) -> Result<(), LocalFsError> {
        tokio::fs::create_dir_all(self.path_of(relative)?).await?;
        Ok(())
    }

    /// Writes the zero-byte marker for a file whose content was not
    /// downloaded, stamped with the remote timestamp.
    pub async fn write_sentinel(&self, relative: &str, timestamp: i64) -> Result<(), LocalFsError> {
        let (parent, _) = paths::split(relative);
        self.create_dir_all(parent).await?;
        let path = self.path_of(&sentinel_path(relative))?;
        tokio::fs::File::create(&path).await?;
        set_file_modified(&path, timestamp)?;
        Ok(())
    }

    pub async fn remove_sentinel(&self, relative: &str) -> Result<(), LocalFsError> {
        match tokio::fs::remove_file(self.path_of(&sentinel_path(relative))?).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    pub fn set_modified(&self, relative: &str, timestamp: i64) -> Result<(), LocalFsError> {
        set_file_modified(&self.path_of(relative)?, timestamp)?;
        Ok(())
    }

    /// Renames within the tree; refuses to replace an existing entry.
    pub async fn rename(&self, from: &str, to: &str) -> Result<(), LocalFsError> {
        let source = self.path_of(from)?;
        let target = self.path_of(to)?;
        if tokio::fs::try_exists(&target).await? {
            return Err(LocalFsError::TargetExists(to.to_string()));
        }
        tokio::fs::rename(&source, &target).await?;
        Ok(())
    }

    /// Moves a file or folder to the recoverable trash. Missing entries are
    /// ignored.
    pub async fn recycle(&self, relative: &str) -> Result<(), LocalFsError> {
        let path = self.path_of(relative)?;
        if !tokio::fs::try_exists(&path).await? {
            return Ok(());
        }
        match self.trash {
            TrashMode::System => trash::delete(&path)?,
            TrashMode::Directory => {
                let bin = self.root.join(RESERVED_DIR).join("trash");
                tokio::fs::create_dir_all(&bin).await?;
                let (_, name) = paths::split(relative);
                let stamp = unix_millis(SystemTime::now());
                tokio::fs::rename(&path, bin.join(format!("{stamp}-{name}"))).await?;
            }
        }
        Ok(())
    }
}

pub fn sentinel_path(relative: &str) -> String {
    let (parent, name) = paths::split(relative);
    paths::join(parent, &paths::sentinel_name(name))
}

pub fn unix_millis(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

pub fn from_unix_millis(millis: i64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(millis.max(0) as u64)
}

fn set_file_modified(path: &Path, timestamp: i64) -> io::Result<()> {
    let file = std::fs::File::options().write(true).open(path)?;
    file.set_modified(from_unix_millis(timestamp))
}
