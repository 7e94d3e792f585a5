use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::sync::item::ConflictPolicy;
use crate::sync::local::TrashMode;
use crate::sync::paths;

const DEFAULT_POLL_SECS: u64 = 300;
const DEFAULT_DEBOUNCE_MS: u64 = 5000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("home directory is unavailable")]
    MissingHome,
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("duplicate pairing for local folder {0}")]
    DuplicateFolder(PathBuf),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
pub enum SyncDirection {
    LocalToRemote,
    RemoteToLocal,
    #[default]
    Both,
}

impl SyncDirection {
    pub fn to_remote(&self) -> bool {
        matches!(self, SyncDirection::LocalToRemote | SyncDirection::Both)
    }

    pub fn to_local(&self) -> bool {
        matches!(self, SyncDirection::RemoteToLocal | SyncDirection::Both)
    }
}

/// One local folder paired with a remote document-library folder.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct PairingConfig {
    pub name: String,
    pub local_folder: PathBuf,
    pub library_url: String,
    /// Library folder the pairing mirrors, relative to the library root.
    #[serde(default)]
    pub remote_root: String,
    /// Only these folders (relative to the pairing root) are synced; empty
    /// means everything.
    #[serde(default)]
    pub selected_folders: Vec<String>,
    #[serde(default)]
    pub direction: SyncDirection,
    #[serde(default)]
    pub conflict_policy: ConflictPolicy,
    #[serde(default)]
    pub download_headers_only: bool,
    #[serde(default)]
    pub trash: TrashMode,
}

impl PairingConfig {
    pub fn new(name: impl Into<String>, local_folder: impl Into<PathBuf>, library_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            local_folder: local_folder.into(),
            library_url: library_url.into(),
            remote_root: String::new(),
            selected_folders: Vec::new(),
            direction: SyncDirection::Both,
            conflict_policy: ConflictPolicy::Manual,
            download_headers_only: false,
            trash: TrashMode::System,
        }
    }

    /// Whether an item at `relative` (relative to the pairing root) takes
    /// part in sync under the selected-folder filter.
    pub fn should_sync(&self, relative: &str) -> bool {
        if self.selected_folders.is_empty() {
            return true;
        }
        let relative = relative.to_lowercase();
        let (parent, _) = paths::split(&relative);
        self.selected_folders.iter().any(|folder| {
            let folder = folder.trim_matches('/').to_lowercase();
            folder.is_empty()
                || relative == folder
                || parent == folder
                || paths::is_within(parent, &folder)
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
struct PairingsFile {
    #[serde(default)]
    pairings: Vec<PairingConfig>,
}

pub fn load_pairings(path: &Path) -> Result<Vec<PairingConfig>, ConfigError> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    let file: PairingsFile = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    let mut seen = Vec::with_capacity(file.pairings.len());
    for pairing in &file.pairings {
        if seen.contains(&&pairing.local_folder) {
            return Err(ConfigError::DuplicateFolder(pairing.local_folder.clone()));
        }
        seen.push(&pairing.local_folder);
    }
    Ok(file.pairings)
}

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub pairings_path: PathBuf,
    pub poll_interval: Duration,
    pub debounce: Duration,
    pub enable_local_watcher: bool,
    pub token: Option<String>,
}

impl DaemonConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let home = dirs::home_dir().ok_or(ConfigError::MissingHome)?;
        let pairings_path = std::env::var("DOCSYNC_CONFIG")
            .ok()
            .map(|value| expand_with_home(&value, &home))
            .unwrap_or_else(|| default_config_dir(&home).join("pairings.json"));
        let poll_interval = Duration::from_secs(read_u64_env("DOCSYNC_POLL_SECS", DEFAULT_POLL_SECS));
        let debounce = Duration::from_millis(read_u64_env("DOCSYNC_DEBOUNCE_MS", DEFAULT_DEBOUNCE_MS));
        let enable_local_watcher = read_bool_env("DOCSYNC_ENABLE_LOCAL_WATCHER", true);
        let token = std::env::var("DOCSYNC_TOKEN")
            .ok()
            .filter(|value| !value.trim().is_empty());

        Ok(Self {
            pairings_path,
            poll_interval,
            debounce,
            enable_local_watcher,
            token,
        })
    }
}

fn default_config_dir(home: &Path) -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| home.join(".config"))
        .join("docsync")
}

pub(crate) fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

fn read_u64_env(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn read_bool_env(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .map(|value| {
            matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(default)
}
