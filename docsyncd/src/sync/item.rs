use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use super::paths;

/// Remote id of an item that never reached the remote store.
pub const NO_REMOTE_ID: i64 = -1;
/// Version tag of an item with no observed remote version.
pub const NO_VERSION: i64 = -1;

#[derive(Debug, Error)]
pub enum ItemError {
    #[error("invalid item kind: {0}")]
    InvalidKind(String),
    #[error("invalid item status: {0}")]
    InvalidStatus(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemKind {
    File,
    Folder,
}

impl ItemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemKind::File => "file",
            ItemKind::Folder => "folder",
        }
    }

    pub fn parse(value: &str) -> Result<Self, ItemError> {
        match value {
            "file" => Ok(ItemKind::File),
            "folder" => Ok(ItemKind::Folder),
            other => Err(ItemError::InvalidKind(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemStatus {
    Unchanged,
    UpdatedLocal,
    UpdatedRemote,
    DeletedLocal,
    DeletedRemote,
    Conflict,
    RenamedLocal,
    RenamedRemote,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Unchanged => "unchanged",
            ItemStatus::UpdatedLocal => "updated_local",
            ItemStatus::UpdatedRemote => "updated_remote",
            ItemStatus::DeletedLocal => "deleted_local",
            ItemStatus::DeletedRemote => "deleted_remote",
            ItemStatus::Conflict => "conflict",
            ItemStatus::RenamedLocal => "renamed_local",
            ItemStatus::RenamedRemote => "renamed_remote",
        }
    }

    pub fn parse(value: &str) -> Result<Self, ItemError> {
        match value {
            "unchanged" => Ok(ItemStatus::Unchanged),
            "updated_local" => Ok(ItemStatus::UpdatedLocal),
            "updated_remote" => Ok(ItemStatus::UpdatedRemote),
            "deleted_local" => Ok(ItemStatus::DeletedLocal),
            "deleted_remote" => Ok(ItemStatus::DeletedRemote),
            "conflict" => Ok(ItemStatus::Conflict),
            "renamed_local" => Ok(ItemStatus::RenamedLocal),
            "renamed_remote" => Ok(ItemStatus::RenamedRemote),
            other => Err(ItemError::InvalidStatus(other.to_string())),
        }
    }
}

/// What to do when both replicas changed since the last agreed baseline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
pub enum ConflictPolicy {
    /// Raise a conflict and ask the escalation collaborator.
    #[default]
    Manual,
    /// Remote wins.
    OverwriteLocalChanges,
    /// Local wins.
    OverwriteRemoteChanges,
}

/// Both timestamps captured when a conflict was raised, for operator review.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConflictSnapshot {
    pub local_timestamp: i64,
    pub remote_timestamp: i64,
}

/// One file or folder known to either replica.
///
/// Paths are relative to the pairing root; `parent_path` is `""` for
/// top-level entries. Timestamps are Unix milliseconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemRecord {
    pub id: i64,
    pub remote_id: i64,
    pub version_tag: i64,
    pub parent_path: String,
    pub name: String,
    pub last_modified: i64,
    pub kind: ItemKind,
    pub status: ItemStatus,
    pub has_error: bool,
    pub last_error: Option<String>,
    pub pending_new_name: Option<String>,
    pub conflict: Option<ConflictSnapshot>,
    /// Status still owed to the replicas: set when a pass records the change
    /// and cleared once it is applied. Restored at the start of the next pass,
    /// so a lock, a failed transfer or an interrupted run never drops it.
    pub deferred: Option<ItemStatus>,
}

impl ItemRecord {
    /// A record for an entry first seen on disk.
    pub fn from_local(id: i64, kind: ItemKind, path: &str, last_modified: i64) -> Self {
        let (parent, name) = paths::split(path);
        Self {
            id,
            remote_id: NO_REMOTE_ID,
            version_tag: NO_VERSION,
            parent_path: parent.to_string(),
            name: name.to_string(),
            last_modified,
            kind,
            status: ItemStatus::UpdatedLocal,
            has_error: false,
            last_error: None,
            pending_new_name: None,
            conflict: None,
            deferred: None,
        }
    }

    /// A record for an entry first seen in the remote change feed.
    pub fn from_remote(
        id: i64,
        kind: ItemKind,
        path: &str,
        remote_id: i64,
        version_tag: Option<i64>,
        last_modified: i64,
    ) -> Self {
        let (parent, name) = paths::split(path);
        let version_tag = match kind {
            ItemKind::File => version_tag.unwrap_or(NO_VERSION),
            ItemKind::Folder => NO_VERSION,
        };
        Self {
            id,
            remote_id,
            version_tag,
            parent_path: parent.to_string(),
            name: name.to_string(),
            last_modified,
            kind,
            status: ItemStatus::UpdatedRemote,
            has_error: false,
            last_error: None,
            pending_new_name: None,
            conflict: None,
            deferred: None,
        }
    }

    pub fn full_path(&self) -> String {
        paths::join(&self.parent_path, &self.name)
    }

    pub fn set_error(&mut self, message: impl Into<String>) {
        self.has_error = true;
        self.last_error = Some(message.into());
    }

    pub fn clear_error(&mut self) {
        self.has_error = false;
        self.last_error = None;
    }

    /// Merges an observed local modification timestamp into the record.
    /// Folders are reconciled by existence in the orchestrator and are left
    /// untouched here.
    pub fn reconcile_with_local(&mut self, policy: ConflictPolicy, observed: i64) -> ItemStatus {
        if self.kind != ItemKind::File {
            return self.status;
        }

        if observed == self.last_modified {
            if self.remote_id == NO_REMOTE_ID {
                debug!(item_id = self.id, "timestamps equal but never synced");
                self.status = ItemStatus::UpdatedLocal;
            }
            return self.status;
        }

        if observed > self.last_modified {
            if matches!(self.status, ItemStatus::UpdatedRemote | ItemStatus::Conflict) {
                match policy {
                    ConflictPolicy::Manual => {
                        self.conflict = Some(ConflictSnapshot {
                            local_timestamp: observed,
                            remote_timestamp: self.last_modified,
                        });
                        self.status = ItemStatus::Conflict;
                        debug!(item_id = self.id, "local edit collides with remote claim");
                        return self.status;
                    }
                    ConflictPolicy::OverwriteLocalChanges => {
                        self.status = ItemStatus::UpdatedRemote;
                        return self.status;
                    }
                    ConflictPolicy::OverwriteRemoteChanges => {}
                }
            }
            self.last_modified = observed;
            self.status = ItemStatus::UpdatedLocal;
        } else {
            self.status = ItemStatus::UpdatedRemote;
        }
        debug!(item_id = self.id, status = self.status.as_str(), "reconciled with local");
        self.status
    }

    /// Merges a remote observation into the record.
    ///
    /// `sentinel_present` reports whether the deferred-download marker for
    /// this item exists on disk.
    pub fn reconcile_with_remote(
        &mut self,
        remote_id: i64,
        version_tag: i64,
        remote_timestamp: i64,
        policy: ConflictPolicy,
        sentinel_present: bool,
    ) -> ItemStatus {
        self.remote_id = remote_id;
        if self.kind != ItemKind::File {
            return self.status;
        }

        if self.version_tag == NO_VERSION {
            self.version_tag = version_tag;
            if remote_timestamp > self.last_modified {
                if self.resolve_remote_claim(policy, remote_timestamp) {
                    self.last_modified = remote_timestamp;
                    self.status = ItemStatus::UpdatedRemote;
                }
            } else if remote_timestamp < self.last_modified {
                self.status = ItemStatus::UpdatedLocal;
            } else {
                self.status = ItemStatus::Unchanged;
            }
        } else if sentinel_present {
            self.status = ItemStatus::Unchanged;
        } else if self.version_tag < version_tag {
            if self.resolve_remote_claim(policy, remote_timestamp) {
                self.version_tag = version_tag;
                self.status = ItemStatus::UpdatedRemote;
            }
        } else if self.version_tag > version_tag {
            self.status = ItemStatus::UpdatedLocal;
        }

        debug!(
            item_id = self.id,
            version_tag = self.version_tag,
            status = self.status.as_str(),
            "reconciled with remote"
        );
        self.status
    }

    /// Applies `policy` to a newer remote observation. Returns true when the
    /// remote side should be taken as-is.
    fn resolve_remote_claim(&mut self, policy: ConflictPolicy, remote_timestamp: i64) -> bool {
        if !matches!(self.status, ItemStatus::UpdatedLocal | ItemStatus::Conflict) {
            return true;
        }
        match policy {
            ConflictPolicy::Manual => {
                self.conflict = Some(ConflictSnapshot {
                    local_timestamp: self.last_modified,
                    remote_timestamp,
                });
                self.status = ItemStatus::Conflict;
                false
            }
            ConflictPolicy::OverwriteRemoteChanges => {
                self.status = ItemStatus::UpdatedLocal;
                false
            }
            ConflictPolicy::OverwriteLocalChanges => true,
        }
    }
}
