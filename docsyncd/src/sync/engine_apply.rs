use docsync_core::{LibraryError, RemoteLibrary};
use tracing::{debug, info, warn};

use super::conflict::conflict_path;
use super::engine::{EngineError, ProgressStatus, SyncEngine};
use super::item::{ItemKind, ItemRecord, ItemStatus};
use super::local::{LocalFsError, sentinel_path, unix_millis};
use super::paths;

/// What happens to a record once its side effects ran.
enum Step {
    Keep,
    Remove,
}

impl<L: RemoteLibrary> SyncEngine<L> {
    /// Executes the side effects implied by every pending status: folders
    /// first, then files. A fatal failure saves what was done and stops.
    pub(crate) async fn apply(&self, run_id: u64) -> Result<(), EngineError> {
        let result = self.apply_kinds(run_id).await;
        self.emit_run(run_id, 90, ProgressStatus::Running, "Saving metadata", None);
        self.store.save().await?;
        result
    }

    async fn apply_kinds(&self, run_id: u64) -> Result<(), EngineError> {
        for (kind, percent, message) in [
            (ItemKind::Folder, 20, "Synchronizing folders"),
            (ItemKind::File, 60, "Synchronizing files"),
        ] {
            self.emit_run(run_id, percent, ProgressStatus::Running, message, None);
            let mut pending: Vec<ItemRecord> = self
                .store
                .snapshot()
                .into_iter()
                .filter(|item| {
                    item.kind == kind && item.status != ItemStatus::Unchanged && !item.has_error
                })
                .collect();
            // Parents before children.
            pending.sort_by(|a, b| a.full_path().cmp(&b.full_path()));

            let count = pending.len();
            for (index, item) in pending.into_iter().enumerate() {
                // The folder pass may already have dropped this record.
                if self.store.get_by_id(item.id).is_none() {
                    continue;
                }
                let percent = ((index + 1) * 100 / count.max(1)) as u8;
                self.apply_item(run_id, item, percent).await?;
            }
        }
        Ok(())
    }

    async fn apply_item(&self, run_id: u64, mut item: ItemRecord, percent: u8) -> Result<(), EngineError> {
        let intent = item.status;
        self.emit_item(
            run_id,
            &item,
            percent,
            ProgressStatus::Running,
            format!("{} {}", item.status.as_str(), item.full_path()),
            None,
        );

        let outcome = match item.kind {
            ItemKind::Folder => self.apply_folder(&mut item).await,
            ItemKind::File => self.apply_file(run_id, &mut item, percent).await,
        };
        let step = match outcome {
            Ok(step) => {
                item.deferred = None;
                step
            }
            Err(err) if is_fatal(&err) => {
                item.deferred = Some(intent);
                // Credentials are the caller's problem, not the item's.
                if !err.is_auth() {
                    item.set_error(err.to_string());
                }
                self.emit_item(run_id, &item, percent, ProgressStatus::Error, "Synchronization failed", Some(&err));
                self.write_back(item, Step::Keep);
                return Err(err);
            }
            Err(err) if err.is_locked() => {
                self.defer(&mut item, intent);
                self.emit_item(run_id, &item, percent, ProgressStatus::Warning, "Item is in use; retrying later", Some(&err));
                Step::Keep
            }
            Err(err) => {
                item.deferred = Some(intent);
                match item.kind {
                    ItemKind::File => {
                        item.set_error(err.to_string());
                        self.emit_item(run_id, &item, percent, ProgressStatus::Error, "Synchronization failed", Some(&err));
                    }
                    ItemKind::Folder => {
                        self.revert_folder_rename(&item);
                        self.emit_item(run_id, &item, percent, ProgressStatus::Warning, "Folder could not be synchronized", Some(&err));
                    }
                }
                Step::Keep
            }
        };
        self.write_back(item, step);
        Ok(())
    }

    async fn apply_folder(&self, item: &mut ItemRecord) -> Result<Step, EngineError> {
        let path = item.full_path();
        let to_remote = self.pairing.direction.to_remote();
        let to_local = self.pairing.direction.to_local();
        let status = item.status;
        match status {
            ItemStatus::UpdatedLocal if to_remote => {
                if item.remote_id < 0 {
                    let parent = self.remote_path(&item.parent_path);
                    item.remote_id = self.remote.create_folder(&parent, &item.name).await?;
                    info!(item_id = item.id, path = %path, remote_id = item.remote_id, "created remote folder");
                }
                item.status = ItemStatus::Unchanged;
            }
            ItemStatus::UpdatedRemote if to_local => {
                self.local.create_dir_all(&path).await?;
                item.status = ItemStatus::Unchanged;
            }
            ItemStatus::DeletedLocal => {
                if to_remote {
                    self.delete_remote(item, &path).await?;
                }
                return Ok(Step::Remove);
            }
            ItemStatus::DeletedRemote => {
                if to_local {
                    self.local.recycle(&path).await?;
                    info!(item_id = item.id, path = %path, "moved folder to trash");
                }
                return Ok(Step::Remove);
            }
            ItemStatus::RenamedLocal => self.rename_on_remote(item).await?,
            ItemStatus::RenamedRemote if to_local => self.rename_on_local(item).await?,
            _ => item.status = ItemStatus::Unchanged,
        }
        Ok(Step::Keep)
    }

    async fn apply_file(&self, run_id: u64, item: &mut ItemRecord, percent: u8) -> Result<Step, EngineError> {
        let path = item.full_path();
        let to_remote = self.pairing.direction.to_remote();
        let to_local = self.pairing.direction.to_local();
        let status = item.status;
        match status {
            ItemStatus::UpdatedLocal if to_remote => self.upload(item).await?,
            ItemStatus::UpdatedRemote if to_local => self.download(item, false).await?,
            ItemStatus::DeletedLocal => {
                if to_remote {
                    self.delete_remote(item, &path).await?;
                }
                return Ok(Step::Remove);
            }
            ItemStatus::DeletedRemote => {
                if to_local {
                    self.local.recycle(&path).await?;
                    self.local.recycle(&sentinel_path(&path)).await?;
                    info!(item_id = item.id, path = %path, "moved file to trash");
                }
                return Ok(Step::Remove);
            }
            ItemStatus::RenamedLocal => self.rename_on_remote(item).await?,
            ItemStatus::RenamedRemote if to_local => self.rename_on_local(item).await?,
            ItemStatus::Conflict if to_local => {
                self.emit_item(run_id, item, percent, ProgressStatus::Conflict, "Keeping both versions", None);
                if self.local.file_exists(&path).await? {
                    let copy = conflict_path(&path, unix_millis(std::time::SystemTime::now()));
                    self.local.rename(&path, &copy).await?;
                    info!(item_id = item.id, path = %path, copy = %copy, "preserved local copy of conflicting file");
                }
                item.conflict = None;
                self.download(item, true).await?;
            }
            _ => {}
        }
        Ok(Step::Keep)
    }

    async fn upload(&self, item: &mut ItemRecord) -> Result<(), EngineError> {
        let path = item.full_path();
        if !item.parent_path.is_empty() {
            self.remote
                .ensure_folder_path(&self.remote_path(&item.parent_path))
                .await?;
        }
        let local_file = self.local.path_of(&path)?;
        let uploaded = self
            .remote
            .upload_file(&self.remote_path(&path), &local_file)
            .await
            .map_err(|source| transfer_error(&path, source))?;
        item.remote_id = uploaded.remote_id;
        item.version_tag = uploaded.version_tag;
        if let Some(modified) = self.local.modified(&path).await? {
            item.last_modified = modified;
        }
        item.status = ItemStatus::Unchanged;
        info!(item_id = item.id, path = %path, version_tag = item.version_tag, "uploaded");
        Ok(())
    }

    /// `force` skips the deferred-download shortcuts. The record takes the
    /// remote version only once the content or its sentinel is on disk.
    async fn download(&self, item: &mut ItemRecord, force: bool) -> Result<(), EngineError> {
        let path = item.full_path();
        let remote_path = self.remote_path(&path);
        let version = self.remote.get_file_version(&remote_path).await?;

        if !force && !self.local.file_exists(&path).await? {
            if self.local.sentinel_exists(&path).await? {
                item.version_tag = version.version_tag;
                item.last_modified = version.timestamp;
                item.status = ItemStatus::Unchanged;
                return Ok(());
            }
            if self.pairing.download_headers_only {
                self.local.write_sentinel(&path, version.timestamp).await?;
                item.version_tag = version.version_tag;
                item.last_modified = version.timestamp;
                item.status = ItemStatus::Unchanged;
                debug!(item_id = item.id, path = %path, "wrote sentinel");
                return Ok(());
            }
        }

        self.local.create_dir_all(&item.parent_path).await?;
        let target_dir = self.local.path_of(&item.parent_path)?;
        let stamp = self
            .remote
            .download_file(&remote_path, &target_dir)
            .await
            .map_err(|source| transfer_error(&path, source))?;
        item.version_tag = version.version_tag;
        item.last_modified = stamp;
        item.status = ItemStatus::Unchanged;
        info!(item_id = item.id, path = %path, version_tag = item.version_tag, "downloaded");
        Ok(())
    }

    /// Remote failures other than authentication are ignored; the record is
    /// dropped either way.
    async fn delete_remote(&self, item: &ItemRecord, path: &str) -> Result<(), EngineError> {
        let result = match item.kind {
            ItemKind::Folder => self.remote.delete_folder(&self.remote_path(path)).await,
            ItemKind::File if item.remote_id >= 0 => self.remote.delete_file(item.remote_id).await,
            ItemKind::File => Ok(()),
        };
        match result {
            Ok(()) => info!(item_id = item.id, path = %path, "deleted remote item"),
            Err(err) if err.is_auth() => return Err(err.into()),
            Err(err) => warn!(item_id = item.id, path = %path, error = %err, "remote delete failed; dropping record"),
        }
        Ok(())
    }

    async fn rename_on_remote(&self, item: &mut ItemRecord) -> Result<(), EngineError> {
        let Some(new_name) = item.pending_new_name.take() else {
            item.status = ItemStatus::Unchanged;
            return Ok(());
        };
        if self.pairing.direction.to_remote() && item.remote_id >= 0 {
            if let Err(err) = self.remote.rename_item(item.remote_id, &new_name).await {
                item.pending_new_name = Some(new_name);
                return Err(err.into());
            }
            info!(item_id = item.id, from = %item.name, to = %new_name, "renamed remote item");
        }
        item.name = new_name;
        item.status = ItemStatus::Unchanged;
        Ok(())
    }

    async fn rename_on_local(&self, item: &mut ItemRecord) -> Result<(), EngineError> {
        let Some(new_name) = item.pending_new_name.clone() else {
            item.status = ItemStatus::Unchanged;
            return Ok(());
        };
        let from = item.full_path();
        let to = paths::join(&item.parent_path, &new_name);
        if self
            .store
            .get_by_path(&to)
            .is_some_and(|other| other.id != item.id)
        {
            return Err(LocalFsError::TargetExists(to).into());
        }
        match item.kind {
            ItemKind::File if !self.local.file_exists(&from).await? => {
                if self.local.sentinel_exists(&from).await? {
                    self.local.rename(&sentinel_path(&from), &sentinel_path(&to)).await?;
                }
            }
            _ => self.local.rename(&from, &to).await?,
        }
        info!(item_id = item.id, from = %from, to = %to, "renamed local item");
        item.name = new_name;
        item.pending_new_name = None;
        item.status = ItemStatus::Unchanged;
        Ok(())
    }

    /// Pushes a locked item to the next pass, which restores `intent` along
    /// with any pending rename.
    fn defer(&self, item: &mut ItemRecord, intent: ItemStatus) {
        self.revert_folder_rename(item);
        item.deferred = Some(intent);
        item.status = ItemStatus::Unchanged;
    }

    /// Undoes the descendant rewrite of a remote folder rename that did not
    /// reach the disk.
    fn revert_folder_rename(&self, item: &ItemRecord) {
        if item.kind != ItemKind::Folder || item.status != ItemStatus::RenamedRemote {
            return;
        }
        let Some(new_name) = item.pending_new_name.as_deref() else {
            return;
        };
        let renamed = paths::join(&item.parent_path, new_name);
        self.store.with_items_mut(|set| {
            set.rewrite_descendants(&renamed, &item.full_path());
        });
    }

    fn write_back(&self, item: ItemRecord, step: Step) {
        self.store.with_items_mut(|set| match step {
            Step::Keep => {
                if let Some(mut current) = set.get_mut(item.id) {
                    *current = item;
                }
            }
            Step::Remove => {
                if item.kind == ItemKind::Folder {
                    for id in set.descendants_of(&item.full_path()) {
                        set.remove(id);
                    }
                }
                set.remove(item.id);
            }
        });
    }
}

/// Local read failures stay with the item; everything else the service
/// reports during a content transfer ends the run.
fn transfer_error(path: &str, source: LibraryError) -> EngineError {
    if source.local_io().is_some() || source.is_auth() {
        EngineError::Remote(source)
    } else {
        EngineError::Transfer {
            path: path.to_string(),
            source,
        }
    }
}

fn is_fatal(err: &EngineError) -> bool {
    err.is_auth()
        || matches!(
            err,
            EngineError::Transfer { .. } | EngineError::Store(_) | EngineError::Join(_)
        )
}
