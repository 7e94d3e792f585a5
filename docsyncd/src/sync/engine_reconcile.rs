use std::collections::HashSet;

use docsync_core::{ChangeKind, LibraryError, RemoteChangeEvent, RemoteItemKind, RemoteLibrary};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::aggregate::{self, AggregatedChanges};
use super::conflict::ConflictResolver;
use super::engine::{EngineError, SyncEngine, SyncOptions};
use super::item::{ConflictPolicy, ItemKind, ItemRecord, ItemStatus, NO_REMOTE_ID, NO_VERSION};
use super::local::LocalEntry;
use super::paths;
use super::store::{ItemSet, MetadataStore, StoreError};

/// Result of the reconcile phase.
pub(crate) struct Analysis {
    pub changed: usize,
    pub more_pending: bool,
}

impl<L: RemoteLibrary> SyncEngine<L> {
    pub(crate) async fn reconcile(&self, options: SyncOptions) -> Result<Analysis, EngineError> {
        self.reset_statuses();

        let remote = self.fetch_remote_changes().await?;
        let to_remote = self.pairing.direction.to_remote();
        let to_local = self.pairing.direction.to_local();

        if options.rescan_local && to_remote {
            self.scan_local().await?;
        }

        if to_local {
            for event in &remote.events {
                self.apply_remote_event(event).await?;
            }
        }

        self.sweep_missing().await?;

        // The feed position moves only once its events are folded in.
        if let Some(cursor) = remote.new_cursor {
            debug!(to = %cursor, "advancing change cursor");
            self.store.set_change_cursor(cursor);
        }

        let changed = self.store.with_items_mut(|set| {
            set.iter()
                .filter(|item| item.status != ItemStatus::Unchanged && !item.has_error)
                .inspect(|item| {
                    debug!(
                        item_id = item.id,
                        path = %item.full_path(),
                        status = item.status.as_str(),
                        "pending change"
                    )
                })
                .count()
        });

        if !options.review_only {
            self.record_intents();
            self.store.save().await?;
        }
        info!(changed, more_pending = remote.has_more, "reconcile finished");
        Ok(Analysis {
            changed,
            more_pending: remote.has_more,
        })
    }

    /// Conflicts and failed items carry over. Everything else starts the
    /// pass unchanged unless an earlier pass left its change owed.
    fn reset_statuses(&self) {
        self.store.with_items_mut(|set| {
            let mut renamed_folders = Vec::new();
            set.update_all(|item| {
                if item.has_error || item.status == ItemStatus::Conflict {
                    return;
                }
                match item.deferred {
                    Some(status) => {
                        item.status = status;
                        if status == ItemStatus::RenamedRemote
                            && item.kind == ItemKind::Folder
                            && let Some(name) = &item.pending_new_name
                        {
                            renamed_folders.push((item.full_path(), paths::join(&item.parent_path, name)));
                        }
                    }
                    None => {
                        item.status = ItemStatus::Unchanged;
                        item.pending_new_name = None;
                        item.conflict = None;
                    }
                }
            });
            // A deferred remote folder rename had its subtree put back.
            for (from, to) in renamed_folders {
                cascade_rename(set, &from, &to);
            }
        });
    }

    /// Marks every pending change as owed until Phase B applies it.
    pub(crate) fn record_intents(&self) {
        self.store.with_items_mut(|set| {
            set.update_all(|item| {
                if item.has_error {
                    return;
                }
                item.deferred = (item.status != ItemStatus::Unchanged).then_some(item.status);
            });
        });
    }

    /// Reads the change feed without touching the stored cursor. The
    /// returned `new_cursor` is where it moves once the events are applied.
    pub(super) async fn fetch_remote_changes(&self) -> Result<AggregatedChanges, EngineError> {
        let cursor = self.store.change_cursor();
        if cursor.is_empty() {
            return self.fetch_full_listing().await;
        }

        match self.remote.list_changes_since(&cursor).await {
            Ok(page) => {
                let mut changes = aggregate::aggregate(page);
                changes.new_cursor = aggregate::advance_cursor(&cursor, changes.new_cursor.as_deref());
                Ok(changes)
            }
            Err(LibraryError::InvalidCursor) => {
                warn!(cursor = %cursor, "change cursor rejected; falling back to full resync");
                self.fetch_full_listing().await
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Enumerates the whole remote tree and targets the cursor at the feed
    /// head; an empty target keeps the next pass on a full listing.
    async fn fetch_full_listing(&self) -> Result<AggregatedChanges, EngineError> {
        info!("no change cursor; listing the whole library");
        let events = self.remote.list_all_items().await?;
        let head = aggregate::aggregate(self.remote.list_changes_since("").await?);
        Ok(AggregatedChanges {
            events,
            new_cursor: Some(aggregate::advance_cursor("", head.new_cursor.as_deref()).unwrap_or_default()),
            has_more: false,
        })
    }

    /// Fans out over folders, then over files; each fan-out finishes before
    /// the next starts.
    async fn scan_local(&self) -> Result<(), EngineError> {
        let scan = self.local.scan().await?;
        let policy = self.pairing.conflict_policy;
        // Targets of local renames not yet applied already have a record.
        let renaming: HashSet<String> = self.store.with_items_mut(|set| {
            set.iter()
                .filter(|item| item.status == ItemStatus::RenamedLocal)
                .filter_map(|item| {
                    item.pending_new_name
                        .as_deref()
                        .map(|name| paths::join(&item.parent_path, name))
                })
                .collect()
        });
        for (kind, entries) in [(ItemKind::Folder, scan.folders), (ItemKind::File, scan.files)] {
            let mut tasks = JoinSet::new();
            for entry in entries {
                if !self.pairing.should_sync(&entry.path) || renaming.contains(&entry.path) {
                    continue;
                }
                let store = self.store.clone();
                let resolver = self.resolver.clone();
                tasks.spawn(async move { visit_local(&store, resolver.as_ref(), policy, kind, entry) });
            }
            while let Some(joined) = tasks.join_next().await {
                joined??;
            }
        }
        Ok(())
    }

    async fn apply_remote_event(&self, event: &RemoteChangeEvent) -> Result<(), EngineError> {
        let path = match event.change_kind {
            ChangeKind::Deleted => None,
            _ => match self.local_relative(&event.full_path) {
                Some(path) if !path.is_empty() => Some(path),
                _ => {
                    debug!(remote = %event.full_path, "remote change outside pairing");
                    return Ok(());
                }
            },
        };
        if let Some(path) = &path
            && (!self.pairing.should_sync(path) || paths::is_ignored(path))
        {
            return Ok(());
        }

        // Unknown ids fall back to the path; the record then adopts the id.
        let known = self
            .store
            .get_by_remote_id(event.item_id)
            .or_else(|| path.as_deref().and_then(|path| self.store.get_by_path(path)));
        if known.as_ref().is_some_and(|item| item.has_error) {
            return Ok(());
        }

        let policy = self.pairing.conflict_policy;
        match (event.change_kind, known, path) {
            (ChangeKind::Deleted, Some(item), _) => {
                self.set_status(item.id, ItemStatus::DeletedRemote);
            }
            (ChangeKind::Deleted, None, _) => {}
            (_, None, Some(path)) => {
                let kind = item_kind(event.item_kind);
                self.store.add(|id| {
                    ItemRecord::from_remote(
                        id,
                        kind,
                        &path,
                        event.item_id,
                        event.version_tag,
                        event.timestamp,
                    )
                })?;
            }
            (ChangeKind::Renamed, Some(item), Some(path)) => {
                self.apply_remote_rename(item, &path);
            }
            (_, Some(item), _) => {
                let sentinel_present = item.kind == ItemKind::File
                    && self.local.sentinel_exists(&item.full_path()).await?;
                let version = event.version_tag.unwrap_or(NO_VERSION);
                let conflicted = self.store.with_items_mut(|set| {
                    let mut current = set.get_mut(item.id)?;
                    let status = current.reconcile_with_remote(
                        event.item_id,
                        version,
                        event.timestamp,
                        policy,
                        sentinel_present,
                    );
                    // A folder seen on both sides needs no creation.
                    if current.kind == ItemKind::Folder && status == ItemStatus::UpdatedLocal {
                        current.status = ItemStatus::Unchanged;
                    }
                    (status == ItemStatus::Conflict).then(|| current.clone())
                });
                if let Some(item) = conflicted {
                    escalate(&self.store, self.resolver.as_ref(), &item);
                }
            }
            (_, None, None) => {}
        }
        Ok(())
    }

    fn apply_remote_rename(&self, item: ItemRecord, path: &str) {
        let (_, new_name) = paths::split(path);
        if item.name == new_name {
            return;
        }
        let old_path = item.full_path();
        let new_path = paths::join(&item.parent_path, new_name);
        self.store.with_items_mut(|set| {
            if let Some(mut current) = set.get_mut(item.id) {
                current.pending_new_name = Some(new_name.to_string());
                current.status = ItemStatus::RenamedRemote;
            }
            if item.kind == ItemKind::Folder {
                cascade_rename(set, &old_path, &new_path);
            }
        });
        info!(item_id = item.id, from = %old_path, to = %new_path, "remote rename");
    }

    /// Marks unchanged items whose local entry vanished as deleted locally.
    /// A vanished folder takes its whole subtree out of the store.
    async fn sweep_missing(&self) -> Result<(), EngineError> {
        let snapshot = self.store.snapshot();
        let renamed_targets: Vec<String> = snapshot
            .iter()
            .filter(|item| item.kind == ItemKind::Folder && item.status == ItemStatus::RenamedRemote)
            .filter_map(|item| {
                item.pending_new_name
                    .as_deref()
                    .map(|name| paths::join(&item.parent_path, name))
            })
            .collect();
        let eligible = |item: &ItemRecord| {
            let path = item.full_path();
            item.status == ItemStatus::Unchanged
                && !item.has_error
                && self.pairing.should_sync(&path)
                && !renamed_targets
                    .iter()
                    .any(|target| paths::is_within(&path, target))
        };

        let mut missing_files = Vec::new();
        let mut missing_folders = Vec::new();
        for item in snapshot.iter().filter(|item| eligible(item)) {
            let path = item.full_path();
            match item.kind {
                ItemKind::File => {
                    if !self.local.file_exists(&path).await?
                        && !self.local.sentinel_exists(&path).await?
                    {
                        missing_files.push(item.id);
                    }
                }
                ItemKind::Folder => {
                    if !self.local.dir_exists(&path).await? {
                        missing_folders.push(path);
                    }
                }
            }
        }

        self.store.with_items_mut(|set| {
            for id in &missing_files {
                if let Some(mut item) = set.get_mut(*id) {
                    item.status = ItemStatus::DeletedLocal;
                }
            }
            let mut removed = HashSet::new();
            for folder in &missing_folders {
                if let Some(mut item) = set.find_by_path_mut(folder) {
                    item.status = ItemStatus::DeletedLocal;
                }
                for id in set.descendants_of(folder) {
                    if removed.insert(id) {
                        set.remove(id);
                    }
                }
            }
            if !missing_files.is_empty() || !removed.is_empty() {
                info!(
                    files = missing_files.len(),
                    folders = missing_folders.len(),
                    "local deletions detected"
                );
            }
        });
        Ok(())
    }

    fn set_status(&self, id: i64, status: ItemStatus) {
        self.store.with_items_mut(|set| {
            if let Some(mut item) = set.get_mut(id) {
                item.status = status;
            }
        });
    }
}

fn visit_local(
    store: &MetadataStore,
    resolver: &dyn ConflictResolver,
    policy: ConflictPolicy,
    kind: ItemKind,
    entry: LocalEntry,
) -> Result<(), StoreError> {
    let conflicted = store.with_items_mut(|set| -> Result<Option<ItemRecord>, StoreError> {
        if set.find_by_path(&entry.path).is_none() {
            let id = set.allocate_id();
            set.push(ItemRecord::from_local(id, kind, &entry.path, entry.modified))?;
            return Ok(None);
        }
        match set.find_by_path_mut(&entry.path) {
            None => Ok(None),
            Some(item) if item.has_error || item.kind != kind => Ok(None),
            Some(mut item) if kind == ItemKind::Folder => {
                if item.remote_id == NO_REMOTE_ID {
                    item.status = ItemStatus::UpdatedLocal;
                }
                Ok(None)
            }
            Some(mut item) => {
                let status = item.reconcile_with_local(policy, entry.modified);
                Ok((status == ItemStatus::Conflict).then(|| item.clone()))
            }
        }
    })?;
    if let Some(item) = conflicted {
        escalate(store, resolver, &item);
    }
    Ok(())
}

/// Hands a conflicting item to the resolver outside the store lock and
/// records its decision.
pub(crate) fn escalate(store: &MetadataStore, resolver: &dyn ConflictResolver, item: &ItemRecord) {
    let status = resolver.resolve(item);
    if status != ItemStatus::Conflict {
        info!(item_id = item.id, status = status.as_str(), "conflict resolved");
    }
    store.with_items_mut(|set| {
        if let Some(mut current) = set.get_mut(item.id) {
            current.status = status;
            if status != ItemStatus::Conflict {
                current.conflict = None;
            }
        }
    });
}

/// Moves the descendants of a renamed folder. A child whose new path is
/// already taken gets the error flag.
pub(crate) fn cascade_rename(set: &mut ItemSet, from: &str, to: &str) {
    for id in set.rewrite_descendants(from, to) {
        if let Some(mut child) = set.get_mut(id) {
            warn!(item_id = id, "descendant path collides after rename");
            child.set_error(format!("path collision after rename to {to}"));
        }
    }
}

fn item_kind(kind: RemoteItemKind) -> ItemKind {
    match kind {
        RemoteItemKind::File => ItemKind::File,
        RemoteItemKind::Folder => ItemKind::Folder,
    }
}
