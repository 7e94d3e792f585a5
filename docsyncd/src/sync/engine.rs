use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use docsync_core::{ApiErrorClass, LibraryError, RemoteLibrary};
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tracing::{Instrument, debug, info, info_span, warn};

use crate::config::PairingConfig;

use super::backoff::FailureClass;
use super::conflict::{ConflictResolver, KeepConflict};
use super::item::{ItemKind, ItemRecord, ItemStatus};
use super::local::{LocalFsError, LocalTree};
use super::local_watcher::LocalEvent;
use super::paths::{self, PathError};
use super::store::{MetadataStore, StoreError};

/// Follow-up runs performed by one `synchronize` call when the change feed
/// reports more pending pages.
const MAX_FOLLOW_UP_RUNS: u32 = 8;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("remote error: {0}")]
    Remote(#[from] LibraryError),
    #[error("transfer of {path} failed: {source}")]
    Transfer {
        path: String,
        #[source]
        source: LibraryError,
    },
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("local filesystem error: {0}")]
    Local(#[from] LocalFsError),
    #[error(transparent)]
    Path(#[from] PathError),
    #[error("scan task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("no item is stored at {0}")]
    UnknownItem(String),
    #[error("{0} has no deferred download")]
    NotDeferred(String),
}

impl EngineError {
    /// Authentication-class failures; callers should refresh credentials.
    pub fn is_auth(&self) -> bool {
        match self {
            EngineError::Remote(err) | EngineError::Transfer { source: err, .. } => err.is_auth(),
            _ => false,
        }
    }

    /// How the daemon should pace retries after this error ended a run.
    pub fn failure_class(&self) -> FailureClass {
        match self {
            EngineError::Remote(err) | EngineError::Transfer { source: err, .. } => {
                match err.classification() {
                    Some(ApiErrorClass::Auth | ApiErrorClass::Permanent) => FailureClass::Operator,
                    Some(ApiErrorClass::RateLimit | ApiErrorClass::Transient) => FailureClass::Service,
                    None if err.local_io().is_some() => FailureClass::Local,
                    None => FailureClass::Service,
                }
            }
            _ => FailureClass::Local,
        }
    }

    pub(crate) fn is_locked(&self) -> bool {
        match self {
            EngineError::Local(err) => err.is_locked(),
            EngineError::Remote(err) | EngineError::Transfer { source: err, .. } => err
                .local_io()
                .is_some_and(super::local::is_lock_error),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressStatus {
    Idle,
    Analyzing,
    Analyzed,
    Running,
    Conflict,
    Error,
    Completed,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventScope {
    Run,
    Item { kind: ItemKind, item_id: i64 },
}

/// Progress notification; events of one run arrive in emission order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncEvent {
    pub run_id: u64,
    pub scope: EventScope,
    pub percent: u8,
    pub status: ProgressStatus,
    pub message: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncOptions {
    /// Analyze only: nothing is applied and the store is left as it was.
    pub review_only: bool,
    pub rescan_local: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            review_only: false,
            rescan_local: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncOutcome {
    pub run_id: u64,
    /// Items found changed, summed over follow-up runs.
    pub changed: usize,
    pub runs: u32,
    /// Every item after the last run; for review-only runs, the analyzed
    /// state that was not applied.
    pub items: Vec<ItemRecord>,
}

struct RunReport {
    changed: usize,
    more_pending: bool,
    items: Vec<ItemRecord>,
}

/// Sync orchestrator for one pairing.
pub struct SyncEngine<L> {
    pub(crate) remote: L,
    pub(crate) store: Arc<MetadataStore>,
    pub(crate) local: LocalTree,
    pub(crate) pairing: PairingConfig,
    pub(crate) resolver: Arc<dyn ConflictResolver>,
    events: Option<mpsc::UnboundedSender<SyncEvent>>,
    run_lock: Mutex<()>,
    next_run: AtomicU64,
}

impl<L: RemoteLibrary> SyncEngine<L> {
    pub fn new(remote: L, store: MetadataStore, pairing: PairingConfig) -> Self {
        let local = LocalTree::new(pairing.local_folder.clone(), pairing.trash);
        Self {
            remote,
            store: Arc::new(store),
            local,
            pairing,
            resolver: Arc::new(KeepConflict),
            events: None,
            run_lock: Mutex::new(()),
            next_run: AtomicU64::new(0),
        }
    }

    pub fn with_resolver(mut self, resolver: impl ConflictResolver + 'static) -> Self {
        self.resolver = Arc::new(resolver);
        self
    }

    pub fn with_events(mut self, events: mpsc::UnboundedSender<SyncEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn pairing(&self) -> &PairingConfig {
        &self.pairing
    }

    pub fn remote(&self) -> &L {
        &self.remote
    }

    pub fn store(&self) -> &MetadataStore {
        &self.store
    }

    /// Copies of every item; safe to call while a run is in flight.
    pub fn snapshot(&self) -> Vec<ItemRecord> {
        self.store.snapshot()
    }

    pub fn errors(&self) -> Vec<ItemRecord> {
        self.store
            .snapshot()
            .into_iter()
            .filter(|item| item.has_error)
            .collect()
    }

    /// Runs reconcile then apply, repeating while the change feed reports
    /// more pending changes. Runs of one engine never overlap.
    pub async fn synchronize(&self, options: SyncOptions) -> Result<SyncOutcome, EngineError> {
        let _guard = self.run_lock.lock().await;
        let mut changed = 0;
        let mut runs = 0;
        loop {
            let run_id = self.next_run.fetch_add(1, Ordering::Relaxed) + 1;
            let span = info_span!("sync_run", run_id, pairing = %self.pairing.name);
            let report = self
                .run_once(run_id, options)
                .instrument(span)
                .await
                .inspect_err(|err| {
                    self.emit_run(run_id, 100, ProgressStatus::Error, "An error has occurred", Some(err));
                })?;
            runs += 1;
            changed += report.changed;
            if report.more_pending && runs <= MAX_FOLLOW_UP_RUNS {
                info!(run_id, "remote feed has more changes; running again");
                continue;
            }
            return Ok(SyncOutcome {
                run_id,
                changed,
                runs,
                items: report.items,
            });
        }
    }

    async fn run_once(&self, run_id: u64, options: SyncOptions) -> Result<RunReport, EngineError> {
        self.emit_run(run_id, 0, ProgressStatus::Analyzing, "Analyzing changes", None);
        let analysis = self.reconcile(options).await?;
        self.emit_run(
            run_id,
            10,
            ProgressStatus::Analyzed,
            format!("Found {} modified items", analysis.changed),
            None,
        );

        let items = if options.review_only {
            let items = self.store.snapshot();
            self.store.load().await?;
            items
        } else {
            if analysis.changed > 0 {
                self.apply(run_id).await?;
            }
            self.store.snapshot()
        };

        self.emit_run(run_id, 100, ProgressStatus::Completed, "Completed", None);
        Ok(RunReport {
            changed: analysis.changed,
            more_pending: analysis.more_pending && !options.review_only,
            items,
        })
    }

    /// Folds one local watcher event into the store and applies the result.
    pub async fn ingest_local_change(&self, event: LocalEvent) -> Result<(), EngineError> {
        let _guard = self.run_lock.lock().await;
        let run_id = self.next_run.fetch_add(1, Ordering::Relaxed) + 1;
        let span = info_span!("sync_run", run_id, pairing = %self.pairing.name);
        self.ingest_once(run_id, event)
            .instrument(span)
            .await
            .inspect_err(|err| {
                self.emit_run(run_id, 100, ProgressStatus::Error, "An error has occurred", Some(err));
            })
    }

    async fn ingest_once(&self, run_id: u64, event: LocalEvent) -> Result<(), EngineError> {
        if !self.pairing.direction.to_remote() {
            return Ok(());
        }
        self.emit_run(run_id, 0, ProgressStatus::Analyzing, "Processing local change", None);
        if !self.record_local_change(event).await? {
            self.emit_run(run_id, 100, ProgressStatus::Completed, "Nothing to do", None);
            return Ok(());
        }
        self.record_intents();
        self.store.save().await?;
        self.apply(run_id).await?;
        self.emit_run(run_id, 100, ProgressStatus::Completed, "Completed", None);
        Ok(())
    }

    /// Returns whether the store changed.
    async fn record_local_change(&self, event: LocalEvent) -> Result<bool, EngineError> {
        let (path, previous) = match event {
            LocalEvent::Changed { path } => (path, None),
            LocalEvent::Deleted { path } => {
                let path = paths::normalize(&path)?;
                if !self.tracks_local_path(&path) {
                    return Ok(false);
                }
                let marked = self.store.with_items_mut(|set| {
                    match set.find_by_path_mut(&path) {
                        Some(mut item) if !item.has_error => {
                            item.status = ItemStatus::DeletedLocal;
                            true
                        }
                        _ => false,
                    }
                });
                return Ok(marked);
            }
            LocalEvent::Renamed { from, to } => (to, Some(from)),
        };

        let path = paths::normalize(&path)?;
        if !self.tracks_local_path(&path) {
            return Ok(false);
        }
        let local_path = self.local.path_of(&path)?;
        let meta = match tokio::fs::metadata(&local_path).await {
            Ok(meta) => meta,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(LocalFsError::from(err).into()),
        };
        let kind = if meta.is_dir() {
            ItemKind::Folder
        } else {
            ItemKind::File
        };
        let modified = super::local::unix_millis(meta.modified().map_err(LocalFsError::from)?);

        if let Some(from) = previous {
            let from = paths::normalize(&from)?;
            if let Some(changed) = self.record_local_rename(&from, &path, kind, modified)? {
                return Ok(changed);
            }
        }

        let policy = self.pairing.conflict_policy;
        let conflicted = self.store.with_items_mut(|set| -> Result<Option<ItemRecord>, StoreError> {
            if set.find_by_path(&path).is_none() {
                let id = set.allocate_id();
                set.push(ItemRecord::from_local(id, kind, &path, modified))?;
                return Ok(None);
            }
            match set.find_by_path_mut(&path) {
                Some(mut item) if !item.has_error => {
                    let status = item.reconcile_with_local(policy, modified);
                    Ok((status == ItemStatus::Conflict).then(|| item.clone()))
                }
                _ => Ok(None),
            }
        })?;
        if let Some(item) = conflicted {
            super::engine_reconcile::escalate(&self.store, self.resolver.as_ref(), &item);
        }
        Ok(true)
    }

    /// `None` when `from` is unknown and the event should be treated as a
    /// plain change at `to`.
    fn record_local_rename(
        &self,
        from: &str,
        to: &str,
        kind: ItemKind,
        modified: i64,
    ) -> Result<Option<bool>, EngineError> {
        let (from_parent, _) = paths::split(from);
        let (to_parent, to_name) = paths::split(to);
        self.store
            .with_items_mut(|set| -> Result<Option<bool>, StoreError> {
                let Some((id, item_kind, has_error)) = set
                    .find_by_path(from)
                    .map(|item| (item.id, item.kind, item.has_error))
                else {
                    return Ok(None);
                };
                if has_error {
                    return Ok(Some(false));
                }
                if from_parent == to_parent {
                    if let Some(mut item) = set.get_mut(id) {
                        item.pending_new_name = Some(to_name.to_string());
                        item.status = ItemStatus::RenamedLocal;
                    }
                    if item_kind == ItemKind::Folder {
                        super::engine_reconcile::cascade_rename(set, from, to);
                    }
                    return Ok(Some(true));
                }
                // Moved across folders: retire the old record, start a new one.
                if let Some(mut item) = set.get_mut(id) {
                    item.status = ItemStatus::DeletedLocal;
                }
                let id = set.allocate_id();
                set.push(ItemRecord::from_local(id, kind, to, modified))?;
                Ok(Some(true))
            })
            .map_err(EngineError::from)
    }

    fn tracks_local_path(&self, relative: &str) -> bool {
        let (_, name) = paths::split(relative);
        !relative.is_empty()
            && !paths::is_ignored(relative)
            && !paths::is_sentinel(name)
            && !paths::is_partial(name)
            && self.pairing.should_sync(relative)
    }

    /// Replaces the sentinel marker at `relative` with the remote content.
    pub async fn download_deferred(&self, relative: &str) -> Result<ItemRecord, EngineError> {
        let _guard = self.run_lock.lock().await;
        let relative = paths::normalize(relative)?;
        let mut item = self
            .store
            .get_by_path(&relative)
            .filter(|item| item.kind == ItemKind::File)
            .ok_or_else(|| EngineError::UnknownItem(relative.clone()))?;
        if !self.local.sentinel_exists(&relative).await? {
            return Err(EngineError::NotDeferred(relative));
        }

        let remote_path = self.remote_path(&relative);
        let target_dir = self.local.path_of(&item.parent_path)?;
        let stamp = self
            .remote
            .download_file(&remote_path, &target_dir)
            .await
            .map_err(|source| EngineError::Transfer {
                path: relative.clone(),
                source,
            })?;
        self.local.remove_sentinel(&relative).await?;
        item.last_modified = stamp;
        item.status = ItemStatus::Unchanged;
        self.store.update(item.clone())?;
        self.store.save().await?;
        info!(path = %relative, "materialized deferred download");
        Ok(item)
    }

    /// Waits for any run in flight, then deletes the pairing's persisted state.
    pub async fn purge(&self) -> Result<(), EngineError> {
        let _guard = self.run_lock.lock().await;
        self.store.purge().await?;
        info!(pairing = %self.pairing.name, "purged pairing state");
        Ok(())
    }

    /// Forgets the change cursor so the next run lists the whole library.
    pub async fn reset_cursor(&self) -> Result<(), EngineError> {
        let _guard = self.run_lock.lock().await;
        self.store.set_change_cursor("");
        self.store.save().await?;
        Ok(())
    }

    /// Clears every sticky error flag once no run is in flight. Returns how
    /// many were cleared.
    pub async fn clear_errors(&self) -> Result<usize, EngineError> {
        let _guard = self.run_lock.lock().await;
        let cleared = self.store.with_items_mut(|set| {
            let mut cleared = 0;
            set.update_all(|item| {
                if item.has_error {
                    item.clear_error();
                    cleared += 1;
                }
            });
            cleared
        });
        if cleared > 0 {
            self.store.save().await?;
        }
        Ok(cleared)
    }

    pub async fn clear_error(&self, id: i64) -> Result<bool, EngineError> {
        let _guard = self.run_lock.lock().await;
        let cleared = self.store.with_items_mut(|set| match set.get_mut(id) {
            Some(mut item) if item.has_error => {
                item.clear_error();
                true
            }
            _ => false,
        });
        if cleared {
            self.store.save().await?;
        }
        Ok(cleared)
    }

    /// Library path of a path relative to the pairing root.
    pub(crate) fn remote_path(&self, relative: &str) -> String {
        let root = self.pairing.remote_root.trim_matches('/');
        if relative.is_empty() {
            return root.to_string();
        }
        paths::join(root, relative)
    }

    /// Pairing-relative path of a library path, `None` outside the pairing.
    pub(crate) fn local_relative(&self, remote: &str) -> Option<String> {
        let remote = paths::normalize(remote).ok()?;
        let root = self.pairing.remote_root.trim_matches('/');
        if root.is_empty() {
            return Some(remote);
        }
        paths::rebase(&remote, root, "")
    }

    pub(crate) fn emit_run(
        &self,
        run_id: u64,
        percent: u8,
        status: ProgressStatus,
        message: impl Into<String>,
        error: Option<&EngineError>,
    ) {
        let message = message.into();
        match (status, error) {
            (_, Some(err)) => warn!(run_id, percent, ?status, %message, error = %err, "sync progress"),
            _ => info!(run_id, percent, ?status, %message, "sync progress"),
        }
        self.send(SyncEvent {
            run_id,
            scope: EventScope::Run,
            percent,
            status,
            message,
            error: error.map(ToString::to_string),
        });
    }

    pub(crate) fn emit_item(
        &self,
        run_id: u64,
        item: &ItemRecord,
        percent: u8,
        status: ProgressStatus,
        message: impl Into<String>,
        error: Option<&EngineError>,
    ) {
        let message = message.into();
        match status {
            ProgressStatus::Error | ProgressStatus::Warning | ProgressStatus::Conflict => warn!(
                run_id,
                item_id = item.id,
                path = %item.full_path(),
                ?status,
                %message,
                error = ?error.map(ToString::to_string),
                "item progress"
            ),
            _ => debug!(run_id, item_id = item.id, ?status, %message, "item progress"),
        }
        self.send(SyncEvent {
            run_id,
            scope: EventScope::Item {
                kind: item.kind,
                item_id: item.id,
            },
            percent,
            status,
            message,
            error: error.map(ToString::to_string),
        });
    }

    fn send(&self, event: SyncEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
