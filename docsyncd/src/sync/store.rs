use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool, migrate::Migrator, sqlite::SqliteConnectOptions};
use thiserror::Error;
use tracing::debug;

use super::item::{ConflictSnapshot, ItemError, ItemKind, ItemRecord, ItemStatus};
use super::paths::{self, RESERVED_DIR};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Item(#[from] ItemError),
    #[error("an item already exists at {0}")]
    DuplicatePath(String),
    #[error("item id {0} is already in use")]
    DuplicateId(i64),
    #[error("item {0} not found")]
    MissingItem(i64),
}

/// The in-memory item collection of a store, handed to callers under the
/// store lock.
///
/// Records are keyed by id; lookups by path and remote id go through
/// indexes that every mutable accessor keeps current.
#[derive(Debug, Default)]
pub struct ItemSet {
    items: BTreeMap<i64, ItemRecord>,
    index: ItemIndex,
    next_id: i64,
}

#[derive(Debug, Default)]
struct ItemIndex {
    by_path: HashMap<String, Vec<i64>>,
    by_remote_id: HashMap<i64, Vec<i64>>,
}

impl ItemIndex {
    fn insert(&mut self, id: i64, path: String, remote_id: i64) {
        self.by_path.entry(path).or_default().push(id);
        if remote_id >= 0 {
            self.by_remote_id.entry(remote_id).or_default().push(id);
        }
    }

    fn remove(&mut self, id: i64, path: &str, remote_id: i64) {
        unlink(&mut self.by_path, path, id);
        if remote_id >= 0 {
            unlink(&mut self.by_remote_id, &remote_id, id);
        }
    }
}

fn unlink<K, Q>(map: &mut HashMap<K, Vec<i64>>, key: &Q, id: i64)
where
    K: std::borrow::Borrow<Q> + std::hash::Hash + Eq,
    Q: std::hash::Hash + Eq + ?Sized,
{
    if let Some(ids) = map.get_mut(key) {
        ids.retain(|other| *other != id);
        if ids.is_empty() {
            map.remove(key);
        }
    }
}

/// Mutable access to one record. Dropping it re-indexes the record when its
/// path or remote id changed.
pub struct ItemMut<'a> {
    item: &'a mut ItemRecord,
    index: &'a mut ItemIndex,
    path: String,
    remote_id: i64,
}

impl Deref for ItemMut<'_> {
    type Target = ItemRecord;

    fn deref(&self) -> &ItemRecord {
        self.item
    }
}

impl DerefMut for ItemMut<'_> {
    fn deref_mut(&mut self) -> &mut ItemRecord {
        self.item
    }
}

impl Drop for ItemMut<'_> {
    fn drop(&mut self) {
        let path = self.item.full_path();
        if path != self.path || self.item.remote_id != self.remote_id {
            self.index.remove(self.item.id, &self.path, self.remote_id);
            self.index.insert(self.item.id, path, self.item.remote_id);
        }
    }
}

impl ItemSet {
    fn from_records(records: Vec<ItemRecord>, next_id: i64) -> Self {
        let mut set = Self {
            next_id,
            ..Self::default()
        };
        for item in records {
            set.index.insert(item.id, item.full_path(), item.remote_id);
            set.next_id = set.next_id.max(item.id + 1);
            set.items.insert(item.id, item);
        }
        set
    }

    pub fn allocate_id(&mut self) -> i64 {
        let id = self.next_id.max(1);
        self.next_id = id + 1;
        id
    }

    pub fn push(&mut self, item: ItemRecord) -> Result<(), StoreError> {
        if self.items.contains_key(&item.id) {
            return Err(StoreError::DuplicateId(item.id));
        }
        let path = item.full_path();
        if self.index.by_path.contains_key(&path) {
            return Err(StoreError::DuplicatePath(path));
        }
        self.next_id = self.next_id.max(item.id + 1);
        self.index.insert(item.id, path, item.remote_id);
        self.items.insert(item.id, item);
        Ok(())
    }

    pub fn remove(&mut self, id: i64) -> Option<ItemRecord> {
        let item = self.items.remove(&id)?;
        self.index.remove(id, &item.full_path(), item.remote_id);
        Some(item)
    }

    pub fn get(&self, id: i64) -> Option<&ItemRecord> {
        self.items.get(&id)
    }

    pub fn get_mut(&mut self, id: i64) -> Option<ItemMut<'_>> {
        let item = self.items.get_mut(&id)?;
        Some(ItemMut {
            path: item.full_path(),
            remote_id: item.remote_id,
            item,
            index: &mut self.index,
        })
    }

    pub fn find_by_path(&self, path: &str) -> Option<&ItemRecord> {
        let id = self.index.by_path.get(path)?.first()?;
        self.items.get(id)
    }

    pub fn find_by_path_mut(&mut self, path: &str) -> Option<ItemMut<'_>> {
        let id = *self.index.by_path.get(path)?.first()?;
        self.get_mut(id)
    }

    pub fn find_by_remote_id(&self, remote_id: i64) -> Option<&ItemRecord> {
        let id = self.index.by_remote_id.get(&remote_id)?.first()?;
        self.items.get(id)
    }

    /// Records in id order.
    pub fn iter(&self) -> impl Iterator<Item = &ItemRecord> {
        self.items.values()
    }

    /// Runs `f` on every record, then rebuilds the indexes.
    pub fn update_all(&mut self, mut f: impl FnMut(&mut ItemRecord)) {
        self.items.values_mut().for_each(&mut f);
        self.index = ItemIndex::default();
        for item in self.items.values() {
            self.index.insert(item.id, item.full_path(), item.remote_id);
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Ids of every item stored strictly below `folder`.
    pub fn descendants_of(&self, folder: &str) -> Vec<i64> {
        self.items
            .values()
            .filter(|item| paths::is_within(&item.full_path(), folder))
            .map(|item| item.id)
            .collect()
    }

    /// Moves every descendant of `old_folder` below `new_folder`. Returns the
    /// ids whose new path collides with an item outside the subtree.
    pub fn rewrite_descendants(&mut self, old_folder: &str, new_folder: &str) -> Vec<i64> {
        let moved: HashSet<i64> = self.descendants_of(old_folder).into_iter().collect();
        let mut targets = Vec::with_capacity(moved.len());
        for id in &moved {
            let Some(item) = self.items.get(id) else { continue };
            let Some(parent) = paths::rebase(&item.parent_path, old_folder, new_folder) else {
                continue;
            };
            let target = paths::join(&parent, &item.name);
            let clash = self
                .index
                .by_path
                .get(&target)
                .is_some_and(|ids| ids.iter().any(|other| !moved.contains(other)));
            targets.push((*id, parent, clash));
        }

        let mut collisions = Vec::new();
        for (id, parent, clash) in targets {
            if let Some(mut item) = self.get_mut(id) {
                item.parent_path = parent;
            }
            if clash {
                collisions.push(id);
            }
        }
        collisions.sort_unstable();
        collisions
    }
}

#[derive(Debug, Default)]
struct StoreState {
    set: ItemSet,
    change_cursor: String,
}

/// Durable Item Records and change cursor for one pairing.
///
/// Records live in memory behind a coarse lock; `save` writes the whole set
/// to SQLite in one transaction.
pub struct MetadataStore {
    pool: SqlitePool,
    pairing_key: String,
    db_path: Option<PathBuf>,
    state: Mutex<StoreState>,
}

impl MetadataStore {
    pub fn from_pool(pool: SqlitePool, local_folder: &Path) -> Self {
        Self {
            pool,
            pairing_key: pairing_key(local_folder),
            db_path: None,
            state: Mutex::new(StoreState::default()),
        }
    }

    /// Opens (creating if needed) the store file inside the reserved folder
    /// of `local_folder` and loads it.
    pub async fn open(local_folder: &Path) -> Result<Self, StoreError> {
        let key = pairing_key(local_folder);
        let dir = local_folder.join(RESERVED_DIR);
        std::fs::create_dir_all(&dir)?;
        let db_path = dir.join(format!("{key}.db"));
        let options = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        let store = Self {
            pool,
            pairing_key: key,
            db_path: Some(db_path),
            state: Mutex::new(StoreState::default()),
        };
        store.init().await?;
        store.load().await?;
        Ok(store)
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub fn pairing_key(&self) -> &str {
        &self.pairing_key
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub async fn load(&self) -> Result<(), StoreError> {
        let pairing = sqlx::query("SELECT change_cursor, next_id FROM pairings WHERE pairing_key = ?1")
            .bind(&self.pairing_key)
            .fetch_optional(&self.pool)
            .await?;
        let (change_cursor, next_id): (String, i64) = match pairing {
            Some(row) => (row.try_get("change_cursor")?, row.try_get("next_id")?),
            None => (String::new(), 1),
        };

        let rows = sqlx::query(
            "SELECT id, remote_id, version_tag, parent_path, name, last_modified, kind, status,
                    has_error, last_error, pending_new_name, conflict_local, conflict_remote, deferred_status
             FROM items
             WHERE pairing_key = ?1
             ORDER BY id ASC",
        )
        .bind(&self.pairing_key)
        .fetch_all(&self.pool)
        .await?;

        let mut items = Vec::with_capacity(rows.len());
        for row in rows {
            let kind: String = row.try_get("kind")?;
            let status: String = row.try_get("status")?;
            let has_error: i64 = row.try_get("has_error")?;
            let deferred: Option<String> = row.try_get("deferred_status")?;
            let conflict_local: Option<i64> = row.try_get("conflict_local")?;
            let conflict_remote: Option<i64> = row.try_get("conflict_remote")?;
            items.push(ItemRecord {
                id: row.try_get("id")?,
                remote_id: row.try_get("remote_id")?,
                version_tag: row.try_get("version_tag")?,
                parent_path: row.try_get("parent_path")?,
                name: row.try_get("name")?,
                last_modified: row.try_get("last_modified")?,
                kind: ItemKind::parse(&kind)?,
                status: ItemStatus::parse(&status)?,
                has_error: has_error != 0,
                last_error: row.try_get("last_error")?,
                pending_new_name: row.try_get("pending_new_name")?,
                conflict: conflict_local.zip(conflict_remote).map(
                    |(local_timestamp, remote_timestamp)| ConflictSnapshot {
                        local_timestamp,
                        remote_timestamp,
                    },
                ),
                deferred: deferred.as_deref().map(ItemStatus::parse).transpose()?,
            });
        }

        debug!(pairing = %self.pairing_key, items = items.len(), "loaded metadata store");
        let mut state = self.lock();
        state.set = ItemSet::from_records(items, next_id);
        state.change_cursor = change_cursor;
        Ok(())
    }

    pub async fn save(&self) -> Result<(), StoreError> {
        let (items, change_cursor, next_id) = {
            let state = self.lock();
            (
                state.set.items.values().cloned().collect::<Vec<_>>(),
                state.change_cursor.clone(),
                state.set.next_id.max(1),
            )
        };

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO pairings (pairing_key, change_cursor, next_id) VALUES (?1, ?2, ?3)
             ON CONFLICT(pairing_key) DO UPDATE SET
                change_cursor = excluded.change_cursor,
                next_id = excluded.next_id",
        )
        .bind(&self.pairing_key)
        .bind(&change_cursor)
        .bind(next_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM items WHERE pairing_key = ?1")
            .bind(&self.pairing_key)
            .execute(&mut *tx)
            .await?;
        for item in &items {
            sqlx::query(
                "INSERT INTO items (
                    pairing_key, id, remote_id, version_tag, parent_path, name, last_modified,
                    kind, status, has_error, last_error, pending_new_name,
                    conflict_local, conflict_remote, deferred_status
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            )
            .bind(&self.pairing_key)
            .bind(item.id)
            .bind(item.remote_id)
            .bind(item.version_tag)
            .bind(&item.parent_path)
            .bind(&item.name)
            .bind(item.last_modified)
            .bind(item.kind.as_str())
            .bind(item.status.as_str())
            .bind(if item.has_error { 1 } else { 0 })
            .bind(&item.last_error)
            .bind(&item.pending_new_name)
            .bind(item.conflict.map(|c| c.local_timestamp))
            .bind(item.conflict.map(|c| c.remote_timestamp))
            .bind(item.deferred.as_ref().map(ItemStatus::as_str))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        debug!(pairing = %self.pairing_key, items = items.len(), "saved metadata store");
        Ok(())
    }

    /// Deletes every persisted trace of this pairing, including the store
    /// file when it was opened from disk. The store is unusable afterwards.
    pub async fn purge(&self) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM items WHERE pairing_key = ?1")
            .bind(&self.pairing_key)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM pairings WHERE pairing_key = ?1")
            .bind(&self.pairing_key)
            .execute(&self.pool)
            .await?;
        *self.lock() = StoreState::default();
        if let Some(path) = &self.db_path {
            self.pool.close().await;
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    /// Assigns a fresh id to the record built by `build` and inserts it.
    pub fn add(&self, build: impl FnOnce(i64) -> ItemRecord) -> Result<ItemRecord, StoreError> {
        let mut state = self.lock();
        let id = state.set.allocate_id();
        let item = build(id);
        state.set.push(item.clone())?;
        Ok(item)
    }

    pub fn delete(&self, id: i64) -> Option<ItemRecord> {
        self.lock().set.remove(id)
    }

    /// Replaces the stored record with the same id.
    pub fn update(&self, item: ItemRecord) -> Result<(), StoreError> {
        let mut state = self.lock();
        let mut slot = state
            .set
            .get_mut(item.id)
            .ok_or(StoreError::MissingItem(item.id))?;
        *slot = item;
        Ok(())
    }

    pub fn get_by_id(&self, id: i64) -> Option<ItemRecord> {
        self.lock().set.get(id).cloned()
    }

    pub fn get_by_path(&self, path: &str) -> Option<ItemRecord> {
        let path = paths::normalize(path).ok()?;
        self.lock().set.find_by_path(&path).cloned()
    }

    pub fn get_by_remote_id(&self, remote_id: i64) -> Option<ItemRecord> {
        self.lock().set.find_by_remote_id(remote_id).cloned()
    }

    /// Independent copies of every record, taken under the store lock.
    pub fn snapshot(&self) -> Vec<ItemRecord> {
        self.lock().set.items.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().set.is_empty()
    }

    pub fn change_cursor(&self) -> String {
        self.lock().change_cursor.clone()
    }

    pub fn set_change_cursor(&self, cursor: impl Into<String>) {
        self.lock().change_cursor = cursor.into();
    }

    /// Runs `f` with exclusive access to the item collection.
    pub(crate) fn with_items_mut<R>(&self, f: impl FnOnce(&mut ItemSet) -> R) -> R {
        f(&mut self.lock().set)
    }
}

/// Stable key of a pairing: hex SHA-256 of its local folder path.
pub fn pairing_key(local_folder: &Path) -> String {
    let digest = Sha256::digest(local_folder.to_string_lossy().as_bytes());
    digest.iter().map(|byte| format!("{byte:02x}")).collect()
}
