use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use docsync_core::{LibraryError, RemoteLibrary};
use tokio::sync::{Mutex, mpsc};
use tracing::info;

use crate::config::PairingConfig;

use super::engine::{EngineError, SyncEngine, SyncEvent};
use super::store::{self, MetadataStore};

/// Owns the single engine of every active pairing, keyed by pairing key.
pub struct SyncRegistry<L> {
    engines: Mutex<HashMap<String, Arc<SyncEngine<L>>>>,
    events: Option<mpsc::UnboundedSender<SyncEvent>>,
}

impl<L: RemoteLibrary> Default for SyncRegistry<L> {
    fn default() -> Self {
        Self::new()
    }
}

impl<L: RemoteLibrary> SyncRegistry<L> {
    pub fn new() -> Self {
        Self {
            engines: Mutex::new(HashMap::new()),
            events: None,
        }
    }

    /// Every engine created from now on reports progress to `events`.
    pub fn with_events(mut self, events: mpsc::UnboundedSender<SyncEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Returns the engine of `pairing`, opening its store and connecting its
    /// remote on first use.
    pub async fn get_or_create<F>(
        &self,
        pairing: &PairingConfig,
        connect: F,
    ) -> Result<Arc<SyncEngine<L>>, EngineError>
    where
        F: FnOnce(&PairingConfig) -> Result<L, LibraryError>,
    {
        let key = store::pairing_key(&pairing.local_folder);
        let mut engines = self.engines.lock().await;
        if let Some(engine) = engines.get(&key) {
            return Ok(Arc::clone(engine));
        }

        let store = MetadataStore::open(&pairing.local_folder).await?;
        let remote = connect(pairing)?;
        let mut engine = SyncEngine::new(remote, store, pairing.clone());
        if let Some(events) = &self.events {
            engine = engine.with_events(events.clone());
        }
        let engine = Arc::new(engine);
        engines.insert(key, Arc::clone(&engine));
        info!(pairing = %pairing.name, folder = %pairing.local_folder.display(), "registered pairing");
        Ok(engine)
    }

    /// Registers a pairing that was (re)configured by the user: its change
    /// cursor is cleared so the first run does a full resync.
    pub async fn add<F>(&self, pairing: &PairingConfig, connect: F) -> Result<Arc<SyncEngine<L>>, EngineError>
    where
        F: FnOnce(&PairingConfig) -> Result<L, LibraryError>,
    {
        let engine = self.get_or_create(pairing, connect).await?;
        engine.reset_cursor().await?;
        Ok(engine)
    }

    pub async fn get(&self, local_folder: &Path) -> Option<Arc<SyncEngine<L>>> {
        let key = store::pairing_key(local_folder);
        self.engines.lock().await.get(&key).cloned()
    }

    pub async fn engines(&self) -> Vec<Arc<SyncEngine<L>>> {
        self.engines.lock().await.values().cloned().collect()
    }

    /// Tears a pairing down and deletes its persisted state. Returns false
    /// when the pairing was not registered.
    pub async fn remove(&self, local_folder: &Path) -> Result<bool, EngineError> {
        let key = store::pairing_key(local_folder);
        let Some(engine) = self.engines.lock().await.remove(&key) else {
            return Ok(false);
        };
        engine.purge().await?;
        info!(pairing = %engine.pairing().name, "removed pairing");
        Ok(true)
    }
}
