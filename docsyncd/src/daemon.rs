use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use docsync_core::LibraryClient;
use tokio::task::JoinHandle;
use tracing::{Instrument, error, info, info_span, warn};

use crate::config::{DaemonConfig, PairingConfig, load_pairings};
use crate::sync::backoff::{FailureClass, RetryPolicy};
use crate::sync::engine::{SyncEngine, SyncOptions};
use crate::sync::local_watcher::{next_batch, start_notify_watcher};
use crate::sync::registry::SyncRegistry;

const RETRY_BASE: Duration = Duration::from_secs(10);

type Engine = Arc<SyncEngine<LibraryClient>>;

pub struct DaemonRuntime {
    config: DaemonConfig,
    registry: SyncRegistry<LibraryClient>,
}

impl DaemonRuntime {
    pub async fn bootstrap(config: DaemonConfig) -> anyhow::Result<Self> {
        let pairings = load_pairings(&config.pairings_path)
            .with_context(|| format!("failed to load pairings from {}", config.pairings_path.display()))?;
        if pairings.is_empty() {
            warn!(path = %config.pairings_path.display(), "no pairings configured");
        }
        let token = config
            .token
            .clone()
            .context("DOCSYNC_TOKEN is not set")?;

        let registry = SyncRegistry::new();
        for pairing in &pairings {
            tokio::fs::create_dir_all(&pairing.local_folder)
                .await
                .with_context(|| format!("failed to create {}", pairing.local_folder.display()))?;
            registry
                .get_or_create(pairing, |pairing| {
                    LibraryClient::new(&pairing.library_url, token.clone())
                })
                .await
                .with_context(|| format!("failed to open pairing {}", pairing.name))?;
        }

        Ok(Self { config, registry })
    }

    /// Synchronizes every pairing once. Fails if any pairing failed.
    pub async fn sync_once(&self) -> anyhow::Result<()> {
        let mut failed = Vec::new();
        for engine in self.registry.engines().await {
            let name = engine.pairing().name.clone();
            match engine.synchronize(SyncOptions::default()).await {
                Ok(outcome) => info!(pairing = %name, changed = outcome.changed, runs = outcome.runs, "pairing synchronized"),
                Err(err) => {
                    error!(pairing = %name, auth = err.is_auth(), error = %err, "pairing failed");
                    failed.push(name);
                }
            }
        }
        if !failed.is_empty() {
            anyhow::bail!("synchronization failed for: {}", failed.join(", "));
        }
        Ok(())
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let engines = self.registry.engines().await;
        info!(
            pairings = engines.len(),
            poll_secs = self.config.poll_interval.as_secs(),
            local_watcher = self.config.enable_local_watcher,
            "daemon started"
        );

        let mut handles: Vec<JoinHandle<()>> = Vec::new();
        for engine in engines {
            let span = info_span!("pairing", name = %engine.pairing().name);
            handles.push(tokio::spawn(
                poll_loop(Arc::clone(&engine), self.config.poll_interval).instrument(span.clone()),
            ));
            if self.config.enable_local_watcher {
                handles.push(tokio::spawn(
                    watch_loop(engine, self.config.debounce).instrument(span),
                ));
            }
        }

        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for shutdown signal")?;
        info!("shutting down");
        for handle in handles {
            handle.abort();
        }
        Ok(())
    }
}

async fn poll_loop(engine: Engine, interval: Duration) {
    let policy = RetryPolicy::new(RETRY_BASE, interval.max(RETRY_BASE));
    let mut failures = 0u32;
    loop {
        let failed = match engine.synchronize(SyncOptions::default()).await {
            Ok(outcome) => {
                failures = 0;
                if outcome.changed > 0 {
                    info!(changed = outcome.changed, runs = outcome.runs, "remote poll applied changes");
                }
                None
            }
            Err(err) if err.is_auth() => {
                failures += 1;
                error!(error = %err, "authentication failed; check DOCSYNC_TOKEN");
                Some(err.failure_class())
            }
            Err(err) => {
                failures += 1;
                let class = err.failure_class();
                warn!(failures, ?class, error = %err, "sync run failed");
                Some(class)
            }
        };
        tokio::time::sleep(next_poll_delay(&policy, failed, failures, interval)).await;
    }
}

fn next_poll_delay(
    policy: &RetryPolicy,
    failed: Option<FailureClass>,
    failures: u32,
    interval: Duration,
) -> Duration {
    match failed {
        None => interval,
        Some(class) => policy.delay(class, failures),
    }
}

async fn watch_loop(engine: Engine, debounce: Duration) {
    let pairing: &PairingConfig = engine.pairing();
    let (_watcher, mut rx) = match start_notify_watcher(&pairing.local_folder) {
        Ok(started) => started,
        Err(err) => {
            warn!(folder = %pairing.local_folder.display(), error = %err, "failed to start local watcher");
            return;
        }
    };
    while let Some(batch) = next_batch(&mut rx, debounce).await {
        for event in batch {
            if let Err(err) = engine.ingest_local_change(event.clone()).await {
                warn!(?event, auth = err.is_auth(), error = %err, "local change not applied");
            }
        }
    }
}
