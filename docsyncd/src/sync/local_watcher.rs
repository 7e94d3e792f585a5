use std::path::Path;
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use super::paths;

/// A local filesystem change, with paths relative to the pairing root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalEvent {
    Changed { path: String },
    Deleted { path: String },
    Renamed { from: String, to: String },
}

impl LocalEvent {
    fn target(&self) -> &str {
        match self {
            LocalEvent::Changed { path } | LocalEvent::Deleted { path } => path,
            LocalEvent::Renamed { to, .. } => to,
        }
    }
}

pub fn start_notify_watcher(
    root: &Path,
) -> notify::Result<(RecommendedWatcher, mpsc::UnboundedReceiver<LocalEvent>)> {
    let (tx, rx) = mpsc::unbounded_channel();
    let root = root.to_path_buf();
    let watch_root = root.clone();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
        if let Ok(event) = res {
            for local in map_event(&watch_root, event) {
                let _ = tx.send(local);
            }
        }
    })?;
    watcher.watch(root.as_path(), RecursiveMode::Recursive)?;
    Ok((watcher, rx))
}

fn map_event(root: &Path, event: Event) -> Vec<LocalEvent> {
    match event.kind {
        EventKind::Modify(notify::event::ModifyKind::Name(_)) => {
            if event.paths.len() >= 2
                && let (Some(from), Some(to)) = (
                    tracked_path(root, &event.paths[0]),
                    tracked_path(root, &event.paths[1]),
                )
            {
                return vec![LocalEvent::Renamed { from, to }];
            }
            Vec::new()
        }
        EventKind::Create(_) | EventKind::Modify(_) => event
            .paths
            .into_iter()
            .filter_map(|path| tracked_path(root, &path))
            .map(|path| LocalEvent::Changed { path })
            .collect(),
        EventKind::Remove(_) => event
            .paths
            .into_iter()
            .filter_map(|path| tracked_path(root, &path))
            .map(|path| LocalEvent::Deleted { path })
            .collect(),
        _ => Vec::new(),
    }
}

/// Relative path of `path`, or `None` for the root itself, the reserved
/// folder, hidden entries, sentinel markers and in-flight downloads.
fn tracked_path(root: &Path, path: &Path) -> Option<String> {
    let relative = paths::relative_to(root, path).ok()?;
    let (_, name) = paths::split(&relative);
    if relative.is_empty()
        || paths::is_ignored(&relative)
        || paths::is_sentinel(name)
        || paths::is_partial(name)
    {
        return None;
    }
    Some(relative)
}

/// Waits for the next burst of events and returns it once `quiet` has
/// passed without a new one. `None` when the watcher is gone.
pub async fn next_batch(
    rx: &mut mpsc::UnboundedReceiver<LocalEvent>,
    quiet: Duration,
) -> Option<Vec<LocalEvent>> {
    let mut batch = vec![rx.recv().await?];
    loop {
        match tokio::time::timeout(quiet, rx.recv()).await {
            Ok(Some(event)) => batch.push(event),
            Ok(None) | Err(_) => break,
        }
    }
    Some(coalesce(batch))
}

/// Keeps the last event per target path, in order of last occurrence.
/// Renames are never merged away since they carry the old path.
pub fn coalesce(events: Vec<LocalEvent>) -> Vec<LocalEvent> {
    let mut kept: Vec<LocalEvent> = Vec::with_capacity(events.len());
    for event in events {
        if !matches!(event, LocalEvent::Renamed { .. }) {
            kept.retain(|existing| {
                matches!(existing, LocalEvent::Renamed { .. }) || existing.target() != event.target()
            });
        }
        kept.push(event);
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn maps_modify_event_to_change() {
        let root = Path::new("/tmp/root");
        let event = Event {
            kind: EventKind::Modify(notify::event::ModifyKind::Data(
                notify::event::DataChange::Any,
            )),
            paths: vec![PathBuf::from("/tmp/root/Docs/A.txt")],
            attrs: Default::default(),
        };
        let mapped = map_event(root, event);
        assert_eq!(
            mapped,
            vec![LocalEvent::Changed {
                path: "Docs/A.txt".into()
            }]
        );
    }

    #[test]
    fn maps_rename_event() {
        let root = Path::new("/tmp/root");
        let event = Event {
            kind: EventKind::Modify(notify::event::ModifyKind::Name(
                notify::event::RenameMode::Both,
            )),
            paths: vec![
                PathBuf::from("/tmp/root/Docs/A.txt"),
                PathBuf::from("/tmp/root/Docs/B.txt"),
            ],
            attrs: Default::default(),
        };
        let mapped = map_event(root, event);
        assert_eq!(
            mapped,
            vec![LocalEvent::Renamed {
                from: "Docs/A.txt".into(),
                to: "Docs/B.txt".into()
            }]
        );
    }

    #[test]
    fn ignores_reserved_folder_sentinels_and_partials() {
        let root = Path::new("/tmp/root");
        let event = Event {
            kind: EventKind::Create(notify::event::CreateKind::File),
            paths: vec![
                PathBuf::from("/tmp/root/.docsync/abc.db"),
                PathBuf::from("/tmp/root/Docs/A.txt.docsync"),
                PathBuf::from("/tmp/root/Docs/.hidden"),
                PathBuf::from("/tmp/root/Docs/B.txt.partial"),
            ],
            attrs: Default::default(),
        };
        assert!(map_event(root, event).is_empty());
    }

    #[test]
    fn coalesce_keeps_last_event_per_path() {
        let events = vec![
            LocalEvent::Changed { path: "a.txt".into() },
            LocalEvent::Changed { path: "b.txt".into() },
            LocalEvent::Changed { path: "a.txt".into() },
            LocalEvent::Deleted { path: "b.txt".into() },
        ];
        assert_eq!(
            coalesce(events),
            vec![
                LocalEvent::Changed { path: "a.txt".into() },
                LocalEvent::Deleted { path: "b.txt".into() },
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn next_batch_waits_for_quiet_period() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(LocalEvent::Changed { path: "a.txt".into() }).unwrap();
        tx.send(LocalEvent::Changed { path: "a.txt".into() }).unwrap();
        tx.send(LocalEvent::Changed { path: "b.txt".into() }).unwrap();

        let batch = next_batch(&mut rx, Duration::from_secs(5)).await.unwrap();
        assert_eq!(batch.len(), 2);

        drop(tx);
        assert!(next_batch(&mut rx, Duration::from_secs(5)).await.is_none());
    }
}
