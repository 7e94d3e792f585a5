use super::item::{ItemRecord, ItemStatus};

/// Decides how a raised conflict proceeds. Called synchronously from the
/// reconcile phase with a copy of the conflicting record; the returned
/// status replaces `Conflict`.
pub trait ConflictResolver: Send + Sync {
    fn resolve(&self, item: &ItemRecord) -> ItemStatus;
}

/// Leaves every conflict in place for the apply phase to keep both copies.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeepConflict;

impl ConflictResolver for KeepConflict {
    fn resolve(&self, _item: &ItemRecord) -> ItemStatus {
        ItemStatus::Conflict
    }
}

impl<F> ConflictResolver for F
where
    F: Fn(&ItemRecord) -> ItemStatus + Send + Sync,
{
    fn resolve(&self, item: &ItemRecord) -> ItemStatus {
        self(item)
    }
}

/// Name for the preserved local copy of a conflicting file, e.g.
/// `Docs/A (conflict 1700000000000).txt`.
pub fn conflict_path(path: &str, stamp: i64) -> String {
    let (dir, name) = match path.rsplit_once('/') {
        Some((dir, name)) => (format!("{dir}/"), name),
        None => (String::new(), path),
    };

    if let Some((stem, ext)) = name.rsplit_once('.')
        && !stem.is_empty()
    {
        return format!("{dir}{stem} (conflict {stamp}).{ext}");
    }

    format!("{dir}{name} (conflict {stamp})")
}
