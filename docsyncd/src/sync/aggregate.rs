use std::collections::HashMap;

use docsync_core::{ChangeKind, ChangePage, RemoteChangeEvent};

/// The collapsed form of one change-feed page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregatedChanges {
    pub events: Vec<RemoteChangeEvent>,
    /// Greatest cursor token seen in the page.
    pub new_cursor: Option<String>,
    pub has_more: bool,
}

/// Collapses a page of raw remote events into one effective event per item
/// id, in order of each item's first appearance.
///
/// Per item: only updates keep the update; adds mixed with updates keep the
/// add; any delete wins over everything else; otherwise a rename is kept.
/// The kept event carries the latest name, version, timestamp and path
/// reported for the item, except for deletes which keep their own payload.
pub fn aggregate(page: ChangePage) -> AggregatedChanges {
    let new_cursor = page
        .events
        .iter()
        .filter_map(|event| event.change_token.as_deref())
        .chain(page.new_cursor.as_deref())
        .filter(|token| !token.is_empty())
        .max()
        .map(str::to_string);

    let mut order = Vec::new();
    let mut groups: HashMap<i64, Vec<RemoteChangeEvent>> = HashMap::new();
    for event in page.events {
        let group = groups.entry(event.item_id).or_insert_with(|| {
            order.push(event.item_id);
            Vec::new()
        });
        group.push(event);
    }

    let events = order
        .into_iter()
        .filter_map(|id| groups.remove(&id))
        .filter_map(collapse)
        .collect();

    AggregatedChanges {
        events,
        new_cursor,
        has_more: page.has_more,
    }
}

fn collapse(group: Vec<RemoteChangeEvent>) -> Option<RemoteChangeEvent> {
    let all = |pred: fn(ChangeKind) -> bool| group.iter().all(|event| pred(event.change_kind));
    let first_of = |kind: ChangeKind| group.iter().find(|event| event.change_kind == kind);

    let kept = if all(|kind| kind == ChangeKind::Updated) {
        first_of(ChangeKind::Updated)
    } else if all(|kind| matches!(kind, ChangeKind::Added | ChangeKind::Updated)) {
        first_of(ChangeKind::Added)
    } else if let Some(delete) = first_of(ChangeKind::Deleted) {
        return Some(delete.clone());
    } else {
        first_of(ChangeKind::Renamed)
    };
    let kept = kept?;

    let mut effective = kept.clone();
    if let Some(latest) = group.last() {
        effective.name.clone_from(&latest.name);
        effective.full_path.clone_from(&latest.full_path);
        effective.version_tag = latest.version_tag.or(effective.version_tag);
        effective.timestamp = latest.timestamp;
        effective.item_kind = latest.item_kind;
    }
    Some(effective)
}

/// Returns the cursor to store: `candidate` only when it moves past
/// `current`.
pub fn advance_cursor(current: &str, candidate: Option<&str>) -> Option<String> {
    match candidate {
        Some(next) if !next.is_empty() && (current.is_empty() || next > current) => {
            Some(next.to_string())
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docsync_core::RemoteItemKind;

    fn event(id: i64, change_kind: ChangeKind, version: i64, token: &str) -> RemoteChangeEvent {
        RemoteChangeEvent {
            item_id: id,
            change_kind,
            item_kind: RemoteItemKind::File,
            name: format!("f{id}.txt"),
            version_tag: Some(version),
            timestamp: version * 10,
            full_path: format!("Docs/f{id}.txt"),
            change_token: Some(token.to_string()),
        }
    }

    fn page(events: Vec<RemoteChangeEvent>) -> ChangePage {
        ChangePage {
            events,
            new_cursor: None,
            has_more: false,
        }
    }

    #[test]
    fn delete_dominates_add_and_update() {
        let out = aggregate(page(vec![
            event(5, ChangeKind::Added, 1, "01"),
            event(5, ChangeKind::Updated, 2, "02"),
            event(5, ChangeKind::Deleted, 2, "03"),
        ]));
        assert_eq!(out.events.len(), 1);
        assert_eq!(out.events[0].item_id, 5);
        assert_eq!(out.events[0].change_kind, ChangeKind::Deleted);
    }

    #[test]
    fn add_wins_over_update_with_latest_version() {
        let out = aggregate(page(vec![
            event(7, ChangeKind::Added, 1, "01"),
            event(7, ChangeKind::Updated, 2, "02"),
        ]));
        assert_eq!(out.events.len(), 1);
        assert_eq!(out.events[0].change_kind, ChangeKind::Added);
        assert_eq!(out.events[0].version_tag, Some(2));
    }

    #[test]
    fn only_updates_keep_update() {
        let out = aggregate(page(vec![
            event(3, ChangeKind::Updated, 4, "01"),
            event(3, ChangeKind::Updated, 5, "02"),
        ]));
        assert_eq!(out.events[0].change_kind, ChangeKind::Updated);
        assert_eq!(out.events[0].version_tag, Some(5));
    }

    #[test]
    fn rename_surfaces_when_mixed_with_edits() {
        let mut renamed = event(9, ChangeKind::Renamed, 2, "02");
        renamed.name = "new.txt".into();
        renamed.full_path = "Docs/new.txt".into();
        let out = aggregate(page(vec![
            event(9, ChangeKind::Updated, 1, "01"),
            renamed,
        ]));
        assert_eq!(out.events[0].change_kind, ChangeKind::Renamed);
        assert_eq!(out.events[0].name, "new.txt");
    }

    #[test]
    fn keeps_first_appearance_order_across_items() {
        let out = aggregate(page(vec![
            event(2, ChangeKind::Added, 1, "01"),
            event(1, ChangeKind::Added, 1, "02"),
            event(2, ChangeKind::Updated, 2, "03"),
        ]));
        let ids: Vec<_> = out.events.iter().map(|event| event.item_id).collect();
        assert_eq!(ids, vec![2, 1]);
    }

    #[test]
    fn new_cursor_is_greatest_token() {
        let mut input = page(vec![
            event(1, ChangeKind::Added, 1, "0003"),
            event(2, ChangeKind::Added, 1, "0007"),
            event(3, ChangeKind::Added, 1, "0005"),
        ]);
        input.new_cursor = Some("0006".into());
        input.has_more = true;
        let out = aggregate(input);
        assert_eq!(out.new_cursor.as_deref(), Some("0007"));
        assert!(out.has_more);
    }

    #[test]
    fn cursor_only_moves_forward() {
        assert_eq!(advance_cursor("", Some("0001")).as_deref(), Some("0001"));
        assert_eq!(advance_cursor("0005", Some("0007")).as_deref(), Some("0007"));
        assert_eq!(advance_cursor("0005", Some("0003")), None);
        assert_eq!(advance_cursor("0005", None), None);
    }
}
