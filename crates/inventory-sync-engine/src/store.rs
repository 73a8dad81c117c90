//! In-memory Item Store keyed by `(source, local_id)`.
//!
//! Every mutation carries a `version`; a write whose version is not newer than
//! the stored one is ignored. Deletions leave a versioned tombstone so an older
//! write replayed later cannot resurrect the item.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use inventory_sync_core::{
    cell, ChangeEvent, ChangePayload, EventOrigin, Fields, Item, ItemKey, Version,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::broadcast::Broadcaster;

/// Provenance of a store write.
#[derive(Debug, Clone, Copy)]
pub struct Stamp {
    pub version: Version,
    pub origin: EventOrigin,
    pub batch_id: Option<Uuid>,
}

impl Stamp {
    pub fn new(version: Version, origin: EventOrigin) -> Self {
        Self {
            version,
            origin,
            batch_id: None,
        }
    }

    pub fn of(event: &ChangeEvent) -> Self {
        Self {
            version: event.version,
            origin: event.origin,
            batch_id: event.batch_id,
        }
    }

    fn event(&self, payload: ChangePayload) -> ChangeEvent {
        let event = ChangeEvent::new(payload, self.origin, self.version);
        match self.batch_id {
            Some(id) => event.with_batch(id),
            None => event,
        }
    }
}

/// What a store write did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    /// Content changed; a ChangeEvent was broadcast
    Applied,
    /// Newer version but identical content; version advanced silently
    Unchanged,
    /// Stored version was not older
    Ignored,
}

#[derive(Debug)]
enum Slot {
    Live(Item),
    Tombstone,
}

#[derive(Debug)]
struct StoreEntry {
    slot: Slot,
    version: Version,
    revisions: u64,
}

/// Filter for `ItemStore::list`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ItemFilter {
    pub source: Option<String>,
    /// Case-insensitive substring match over all field values
    #[serde(rename = "q")]
    pub text: Option<String>,
}

impl ItemFilter {
    fn matches(&self, item: &Item) -> bool {
        if let Some(source) = &self.source {
            if &item.key.source != source {
                return false;
            }
        }
        if let Some(text) = &self.text {
            let needle = text.to_lowercase();
            return item
                .fields
                .values()
                .any(|v| v.to_lowercase().contains(&needle));
        }
        true
    }
}

pub struct ItemStore {
    entries: DashMap<ItemKey, StoreEntry>,
    broadcaster: Arc<Broadcaster>,
    revisions: AtomicU64,
}

impl ItemStore {
    pub fn new(broadcaster: Arc<Broadcaster>) -> Self {
        Self {
            entries: DashMap::new(),
            broadcaster,
            revisions: AtomicU64::new(0),
        }
    }

    pub fn get(&self, key: &ItemKey) -> Option<Item> {
        self.entries.get(key).and_then(|e| match &e.slot {
            Slot::Live(item) => Some(item.clone()),
            Slot::Tombstone => None,
        })
    }

    pub fn contains(&self, key: &ItemKey) -> bool {
        self.get(key).is_some()
    }

    /// Stored version for `key`, including tombstones.
    pub fn version_of(&self, key: &ItemKey) -> Option<Version> {
        self.entries.get(key).map(|e| e.version)
    }

    /// Number of effective content changes applied to `key`.
    pub fn revisions(&self, key: &ItemKey) -> u64 {
        self.entries.get(key).map(|e| e.revisions).unwrap_or(0)
    }

    /// Number of effective content changes across the whole store.
    pub fn total_revisions(&self) -> u64 {
        self.revisions.load(Ordering::SeqCst)
    }

    /// Insert or fully replace an item.
    pub fn upsert(&self, key: ItemKey, fields: Fields, stamp: Stamp) -> StoreOutcome {
        let fields = without_blanks(fields);
        let event = match self.entries.entry(key.clone()) {
            Entry::Vacant(vacant) => {
                vacant.insert(StoreEntry {
                    slot: Slot::Live(Item::new(key.clone(), fields.clone(), stamp.version)),
                    version: stamp.version,
                    revisions: 1,
                });
                stamp.event(ChangePayload::Add { item: key, fields })
            }
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                if entry.version >= stamp.version {
                    return StoreOutcome::Ignored;
                }
                entry.version = stamp.version;
                match &mut entry.slot {
                    Slot::Live(item) => {
                        item.version = stamp.version;
                        let changed = changed_fields(&item.fields, &fields, true);
                        if changed.is_empty() {
                            return StoreOutcome::Unchanged;
                        }
                        item.fields = fields;
                        entry.revisions += 1;
                        stamp.event(ChangePayload::Update {
                            item: key,
                            fields: changed,
                        })
                    }
                    Slot::Tombstone => {
                        entry.slot =
                            Slot::Live(Item::new(key.clone(), fields.clone(), stamp.version));
                        entry.revisions += 1;
                        stamp.event(ChangePayload::Add { item: key, fields })
                    }
                }
            }
        };
        self.commit(event)
    }

    /// Merge the given fields into an item, creating it if absent.
    ///
    /// A blank value clears the field.
    pub fn merge(&self, key: ItemKey, fields: Fields, stamp: Stamp) -> StoreOutcome {
        let event = match self.entries.entry(key.clone()) {
            Entry::Vacant(vacant) => {
                let fields = without_blanks(fields);
                vacant.insert(StoreEntry {
                    slot: Slot::Live(Item::new(key.clone(), fields.clone(), stamp.version)),
                    version: stamp.version,
                    revisions: 1,
                });
                stamp.event(ChangePayload::Add { item: key, fields })
            }
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                if entry.version >= stamp.version {
                    return StoreOutcome::Ignored;
                }
                entry.version = stamp.version;
                match &mut entry.slot {
                    Slot::Live(item) => {
                        item.version = stamp.version;
                        let changed = changed_fields(&item.fields, &fields, false);
                        if changed.is_empty() {
                            return StoreOutcome::Unchanged;
                        }
                        for (name, value) in &changed {
                            if value.is_empty() {
                                item.fields.remove(name);
                            } else {
                                item.fields.insert(name.clone(), value.clone());
                            }
                        }
                        entry.revisions += 1;
                        stamp.event(ChangePayload::Update {
                            item: key,
                            fields: changed,
                        })
                    }
                    Slot::Tombstone => {
                        let fields = without_blanks(fields);
                        entry.slot =
                            Slot::Live(Item::new(key.clone(), fields.clone(), stamp.version));
                        entry.revisions += 1;
                        stamp.event(ChangePayload::Add { item: key, fields })
                    }
                }
            }
        };
        self.commit(event)
    }

    /// Delete an item, leaving a tombstone at `stamp.version`.
    pub fn remove(&self, key: &ItemKey, stamp: Stamp) -> StoreOutcome {
        let event = match self.entries.entry(key.clone()) {
            Entry::Vacant(vacant) => {
                vacant.insert(StoreEntry {
                    slot: Slot::Tombstone,
                    version: stamp.version,
                    revisions: 0,
                });
                return StoreOutcome::Unchanged;
            }
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                if entry.version >= stamp.version {
                    return StoreOutcome::Ignored;
                }
                entry.version = stamp.version;
                if matches!(entry.slot, Slot::Tombstone) {
                    return StoreOutcome::Unchanged;
                }
                entry.slot = Slot::Tombstone;
                entry.revisions += 1;
                stamp.event(ChangePayload::Delete { item: key.clone() })
            }
        };
        self.commit(event)
    }

    /// Live items matching `filter`, ordered by key.
    pub fn list(&self, filter: Option<&ItemFilter>) -> Vec<Item> {
        let mut items: Vec<Item> = self
            .entries
            .iter()
            .filter_map(|e| match &e.slot {
                Slot::Live(item) if filter.map_or(true, |f| f.matches(item)) => {
                    Some(item.clone())
                }
                _ => None,
            })
            .collect();
        items.sort_by(|a, b| a.key.cmp(&b.key));
        items
    }

    /// Keys of the live items of one source.
    pub fn keys_for_source(&self, source: &str) -> Vec<ItemKey> {
        self.entries
            .iter()
            .filter(|e| e.key().source == source && matches!(e.slot, Slot::Live(_)))
            .map(|e| e.key().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| matches!(e.slot, Slot::Live(_)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn commit(&self, event: ChangeEvent) -> StoreOutcome {
        self.revisions.fetch_add(1, Ordering::SeqCst);
        self.broadcaster.publish(event);
        StoreOutcome::Applied
    }
}

/// Fields of `next` that differ from `current`.
///
/// A blank cell and a missing field are the same value. With `replace`,
/// fields present in `current` but missing from `next` are reported as
/// cleared (empty string), the way a blanked spreadsheet cell reads.
pub(crate) fn changed_fields(current: &Fields, next: &Fields, replace: bool) -> Fields {
    let mut changed: Fields = next
        .iter()
        .filter(|(name, value)| cell(current, name) != value.as_str())
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();
    if replace {
        for (name, value) in current {
            if !value.is_empty() && !next.contains_key(name) {
                changed.insert(name.clone(), String::new());
            }
        }
    }
    changed
}

/// The store never holds blank cells.
fn without_blanks(mut fields: Fields) -> Fields {
    fields.retain(|_, value| !value.is_empty());
    fields
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::Notification;

    fn fields(pairs: &[(&str, &str)]) -> Fields {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn setup() -> (ItemStore, Arc<Broadcaster>) {
        let broadcaster = Arc::new(Broadcaster::new(64));
        (ItemStore::new(broadcaster.clone()), broadcaster)
    }

    fn poller(version: Version) -> Stamp {
        Stamp::new(version, EventOrigin::Poller)
    }

    #[test]
    fn test_upsert_and_get() {
        let (store, _) = setup();
        let key = ItemKey::new("s", "1");
        let outcome = store.upsert(key.clone(), fields(&[("name", "Gloves")]), poller(1));
        assert_eq!(outcome, StoreOutcome::Applied);

        let item = store.get(&key).unwrap();
        assert_eq!(item.field("name"), Some("Gloves"));
        assert_eq!(item.version, 1);
        assert!(store.get(&ItemKey::new("other", "1")).is_none());
    }

    #[test]
    fn test_older_or_equal_version_is_ignored() {
        let (store, _) = setup();
        let key = ItemKey::new("s", "1");
        store.upsert(key.clone(), fields(&[("quantity", "5")]), poller(5));

        assert_eq!(
            store.merge(key.clone(), fields(&[("quantity", "1")]), poller(3)),
            StoreOutcome::Ignored
        );
        assert_eq!(
            store.merge(key.clone(), fields(&[("quantity", "1")]), poller(5)),
            StoreOutcome::Ignored
        );
        assert_eq!(store.get(&key).unwrap().field("quantity"), Some("5"));
    }

    #[test]
    fn test_identical_content_advances_version_without_revision() {
        let (store, broadcaster) = setup();
        let mut sub = broadcaster.subscribe();
        let key = ItemKey::new("s", "1");
        store.upsert(key.clone(), fields(&[("quantity", "5")]), poller(1));

        let outcome = store.merge(key.clone(), fields(&[("quantity", "5")]), poller(2));
        assert_eq!(outcome, StoreOutcome::Unchanged);
        assert_eq!(store.version_of(&key), Some(2));
        assert_eq!(store.revisions(&key), 1);

        // Only the insert was broadcast
        assert!(matches!(
            sub.try_recv(),
            Some(Notification::Event(_))
        ));
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn test_tombstone_blocks_stale_resurrection() {
        let (store, _) = setup();
        let key = ItemKey::new("s", "1");
        store.upsert(key.clone(), fields(&[("name", "Gloves")]), poller(1));
        assert_eq!(store.remove(&key, poller(4)), StoreOutcome::Applied);
        assert!(store.get(&key).is_none());

        assert_eq!(
            store.upsert(key.clone(), fields(&[("name", "Gloves")]), poller(2)),
            StoreOutcome::Ignored
        );
        assert!(store.get(&key).is_none());

        // A genuinely newer add brings it back
        assert_eq!(
            store.upsert(key.clone(), fields(&[("name", "Gloves")]), poller(6)),
            StoreOutcome::Applied
        );
        assert!(store.contains(&key));
    }

    #[test]
    fn test_upsert_reports_cleared_fields() {
        let (store, broadcaster) = setup();
        let key = ItemKey::new("s", "1");
        store.upsert(
            key.clone(),
            fields(&[("name", "Gloves"), ("notes", "fragile")]),
            poller(1),
        );
        let mut sub = broadcaster.subscribe();

        store.upsert(key.clone(), fields(&[("name", "Gloves")]), poller(2));
        match sub.try_recv() {
            Some(Notification::Event(committed)) => match committed.event.payload {
                ChangePayload::Update { fields, .. } => {
                    assert_eq!(fields.len(), 1);
                    assert_eq!(fields["notes"], "");
                }
                other => panic!("unexpected payload {:?}", other),
            },
            other => panic!("unexpected {:?}", other),
        }
        assert!(store.get(&key).unwrap().field("notes").is_none());
    }

    #[test]
    fn test_cleared_cell_then_refresh_is_unchanged() {
        let (store, _) = setup();
        let key = ItemKey::new("s", "1");
        store.upsert(
            key.clone(),
            fields(&[("name", "bolt"), ("notes", "zinc")]),
            poller(1),
        );

        // Diff of a blanked cell
        assert_eq!(
            store.merge(key.clone(), fields(&[("notes", "")]), poller(2)),
            StoreOutcome::Applied
        );
        assert_eq!(store.get(&key).unwrap().fields, fields(&[("name", "bolt")]));

        // Full refresh of the same upstream row, with or without the blank cell
        assert_eq!(
            store.upsert(key.clone(), fields(&[("name", "bolt")]), poller(3)),
            StoreOutcome::Unchanged
        );
        assert_eq!(
            store.upsert(key.clone(), fields(&[("name", "bolt"), ("notes", "")]), poller(4)),
            StoreOutcome::Unchanged
        );
        assert_eq!(
            store.merge(key.clone(), fields(&[("notes", "")]), poller(5)),
            StoreOutcome::Unchanged
        );
        assert_eq!(store.revisions(&key), 2);
    }

    #[test]
    fn test_list_filters_and_sorts() {
        let (store, _) = setup();
        store.upsert(ItemKey::new("b", "1"), fields(&[("name", "Tape")]), poller(1));
        store.upsert(ItemKey::new("a", "2"), fields(&[("name", "Gloves")]), poller(2));
        store.upsert(ItemKey::new("a", "1"), fields(&[("name", "Masking tape")]), poller(3));
        store.remove(&ItemKey::new("a", "2"), poller(4));

        let all = store.list(None);
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].key, ItemKey::new("a", "1"));

        let tape = store.list(Some(&ItemFilter {
            source: None,
            text: Some("TAPE".into()),
        }));
        assert_eq!(tape.len(), 2);

        let only_b = store.list(Some(&ItemFilter {
            source: Some("b".into()),
            text: None,
        }));
        assert_eq!(only_b.len(), 1);
        assert_eq!(store.keys_for_source("a"), vec![ItemKey::new("a", "1")]);
        assert_eq!(store.len(), 2);
    }
}
