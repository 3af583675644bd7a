//! Ordered index of the things of one type in one record.
//!
//! A view holds keys only; bodies are read from the record's thing store.
//! Local changes made through the view are tracked as pending operations and
//! show up as load-pending items until the commit is confirmed.

use std::ops::Range;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::commit::{CommitReport, CommitState};
use crate::error::{Error, Result};
use crate::model::{PendingMethod, Thing, ThingKey, ThingQuery, ThingQueryResult};
use crate::store::RecordCache;

use super::type_view_item::TypeViewItem;
use super::type_view_items::TypeViewItems;

/// Persisted form of a view, stored under `rec/{record}/view/{name}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeViewData {
    pub name: String,
    pub type_id: String,
    pub items: TypeViewItems,
    pub last_updated: Option<DateTime<Utc>>,
    pub max_items: Option<usize>,
}

pub struct TypeView {
    cache: Arc<RecordCache>,
    state: Mutex<TypeViewData>,
}

impl TypeView {
    pub fn new(cache: Arc<RecordCache>, name: impl Into<String>, type_id: impl Into<String>) -> Self {
        Self::from_data(
            cache,
            TypeViewData {
                name: name.into(),
                type_id: type_id.into(),
                items: TypeViewItems::new(),
                last_updated: None,
                max_items: None,
            },
        )
    }

    fn from_data(cache: Arc<RecordCache>, data: TypeViewData) -> Self {
        Self {
            cache,
            state: Mutex::new(data),
        }
    }

    /// Load a saved view, or `None` if nothing was saved under `name`.
    pub async fn load(cache: Arc<RecordCache>, name: &str) -> Result<Option<Self>> {
        let data: Option<TypeViewData> = cache.load_view_data(name).await?;
        Ok(data.map(|data| Self::from_data(cache, data)))
    }

    pub async fn save(&self) -> Result<()> {
        let data = self.data();
        self.cache.save_view_data(&data.name, &data).await
    }

    pub fn cache(&self) -> &Arc<RecordCache> {
        &self.cache
    }

    pub fn data(&self) -> TypeViewData {
        self.state.lock().unwrap().clone()
    }

    pub fn name(&self) -> String {
        self.state.lock().unwrap().name.clone()
    }

    pub fn type_id(&self) -> String {
        self.state.lock().unwrap().type_id.clone()
    }

    pub fn set_max_items(&self, max_items: Option<usize>) {
        let mut state = self.state.lock().unwrap();
        state.max_items = max_items;
        if let Some(max) = max_items {
            state.items.truncate(max);
        }
    }

    /// The query that refreshes this view.
    pub fn query(&self) -> ThingQuery {
        let state = self.state.lock().unwrap();
        ThingQuery {
            max_results: state.max_items,
            ..ThingQuery::for_type(state.name.clone(), state.type_id.clone())
        }
    }

    // =========================================================================
    // Index access
    // =========================================================================

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn items(&self) -> Vec<TypeViewItem> {
        self.state.lock().unwrap().items.iter().cloned().collect()
    }

    pub fn key_at(&self, index: usize) -> Option<ThingKey> {
        self.state.lock().unwrap().items.get(index).map(|i| i.key.clone())
    }

    pub fn index_of_id(&self, id: &str) -> Option<usize> {
        self.state.lock().unwrap().items.index_of_id(id)
    }

    pub fn contains_id(&self, id: &str) -> bool {
        self.state.lock().unwrap().items.contains_id(id)
    }

    pub fn item_for_id(&self, id: &str) -> Option<TypeViewItem> {
        self.state.lock().unwrap().items.item_for_id(id).cloned()
    }

    /// Oldest effective date in the view.
    pub fn min_date(&self) -> Option<DateTime<Utc>> {
        self.state.lock().unwrap().items.last_date()
    }

    /// Newest effective date in the view.
    pub fn max_date(&self) -> Option<DateTime<Utc>> {
        self.state.lock().unwrap().items.first_date()
    }

    pub fn index_of_closest_date(&self, date: DateTime<Utc>) -> Option<usize> {
        self.state.lock().unwrap().items.index_of_closest_date(date)
    }

    fn keys_in_range(&self, range: Range<usize>) -> Vec<TypeViewItem> {
        let state = self.state.lock().unwrap();
        let end = range.end.min(state.items.len());
        (range.start.min(end)..end)
            .filter_map(|i| state.items.get(i).cloned())
            .collect()
    }

    // =========================================================================
    // Things
    // =========================================================================

    /// Keys in `range` whose exact version is not stored in full locally.
    pub async fn keys_needing_download(&self, range: Range<usize>) -> Result<Vec<ThingKey>> {
        let mut keys = Vec::new();
        for item in self.keys_in_range(range) {
            if item.is_load_pending {
                continue;
            }
            let stored = self.cache.things().get_item(item.id()).await?;
            if !stored.is_some_and(|t| t.is_full_copy_of(&item.key)) {
                keys.push(item.key);
            }
        }
        Ok(keys)
    }

    /// The locally stored thing for an id in this view.
    pub async fn get_local_thing(&self, id: &str) -> Result<Option<Thing>> {
        if !self.contains_id(id) {
            return Ok(None);
        }
        self.cache.things().get_item(id).await
    }

    /// Locally stored things for `range`, in view order. Missing ones are `None`.
    pub async fn get_things_in_range(&self, range: Range<usize>) -> Result<Vec<Option<Thing>>> {
        let mut things = Vec::new();
        for item in self.keys_in_range(range) {
            things.push(self.cache.things().get_item(item.id()).await?);
        }
        Ok(things)
    }

    // =========================================================================
    // Freshness
    // =========================================================================

    pub fn last_updated(&self) -> Option<DateTime<Utc>> {
        self.state.lock().unwrap().last_updated
    }

    /// A view that was never refreshed is stale.
    pub fn is_stale(&self, max_age: Duration) -> bool {
        match self.last_updated() {
            Some(updated) => Utc::now() - updated > max_age,
            None => true,
        }
    }

    /// True if any pending operation targets this view's type.
    pub async fn has_pending_operations(&self) -> Result<bool> {
        self.cache.pending().has_pending_for_type(&self.type_id()).await
    }

    /// Rebuild the view from a query result.
    ///
    /// Queued local puts are kept as load-pending items and things with a
    /// queued delete are left out.
    pub async fn replace_keys(&self, result: &ThingQueryResult) -> Result<()> {
        let type_id = self.type_id();
        let mut local_items = Vec::new();
        let mut removed_ids = Vec::new();
        for op in self.cache.pending().list().await? {
            if op.type_id != type_id {
                continue;
            }
            match op.method_name {
                PendingMethod::PutThings => {
                    local_items.push(TypeViewItem::from_thing(&op.thing()?).load_pending());
                }
                PendingMethod::RemoveThings => removed_ids.push(op.thing_id.clone()),
            }
        }

        let mut items = TypeViewItems::from_items(
            result
                .things
                .iter()
                .map(TypeViewItem::from_thing)
                .chain(result.pending_keys.iter().map(TypeViewItem::from_pending_thing))
                .filter(|item| !removed_ids.contains(&item.key.id)),
        );
        for item in local_items {
            items.add(item);
        }

        let mut state = self.state.lock().unwrap();
        if let Some(max) = state.max_items {
            items.truncate(max);
        }
        state.items = items;
        state.last_updated = Some(Utc::now());
        Ok(())
    }

    /// Swap the items of committed puts for the confirmed things.
    ///
    /// A created thing is found under the id it had before the commit, so it
    /// keeps its row unless the confirmed date moves it. Things with further
    /// queued operations stay load-pending. Returns the number of items updated.
    pub async fn apply_commit_report(&self, report: &CommitReport) -> Result<usize> {
        let pending = self.cache.pending().thing_ids().await?;
        let mut state = self.state.lock().unwrap();
        let mut updated = 0;
        for outcome in &report.outcomes {
            if outcome.state != CommitState::Committed {
                continue;
            }
            let Some(thing) = &outcome.thing else {
                continue;
            };
            if thing.type_id != state.type_id {
                continue;
            }
            let mut item = TypeViewItem::from_thing(thing);
            if pending.contains(thing.id()) {
                item = item.load_pending();
            }
            let replaced = state.items.replace_by_id(&outcome.thing_id, item.clone()).is_some()
                || state.items.replace_by_id(thing.id(), item).is_some();
            if replaced {
                updated += 1;
            }
        }
        Ok(updated)
    }

    // =========================================================================
    // Local changes
    // =========================================================================

    /// Update `thing` locally and queue the change.
    pub async fn put_thing(&self, thing: Thing) -> Result<()> {
        self.check_type(&thing)?;
        let item = TypeViewItem::from_thing(&thing).load_pending();
        self.cache.track_put(thing).await?;
        self.state.lock().unwrap().items.add(item);
        Ok(())
    }

    /// Create `thing` locally and queue it. Returns the thing with its local id.
    pub async fn add_new_thing(&self, thing: Thing) -> Result<Thing> {
        self.check_type(&thing)?;
        let (thing, _) = self.cache.track_new(thing).await?;
        self.state
            .lock()
            .unwrap()
            .items
            .add(TypeViewItem::from_thing(&thing).load_pending());
        Ok(thing)
    }

    /// Delete the thing with `id` locally and queue the delete.
    pub async fn remove_thing_by_id(&self, id: &str) -> Result<()> {
        let item = self
            .item_for_id(id)
            .ok_or_else(|| Error::ItemKeyNotFound(id.to_string()))?;
        self.cache.track_remove(&self.type_id(), &item.key).await?;
        self.state.lock().unwrap().items.remove_by_id(id);
        Ok(())
    }

    fn check_type(&self, thing: &Thing) -> Result<()> {
        let type_id = self.type_id();
        if thing.type_id == type_id {
            Ok(())
        } else {
            Err(Error::Client {
                code: crate::transport::ServerStatusCode::TypeIdNotFound,
                message: format!("thing of type {} added to view of {}", thing.type_id, type_id),
            })
        }
    }
}

impl std::fmt::Debug for TypeView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().unwrap();
        f.debug_struct("TypeView")
            .field("name", &state.name)
            .field("type_id", &state.type_id)
            .field("len", &state.items.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::pending_operation::is_local_id;
    use crate::model::{PendingThing, ThingKey};
    use crate::commit::CommitScheduler;
    use crate::store::{LocalVault, RecordCacheSettings};
    use crate::transport::{Fault, MemoryThingServer, ServerStatusCode, ThingClient};
    use chrono::TimeZone;

    fn date(month: u32, day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, month, day, 0, 0, 0).unwrap()
    }

    fn thing(id: &str, when: DateTime<Utc>) -> Thing {
        Thing::new(ThingKey::new(id, "1"), "weight", when, "{}")
    }

    fn view() -> TypeView {
        let vault = LocalVault::in_memory(RecordCacheSettings::default());
        TypeView::new(vault.record_cache("r1"), "weights", "weight")
    }

    #[tokio::test]
    async fn test_view_enumerates_newest_first() {
        let view = view();
        let result = ThingQueryResult {
            name: "weights".to_string(),
            things: vec![
                thing("jan", date(1, 1)),
                thing("mar", date(3, 1)),
                thing("feb", date(2, 1)),
            ],
            pending_keys: vec![PendingThing {
                key: ThingKey::new("also-mar", "1"),
                type_id: "weight".to_string(),
                effective_date: date(3, 1),
            }],
        };
        view.replace_keys(&result).await.unwrap();

        let ids: Vec<String> = view.items().into_iter().map(|i| i.key.id).collect();
        assert_eq!(ids, vec!["also-mar", "mar", "feb", "jan"]);
        assert_eq!(view.max_date(), Some(date(3, 1)));
        assert_eq!(view.min_date(), Some(date(1, 1)));
        assert_eq!(view.index_of_closest_date(date(2, 3)), Some(2));
        assert!(!view.is_stale(Duration::minutes(1)));
    }

    #[tokio::test]
    async fn test_new_thing_shows_as_pending_until_resolved() {
        let view = view();
        view.replace_keys(&ThingQueryResult {
            things: vec![thing("a", date(1, 1)), thing("c", date(3, 1))],
            ..Default::default()
        })
        .await
        .unwrap();

        let local = view.add_new_thing(thing("ignored", date(2, 1))).await.unwrap();
        assert!(is_local_id(local.id()));
        assert_eq!(view.index_of_id(local.id()), Some(1));
        assert!(view.item_for_id(local.id()).unwrap().is_load_pending);
        assert!(view.has_pending_operations().await.unwrap());

        let server = Arc::new(MemoryThingServer::new());
        let scheduler = CommitScheduler::new(view.cache().clone(), ThingClient::new(server));
        let report = scheduler.commit_pending().await.unwrap().unwrap().wait().await.unwrap();
        assert_eq!(report.committed_count(), 1);
        let confirmed = report.outcomes[0].thing.clone().unwrap();
        assert_ne!(confirmed.id(), local.id());

        assert_eq!(view.apply_commit_report(&report).await.unwrap(), 1);
        assert_eq!(view.index_of_id(confirmed.id()), Some(1));
        assert!(!view.item_for_id(confirmed.id()).unwrap().is_load_pending);
        assert!(!view.contains_id(local.id()));
        assert!(view.get_local_thing(confirmed.id()).await.unwrap().is_some());
        assert!(!view.has_pending_operations().await.unwrap());
    }

    #[tokio::test]
    async fn test_commit_report_keeps_later_edits_pending() {
        let view = view();
        let local = view.add_new_thing(thing("ignored", date(2, 1))).await.unwrap();
        let mut edited = local.clone();
        edited.payload = "{\"kg\":70}".to_string();
        view.put_thing(edited).await.unwrap();

        let server = Arc::new(MemoryThingServer::new());
        // Only the create goes through in this pass
        server.set_fault(|request| {
            let is_update = request.parameters.to_string().contains("kg");
            is_update.then_some(Fault::Status(ServerStatusCode::AccessDenied))
        });
        let scheduler = CommitScheduler::new(view.cache().clone(), ThingClient::new(server));
        let report = scheduler.commit_pending().await.unwrap().unwrap().wait().await.unwrap();
        assert_eq!(report.committed_count(), 1);

        // Outcomes for other types and failed operations are ignored
        assert_eq!(view.apply_commit_report(&report).await.unwrap(), 1);
        let confirmed_id = report.outcomes[0].thing.as_ref().unwrap().key.id.clone();
        assert_eq!(view.len(), 1);
        assert!(view.item_for_id(&confirmed_id).unwrap().is_load_pending);
    }

    #[tokio::test]
    async fn test_refresh_keeps_local_changes() {
        let view = view();
        let server = ThingQueryResult {
            things: vec![thing("a", date(1, 1)), thing("b", date(2, 1))],
            ..Default::default()
        };
        view.replace_keys(&server).await.unwrap();
        view.remove_thing_by_id("a").await.unwrap();
        let local = view.add_new_thing(thing("x", date(5, 1))).await.unwrap();

        view.replace_keys(&server).await.unwrap();
        assert!(!view.contains_id("a"));
        assert_eq!(view.key_at(0).unwrap().id, local.key.id);
        assert_eq!(view.len(), 2);
    }

    #[tokio::test]
    async fn test_keys_needing_download_and_save() {
        let view = view();
        view.replace_keys(&ThingQueryResult {
            pending_keys: vec![
                PendingThing {
                    key: ThingKey::new("a", "1"),
                    type_id: "weight".to_string(),
                    effective_date: date(2, 1),
                },
                PendingThing {
                    key: ThingKey::new("b", "1"),
                    type_id: "weight".to_string(),
                    effective_date: date(1, 1),
                },
            ],
            ..Default::default()
        })
        .await
        .unwrap();
        view.cache().store_server_thing(thing("a", date(2, 1))).await.unwrap();

        let keys = view.keys_needing_download(0..10).await.unwrap();
        assert_eq!(keys, vec![ThingKey::new("b", "1")]);
        assert!(view.get_local_thing("a").await.unwrap().is_some());
        assert_eq!(view.get_things_in_range(0..2).await.unwrap()[1], None);

        view.save().await.unwrap();
        let loaded = TypeView::load(view.cache().clone(), "weights").await.unwrap().unwrap();
        assert_eq!(loaded.data(), view.data());
        assert!(TypeView::load(view.cache().clone(), "other").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_wrong_type_is_rejected() {
        let view = view();
        let mut other = thing("a", date(1, 1));
        other.type_id = "height".to_string();
        assert!(view.put_thing(other).await.is_err());
        assert!(view.remove_thing_by_id("missing").await.is_err());
    }
}
