//! Refresh of several type views with one round trip.
//!
//! Stale views are queried together in a single `GetThings` call per record,
//! with one query per view. Views with queued local changes are skipped so a
//! refresh never hides an unconfirmed edit.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use chrono::Duration;
use tracing::{debug, info};

use crate::error::Result;
use crate::transport::ThingClient;
use crate::util::{CancelSignal, Task};

use super::type_view::TypeView;

/// What a refresh did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshOutcome {
    pub refreshed_views: usize,
    pub things_stored: usize,
}

pub struct MultipleTypeViewRefresher {
    client: ThingClient,
    views: Vec<Arc<TypeView>>,
    max_age: Duration,
    /// Number of results per view fetched with bodies; the rest become placeholders.
    max_full: Option<usize>,
}

impl MultipleTypeViewRefresher {
    pub fn new(client: ThingClient, views: Vec<Arc<TypeView>>, max_age: Duration) -> Self {
        Self {
            client,
            views,
            max_age,
            max_full: None,
        }
    }

    pub fn with_max_full(mut self, max_full: usize) -> Self {
        self.max_full = Some(max_full);
        self
    }

    /// Views older than `max_age` with no queued local changes.
    pub async fn stale_views(&self) -> Result<Vec<Arc<TypeView>>> {
        // Pending type ids, read once per record
        let mut pending_types: HashMap<String, HashSet<String>> = HashMap::new();
        let mut stale = Vec::new();
        for view in &self.views {
            if !view.is_stale(self.max_age) {
                continue;
            }
            let record_id = view.cache().record_id();
            if !pending_types.contains_key(record_id) {
                let types = view.cache().pending().type_ids().await?;
                pending_types.insert(record_id.to_string(), types);
            }
            if !pending_types[record_id].contains(&view.type_id()) {
                stale.push(view.clone());
            }
        }
        Ok(stale)
    }

    /// Start refreshing the stale views.
    ///
    /// Returns `None` when no view needs a refresh.
    pub async fn refresh(&self) -> Result<Option<Task<Result<RefreshOutcome>>>> {
        let stale = self.stale_views().await?;
        if stale.is_empty() {
            debug!("no stale views");
            return Ok(None);
        }

        let mut by_record: BTreeMap<String, Vec<Arc<TypeView>>> = BTreeMap::new();
        for view in stale {
            by_record
                .entry(view.cache().record_id().to_string())
                .or_default()
                .push(view);
        }

        let client = self.client.clone();
        let max_full = self.max_full;
        Ok(Some(Task::spawn(move |cancel| {
            refresh_records(client, by_record, max_full, cancel)
        })))
    }
}

async fn refresh_records(
    client: ThingClient,
    by_record: BTreeMap<String, Vec<Arc<TypeView>>>,
    max_full: Option<usize>,
    cancel: Arc<CancelSignal>,
) -> Result<RefreshOutcome> {
    let mut outcome = RefreshOutcome::default();
    for (record_id, views) in by_record {
        if cancel.is_cancelled() {
            break;
        }
        let queries = views
            .iter()
            .map(|view| {
                let mut query = view.query();
                query.max_full = max_full;
                query
            })
            .collect();
        let results = client.query(&record_id, queries).await?;

        for (view, result) in views.iter().zip(results.iter()) {
            let things = result
                .things
                .iter()
                .cloned()
                .chain(result.pending_keys.iter().map(|pending| pending.to_placeholder()))
                .collect();
            outcome.things_stored += view.cache().store_server_things(things).await?;
            view.replace_keys(result).await?;
            view.save().await?;
            outcome.refreshed_views += 1;
        }
        info!(record = %record_id, views = views.len(), "refreshed type views");
    }
    Ok(outcome)
}
