//! In-process implementation of the thing service, intended primarily for testing.
//!
//! Keeps per-record thing tables with sequence numbers, enforces version
//! stamps on update and delete, and honors idempotency keys.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::pending_operation::is_local_id;
use crate::model::{PendingThing, Thing, ThingKey, ThingQueryResult};

use super::thing_client::{
    ChangeBatch, GetThingChangesRequest, GetThingsRequest, GetThingsResponse, PutThingsRequest,
    PutThingsResponse, RemoveThingsRequest,
};
use super::transport::{MethodName, MethodRequest, MethodResponse, ServerStatusCode, Transport};

/// A failure injected into the server.
#[derive(Debug, Clone)]
pub enum Fault {
    /// The round trip fails without a response.
    Network(String),
    /// The server responds with this status.
    Status(ServerStatusCode),
}

type FaultFn = dyn Fn(&MethodRequest) -> Option<Fault> + Send + Sync;

#[derive(Default)]
struct RecordState {
    /// Current things with the sequence number of their last change.
    things: HashMap<String, (Thing, u64)>,
    /// Deleted ids with their type and deletion sequence number.
    removed: HashMap<String, (String, u64)>,
    last_sequence_number: u64,
}

impl RecordState {
    fn next_sequence_number(&mut self) -> u64 {
        self.last_sequence_number += 1;
        self.last_sequence_number
    }
}

#[derive(Default)]
struct ServerState {
    records: HashMap<String, RecordState>,
    /// Responses already sent, by idempotency key.
    applied: HashMap<Uuid, Value>,
    calls: HashMap<MethodName, usize>,
}

/// An in-memory thing service.
#[derive(Default)]
pub struct MemoryThingServer {
    state: Mutex<ServerState>,
    fault: Mutex<Option<Arc<FaultFn>>>,
}

impl MemoryThingServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a fault injector consulted before every request.
    pub fn set_fault<F>(&self, f: F)
    where
        F: Fn(&MethodRequest) -> Option<Fault> + Send + Sync + 'static,
    {
        *self.fault.lock().unwrap() = Some(Arc::new(f));
    }

    pub fn clear_fault(&self) {
        *self.fault.lock().unwrap() = None;
    }

    /// Number of requests received for `method`, including failed ones.
    pub fn call_count(&self, method: MethodName) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .get(&method)
            .copied()
            .unwrap_or(0)
    }

    /// Store `thing` as-is, bumping the record's sequence number.
    pub fn insert_thing(&self, record_id: &str, thing: Thing) {
        let mut state = self.state.lock().unwrap();
        let record = state.records.entry(record_id.to_string()).or_default();
        let seq = record.next_sequence_number();
        record.removed.remove(&thing.key.id);
        record.things.insert(thing.key.id.clone(), (thing, seq));
    }

    /// Change the payload of an existing thing, giving it a new version.
    pub fn update_thing(&self, record_id: &str, id: &str, payload: &str) -> Option<ThingKey> {
        let mut state = self.state.lock().unwrap();
        let record = state.records.get_mut(record_id)?;
        let seq = record.next_sequence_number();
        let (thing, thing_seq) = record.things.get_mut(id)?;
        thing.key.version = Uuid::new_v4().to_string();
        thing.payload = payload.to_string();
        thing.update_date = Some(Utc::now());
        *thing_seq = seq;
        Some(thing.key.clone())
    }

    pub fn delete_thing(&self, record_id: &str, id: &str) -> bool {
        let mut state = self.state.lock().unwrap();
        let Some(record) = state.records.get_mut(record_id) else {
            return false;
        };
        let Some((thing, _)) = record.things.remove(id) else {
            return false;
        };
        let seq = record.next_sequence_number();
        record.removed.insert(id.to_string(), (thing.type_id, seq));
        true
    }

    pub fn thing(&self, record_id: &str, id: &str) -> Option<Thing> {
        let state = self.state.lock().unwrap();
        state
            .records
            .get(record_id)
            .and_then(|r| r.things.get(id))
            .map(|(t, _)| t.clone())
    }

    pub fn thing_count(&self, record_id: &str) -> usize {
        let state = self.state.lock().unwrap();
        state.records.get(record_id).map_or(0, |r| r.things.len())
    }

    pub fn latest_sequence_number(&self, record_id: &str) -> u64 {
        let state = self.state.lock().unwrap();
        state
            .records
            .get(record_id)
            .map_or(0, |r| r.last_sequence_number)
    }

    // =========================================================================
    // Method handlers
    // =========================================================================

    fn get_things(record: &RecordState, request: GetThingsRequest) -> Value {
        let mut results = Vec::new();
        for query in request.queries {
            let mut matching: Vec<&Thing> = record
                .things
                .values()
                .map(|(t, _)| t)
                .filter(|t| query.matches(t))
                .collect();
            matching.sort_by(|a, b| {
                b.effective_date
                    .cmp(&a.effective_date)
                    .then_with(|| a.key.id.cmp(&b.key.id))
            });
            if let Some(max) = query.max_results {
                matching.truncate(max);
            }
            let max_full = query.max_full.unwrap_or(matching.len());
            let mut result = ThingQueryResult {
                name: query.name.clone(),
                ..Default::default()
            };
            for (i, thing) in matching.into_iter().enumerate() {
                if i < max_full {
                    result.things.push(thing.clone());
                } else {
                    result.pending_keys.push(PendingThing {
                        key: thing.key.clone(),
                        type_id: thing.type_id.clone(),
                        effective_date: thing.effective_date,
                    });
                }
            }
            results.push(result);
        }
        json!(GetThingsResponse { results })
    }

    fn put_things(
        record: &mut RecordState,
        request: PutThingsRequest,
    ) -> std::result::Result<Value, MethodResponse> {
        // Validate everything first so a rejected request changes nothing
        for thing in &request.things {
            if is_local_id(&thing.key.id) {
                continue;
            }
            match record.things.get(&thing.key.id) {
                None => {
                    return Err(MethodResponse::error(
                        ServerStatusCode::InvalidItem,
                        format!("thing {} not found", thing.key.id),
                    ))
                }
                Some((current, _)) if current.key.version != thing.key.version => {
                    return Err(MethodResponse::error(
                        ServerStatusCode::VersionStampMismatch,
                        format!("thing {} is at a newer version", thing.key.id),
                    ))
                }
                Some(_) => {}
            }
        }

        let now = Utc::now();
        let mut keys = Vec::new();
        for mut thing in request.things {
            let seq = record.next_sequence_number();
            if is_local_id(&thing.key.id) {
                thing.key.id = Uuid::new_v4().to_string();
                thing.create_date = Some(now);
            }
            thing.key.version = Uuid::new_v4().to_string();
            thing.update_date = Some(now);
            thing.is_placeholder = false;
            keys.push(thing.key.clone());
            record.things.insert(thing.key.id.clone(), (thing, seq));
        }
        Ok(json!(PutThingsResponse { keys }))
    }

    fn remove_things(
        record: &mut RecordState,
        request: RemoveThingsRequest,
    ) -> std::result::Result<Value, MethodResponse> {
        for key in &request.keys {
            match record.things.get(&key.id) {
                None => {
                    return Err(MethodResponse::error(
                        ServerStatusCode::InvalidItem,
                        format!("thing {} not found", key.id),
                    ))
                }
                Some((current, _)) if current.key.version != key.version => {
                    return Err(MethodResponse::error(
                        ServerStatusCode::VersionStampMismatch,
                        format!("thing {} is at a newer version", key.id),
                    ))
                }
                Some(_) => {}
            }
        }
        for key in request.keys {
            if let Some((thing, _)) = record.things.remove(&key.id) {
                let seq = record.next_sequence_number();
                record.removed.insert(key.id, (thing.type_id, seq));
            }
        }
        Ok(json!({}))
    }

    fn get_thing_changes(record: &RecordState, request: GetThingChangesRequest) -> Value {
        let type_matches =
            |type_id: &str| request.type_ids.is_empty() || request.type_ids.iter().any(|t| t == type_id);

        // (sequence number, Some(thing) for a change, None for a removal, id)
        let mut changes: Vec<(u64, Option<&Thing>, &str)> = Vec::new();
        for (id, (thing, seq)) in &record.things {
            if *seq > request.since && type_matches(&thing.type_id) {
                changes.push((*seq, Some(thing), id));
            }
        }
        for (id, (type_id, seq)) in &record.removed {
            if *seq > request.since && type_matches(type_id) {
                changes.push((*seq, None, id));
            }
        }
        changes.sort_by_key(|(seq, _, _)| *seq);
        changes.truncate(request.max_results.max(1));

        let mut batch = ChangeBatch {
            batch_sequence_number: changes.last().map_or(request.since, |(seq, _, _)| *seq),
            latest_sequence_number: record.last_sequence_number,
            ..Default::default()
        };
        if changes.is_empty() {
            // Nothing newer matched the filter; the caller is caught up.
            batch.batch_sequence_number = record.last_sequence_number.max(request.since);
        }
        for (_, thing, id) in changes {
            match thing {
                Some(thing) => batch.things.push(thing.clone()),
                None => batch.removed.push(id.to_string()),
            }
        }
        json!(batch)
    }

    fn handle(state: &mut ServerState, request: &MethodRequest) -> MethodResponse {
        let record = state.records.entry(request.record_id.clone()).or_default();
        let params = request.parameters.clone();
        let result = match request.method {
            MethodName::GetThings => serde_json::from_value(params)
                .map(|r| Ok(Self::get_things(record, r))),
            MethodName::PutThings => serde_json::from_value(params).map(|r| Self::put_things(record, r)),
            MethodName::RemoveThings => {
                serde_json::from_value(params).map(|r| Self::remove_things(record, r))
            }
            MethodName::GetThingChanges => serde_json::from_value(params)
                .map(|r| Ok(Self::get_thing_changes(record, r))),
        };
        match result {
            Ok(Ok(body)) => MethodResponse::ok(body),
            Ok(Err(response)) => response,
            Err(e) => MethodResponse::error(ServerStatusCode::InvalidXml, e.to_string()),
        }
    }
}

#[async_trait]
impl Transport for MemoryThingServer {
    async fn call(&self, request: MethodRequest) -> Result<MethodResponse> {
        let fault = self.fault.lock().unwrap().clone();

        let mut state = self.state.lock().unwrap();
        *state.calls.entry(request.method).or_insert(0) += 1;

        match fault.and_then(|f| f(&request)) {
            Some(Fault::Network(message)) => return Err(Error::Network(message)),
            Some(Fault::Status(code)) => {
                return Ok(MethodResponse::error(code, "injected failure"));
            }
            None => {}
        }

        if let Some(key) = request.idempotency_key {
            if let Some(body) = state.applied.get(&key) {
                return Ok(MethodResponse::ok(body.clone()));
            }
        }

        let response = Self::handle(&mut state, &request);
        if let (Some(key), true) = (request.idempotency_key, response.status.is_ok()) {
            state.applied.insert(key, response.body.clone());
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ThingQuery;
    use crate::transport::ThingClient;
    use chrono::TimeZone;

    fn thing(id: &str, day: u32) -> Thing {
        Thing::new(
            ThingKey::new(id, "v1"),
            "weight",
            Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap(),
            "{}",
        )
    }

    #[tokio::test]
    async fn test_query_orders_and_splits_full_and_keys() {
        let server = Arc::new(MemoryThingServer::new());
        server.insert_thing("r1", thing("a", 1));
        server.insert_thing("r1", thing("b", 3));
        server.insert_thing("r1", thing("c", 2));
        let client = ThingClient::new(server.clone());

        let query = ThingQuery {
            max_full: Some(1),
            ..ThingQuery::for_type("q", "weight")
        };
        let results = client.query("r1", vec![query]).await.unwrap();
        assert_eq!(results[0].things.len(), 1);
        assert_eq!(results[0].things[0].key.id, "b");
        let pending: Vec<_> = results[0].pending_keys.iter().map(|p| p.key.id.as_str()).collect();
        assert_eq!(pending, vec!["c", "a"]);
    }

    #[tokio::test]
    async fn test_stale_version_is_rejected() {
        let server = Arc::new(MemoryThingServer::new());
        server.insert_thing("r1", thing("a", 1));
        server.update_thing("r1", "a", "{\"kg\":1}").unwrap();
        let client = ThingClient::new(server.clone());

        let op = crate::model::PendingOperation::put(&thing("a", 1)).unwrap();
        let err = client.submit("r1", &op).await.unwrap_err();
        assert!(matches!(err, Error::VersionConflict(_)));
    }

    #[tokio::test]
    async fn test_changes_are_paged_in_sequence_order() {
        let server = Arc::new(MemoryThingServer::new());
        for i in 1..=5 {
            server.insert_thing("r1", thing(&format!("t{}", i), i));
        }
        server.delete_thing("r1", "t2");
        let client = ThingClient::new(server.clone());

        let first = client.get_thing_changes("r1", 0, 3, &[]).await.unwrap();
        // t2 was deleted, so the first page is t1, t3, t4
        assert_eq!(first.things.len(), 3);
        assert_eq!(first.batch_sequence_number, 4);
        assert_eq!(first.latest_sequence_number, 6);

        let second = client
            .get_thing_changes("r1", first.batch_sequence_number, 3, &[])
            .await
            .unwrap();
        assert_eq!(second.things.len(), 1);
        assert_eq!(second.removed, vec!["t2".to_string()]);
        assert_eq!(second.batch_sequence_number, 6);
    }
}
