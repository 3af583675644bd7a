//! Typed client for the thing methods of the service.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{Error, Result};
use crate::model::{PendingMethod, PendingOperation, Thing, ThingKey, ThingQuery, ThingQueryResult};

use super::transport::{MethodName, MethodRequest, Transport};

// =============================================================================
// Wire bodies
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetThingsRequest {
    pub queries: Vec<ThingQuery>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetThingsResponse {
    pub results: Vec<ThingQueryResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutThingsRequest {
    pub things: Vec<Thing>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PutThingsResponse {
    /// Keys assigned by the server, in request order.
    pub keys: Vec<ThingKey>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveThingsRequest {
    pub keys: Vec<ThingKey>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetThingChangesRequest {
    /// Only changes with a sequence number greater than this are returned.
    pub since: u64,
    pub max_results: usize,
    pub type_ids: Vec<String>,
}

/// One page of changes, in ascending sequence order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeBatch {
    pub things: Vec<Thing>,
    /// Ids of things deleted on the server.
    pub removed: Vec<String>,
    /// Sequence number of the last change in this batch.
    pub batch_sequence_number: u64,
    /// Newest sequence number the record has.
    pub latest_sequence_number: u64,
}

impl ChangeBatch {
    pub fn is_empty(&self) -> bool {
        self.things.is_empty() && self.removed.is_empty()
    }
}

// =============================================================================
// ThingClient
// =============================================================================

/// Issues thing requests for one or more records over a [`Transport`].
#[derive(Clone)]
pub struct ThingClient {
    transport: Arc<dyn Transport>,
}

impl ThingClient {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    async fn send<T: DeserializeOwned + Default>(&self, request: MethodRequest) -> Result<T> {
        let method = request.method;
        debug!(method = method.as_str(), record = %request.record_id, "calling service");
        let response = self.transport.call(request).await?;
        if !response.status.is_ok() {
            return Err(Error::from_status(&response.status));
        }
        if response.body.is_null() {
            return Ok(T::default());
        }
        Ok(serde_json::from_value(response.body)?)
    }

    /// Run several queries in one round trip.
    ///
    /// Results are returned in query order.
    pub async fn query(&self, record_id: &str, queries: Vec<ThingQuery>) -> Result<Vec<ThingQueryResult>> {
        let parameters = serde_json::to_value(GetThingsRequest { queries })?;
        let request = MethodRequest::new(MethodName::GetThings, record_id, parameters);
        let response: GetThingsResponse = self.send(request).await?;
        Ok(response.results)
    }

    /// Fetch the full things for `keys`.
    ///
    /// Things whose current version differs from the requested key are still
    /// returned; things that no longer exist are omitted.
    pub async fn get_things_by_keys(&self, record_id: &str, keys: &[ThingKey]) -> Result<Vec<Thing>> {
        let ids: Vec<String> = keys.iter().map(|k| k.id.clone()).collect();
        let query = ThingQuery {
            max_full: Some(ids.len()),
            ..ThingQuery::for_ids("keys", ids)
        };
        let mut results = self.query(record_id, vec![query]).await?;
        Ok(results.pop().map(|r| r.things).unwrap_or_default())
    }

    /// Submit a pending operation.
    ///
    /// The operation identifier is sent as the idempotency key, so a
    /// resubmission after a lost response is not applied twice. Returns the
    /// keys assigned by a `PutThings`; empty for `RemoveThings`.
    pub async fn submit(&self, record_id: &str, op: &PendingOperation) -> Result<Vec<ThingKey>> {
        let method = match op.method_name {
            PendingMethod::PutThings => MethodName::PutThings,
            PendingMethod::RemoveThings => MethodName::RemoveThings,
        };
        let request = MethodRequest {
            correlation_id: op.correlation_id,
            idempotency_key: Some(op.identifier),
            ..MethodRequest::new(method, record_id, op.parameters.clone())
        };
        match op.method_name {
            PendingMethod::PutThings => {
                let response: PutThingsResponse = self.send(request).await?;
                Ok(response.keys)
            }
            PendingMethod::RemoveThings => {
                let _: Value = self.send(request).await?;
                Ok(Vec::new())
            }
        }
    }

    /// Fetch the next page of changes after sequence number `since`.
    pub async fn get_thing_changes(
        &self,
        record_id: &str,
        since: u64,
        max_results: usize,
        type_ids: &[String],
    ) -> Result<ChangeBatch> {
        let parameters = serde_json::to_value(GetThingChangesRequest {
            since,
            max_results,
            type_ids: type_ids.to_vec(),
        })?;
        let request = MethodRequest::new(MethodName::GetThingChanges, record_id, parameters);
        self.send(request).await
    }
}
