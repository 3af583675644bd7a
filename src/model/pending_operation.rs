//! Pending local mutations awaiting commit to the server.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::{Thing, ThingKey};

/// Prefix for ids of things created locally and not yet assigned an id by the server.
pub const LOCAL_ID_PREFIX: &str = "local-";

/// Returns a fresh local id for a new thing.
pub fn new_local_id() -> String {
    format!("{}{}", LOCAL_ID_PREFIX, Uuid::new_v4())
}

pub fn is_local_id(id: &str) -> bool {
    id.starts_with(LOCAL_ID_PREFIX)
}

/// The server method a pending operation will invoke.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PendingMethod {
    PutThings,
    RemoveThings,
}

/// Where a pending operation is in its life cycle.
///
/// Only `Queued` operations are picked up by the commit scheduler. `Failed`
/// and `Conflict` operations stay in the table until requeued or discarded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PendingState {
    Queued,
    Failed { reason: String },
    Conflict { reason: String },
}

/// A local write that has not yet been confirmed by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOperation {
    /// Client-generated id. Sent as the idempotency key of every submission.
    pub identifier: Uuid,
    pub original_request_date: DateTime<Utc>,
    pub method_name: PendingMethod,
    /// Number of submission attempts made so far.
    pub version: u32,
    /// The serialized request body.
    pub parameters: Value,
    pub correlation_id: Uuid,
    pub type_id: String,
    /// The id of the thing this operation targets.
    pub thing_id: String,
    pub state: PendingState,
    /// Position in the record's queue, assigned when the operation is queued.
    #[serde(default)]
    pub sequence: u64,
}

impl PendingOperation {
    fn new(method_name: PendingMethod, type_id: String, thing_id: String, parameters: Value) -> Self {
        Self {
            identifier: Uuid::new_v4(),
            original_request_date: Utc::now(),
            method_name,
            version: 0,
            parameters,
            correlation_id: Uuid::new_v4(),
            type_id,
            thing_id,
            state: PendingState::Queued,
            sequence: 0,
        }
    }

    /// An operation that creates or updates `thing`.
    pub fn put(thing: &Thing) -> Result<Self> {
        let parameters = json!({ "things": [serde_json::to_value(thing)?] });
        Ok(Self::new(
            PendingMethod::PutThings,
            thing.type_id.clone(),
            thing.key.id.clone(),
            parameters,
        ))
    }

    /// An operation that deletes the thing at `key`.
    pub fn remove(type_id: impl Into<String>, key: &ThingKey) -> Result<Self> {
        let parameters = json!({ "keys": [serde_json::to_value(key)?] });
        Ok(Self::new(
            PendingMethod::RemoveThings,
            type_id.into(),
            key.id.clone(),
            parameters,
        ))
    }

    pub fn is_queued(&self) -> bool {
        self.state == PendingState::Queued
    }

    /// True if the operation creates a thing that has no server id yet.
    pub fn is_new_item(&self) -> bool {
        is_local_id(&self.thing_id)
    }

    /// The thing carried by a `PutThings` operation.
    pub fn thing(&self) -> Result<Thing> {
        let value = self
            .parameters
            .get("things")
            .and_then(|things| things.get(0))
            .cloned()
            .ok_or_else(|| Error::Serialization("pending put has no thing".to_string()))?;
        Ok(serde_json::from_value(value)?)
    }

    /// The key targeted by a `RemoveThings` operation.
    pub fn removed_key(&self) -> Result<ThingKey> {
        let value = self
            .parameters
            .get("keys")
            .and_then(|keys| keys.get(0))
            .cloned()
            .ok_or_else(|| Error::Serialization("pending remove has no key".to_string()))?;
        Ok(serde_json::from_value(value)?)
    }

    /// Point the operation at `key`, after an earlier operation on the same
    /// thing was confirmed and the server assigned a new id or version.
    pub fn retarget(&mut self, key: &ThingKey) -> Result<()> {
        match self.method_name {
            PendingMethod::PutThings => {
                let mut thing = self.thing()?;
                thing.key = key.clone();
                self.parameters = json!({ "things": [serde_json::to_value(&thing)?] });
            }
            PendingMethod::RemoveThings => {
                self.parameters = json!({ "keys": [serde_json::to_value(key)?] });
            }
        }
        self.thing_id = key.id.clone();
        Ok(())
    }

    /// Rewrite a `PutThings` so the server creates a new item instead of
    /// updating the one it targets. The original item is left orphaned.
    pub fn rewrite_as_new_item(&mut self) -> Result<()> {
        let mut thing = self.thing()?;
        thing.key = ThingKey::new(new_local_id(), String::new());
        self.parameters = json!({ "things": [serde_json::to_value(&thing)?] });
        Ok(())
    }
}
