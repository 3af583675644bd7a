//! Thing queries and their results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{Thing, ThingKey};

/// A filter over the things of one record.
///
/// Empty `type_ids` and `thing_ids` match every thing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThingQuery {
    /// Name used to route results back to their originator.
    pub name: String,
    pub type_ids: Vec<String>,
    pub thing_ids: Vec<String>,
    pub max_results: Option<usize>,
    /// Number of results returned with bodies; the rest come back as keys.
    pub max_full: Option<usize>,
}

impl ThingQuery {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn for_type(name: impl Into<String>, type_id: impl Into<String>) -> Self {
        Self {
            type_ids: vec![type_id.into()],
            ..Self::named(name)
        }
    }

    pub fn for_ids(name: impl Into<String>, ids: Vec<String>) -> Self {
        Self {
            thing_ids: ids,
            ..Self::named(name)
        }
    }

    pub fn matches(&self, thing: &Thing) -> bool {
        (self.type_ids.is_empty() || self.type_ids.contains(&thing.type_id))
            && (self.thing_ids.is_empty() || self.thing_ids.contains(&thing.key.id))
    }
}

/// A thing returned by key only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingThing {
    pub key: ThingKey,
    pub type_id: String,
    pub effective_date: DateTime<Utc>,
}

impl PendingThing {
    pub fn to_placeholder(&self) -> Thing {
        Thing::placeholder(self.key.clone(), self.type_id.clone(), self.effective_date)
    }
}

/// The result of one [`ThingQuery`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThingQueryResult {
    pub name: String,
    pub things: Vec<Thing>,
    pub pending_keys: Vec<PendingThing>,
}

impl ThingQueryResult {
    pub fn len(&self) -> usize {
        self.things.len() + self.pending_keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
