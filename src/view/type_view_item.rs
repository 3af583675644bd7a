//! One entry of a type view and the order entries sort in.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{PendingThing, Thing, ThingKey};

/// One entry of a type view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeViewItem {
    pub date: DateTime<Utc>,
    pub key: ThingKey,
    /// Set while the item reflects a local change that has not been confirmed.
    pub is_load_pending: bool,
}

impl TypeViewItem {
    pub fn new(date: DateTime<Utc>, key: ThingKey) -> Self {
        Self {
            date,
            key,
            is_load_pending: false,
        }
    }

    pub fn from_thing(thing: &Thing) -> Self {
        Self::new(thing.effective_date, thing.key.clone())
    }

    pub fn from_pending_thing(pending: &PendingThing) -> Self {
        Self::new(pending.effective_date, pending.key.clone())
    }

    pub fn load_pending(mut self) -> Self {
        self.is_load_pending = true;
        self
    }

    pub fn id(&self) -> &str {
        &self.key.id
    }

    /// View order: newest date first, ties by ascending id.
    pub fn compare_to_item(&self, other: &TypeViewItem) -> Ordering {
        other
            .date
            .cmp(&self.date)
            .then_with(|| self.key.id.cmp(&other.key.id))
    }
}
