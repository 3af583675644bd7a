//! Registry of known thing types.
//!
//! Built once at start-up by explicit `register` calls.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::model::pending_operation::new_local_id;
use crate::model::{Thing, ThingKey};

pub const WEIGHT_TYPE_ID: &str = "3d34d87e-7fc1-4153-800f-f56592cb0d17";
pub const BLOOD_PRESSURE_TYPE_ID: &str = "ca3c57f4-f4c1-4e15-be67-0a3caf5414ed";
pub const HEIGHT_TYPE_ID: &str = "40750a6a-89b2-455c-bd8d-b420a4cb500b";
pub const MEDICATION_TYPE_ID: &str = "30cafccc-047d-4288-94ef-643571f7919d";
pub const CONDITION_TYPE_ID: &str = "7ea7a1f9-880b-4bd4-b593-f5660f20eda8";

/// Describes one thing type.
#[derive(Debug, Clone)]
pub struct ThingTypeInfo {
    pub type_id: String,
    pub name: String,
    /// Produces the payload of a new, empty thing of this type.
    pub new_payload: fn() -> String,
}

fn empty_object() -> String {
    "{}".to_string()
}

#[derive(Debug, Clone, Default)]
pub struct ThingTypeRegistry {
    types: HashMap<String, ThingTypeInfo>,
}

impl ThingTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the commonly used types.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(WEIGHT_TYPE_ID, "Weight", empty_object);
        registry.register(BLOOD_PRESSURE_TYPE_ID, "Blood Pressure", empty_object);
        registry.register(HEIGHT_TYPE_ID, "Height", empty_object);
        registry.register(MEDICATION_TYPE_ID, "Medication", empty_object);
        registry.register(CONDITION_TYPE_ID, "Condition", empty_object);
        registry
    }

    /// Register a type, replacing any previous registration for the same id.
    pub fn register(&mut self, type_id: &str, name: &str, new_payload: fn() -> String) {
        self.types.insert(
            type_id.to_string(),
            ThingTypeInfo {
                type_id: type_id.to_string(),
                name: name.to_string(),
                new_payload,
            },
        );
    }

    pub fn lookup(&self, type_id: &str) -> Option<&ThingTypeInfo> {
        self.types.get(type_id)
    }

    /// Display name for a type id, falling back to the id itself.
    pub fn name_for(&self, type_id: &str) -> String {
        self.lookup(type_id)
            .map(|info| info.name.clone())
            .unwrap_or_else(|| type_id.to_string())
    }

    /// Construct a new local thing of a registered type.
    pub fn new_thing(&self, type_id: &str, effective_date: DateTime<Utc>) -> Option<Thing> {
        let info = self.lookup(type_id)?;
        Some(Thing::new(
            ThingKey::new(new_local_id(), String::new()),
            info.type_id.clone(),
            effective_date,
            (info.new_payload)(),
        ))
    }

    pub fn type_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.types.keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::pending_operation::is_local_id;

    #[test]
    fn test_new_thing_for_registered_type() {
        let registry = ThingTypeRegistry::with_defaults();
        let thing = registry.new_thing(WEIGHT_TYPE_ID, Utc::now()).unwrap();
        assert!(is_local_id(thing.id()));
        assert_eq!(thing.payload, "{}");
        assert!(registry.new_thing("unknown", Utc::now()).is_none());
    }

    #[test]
    fn test_name_falls_back_to_id() {
        let registry = ThingTypeRegistry::with_defaults();
        assert_eq!(registry.name_for(HEIGHT_TYPE_ID), "Height");
        assert_eq!(registry.name_for("abc"), "abc");
    }
}
