//! Things and their keys.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifies one version of a thing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ThingKey {
    pub id: String,
    pub version: String,
}

impl ThingKey {
    pub fn new(id: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: version.into(),
        }
    }
}

impl std::fmt::Display for ThingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.id, self.version)
    }
}

/// A cached snapshot of a server-side thing.
///
/// `payload` is the serialized body; its contents are not interpreted by the
/// cache. A placeholder has a key and type but no downloaded body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thing {
    pub key: ThingKey,
    pub type_id: String,
    pub effective_date: DateTime<Utc>,
    pub create_date: Option<DateTime<Utc>>,
    pub update_date: Option<DateTime<Utc>>,
    pub created_by_app_id: Option<String>,
    pub created_by_person_id: Option<String>,
    pub updated_by_app_id: Option<String>,
    pub updated_by_person_id: Option<String>,
    pub payload: String,
    #[serde(default)]
    pub is_placeholder: bool,
}

impl Thing {
    /// A full thing with only the required fields set.
    pub fn new(
        key: ThingKey,
        type_id: impl Into<String>,
        effective_date: DateTime<Utc>,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            key,
            type_id: type_id.into(),
            effective_date,
            create_date: None,
            update_date: None,
            created_by_app_id: None,
            created_by_person_id: None,
            updated_by_app_id: None,
            updated_by_person_id: None,
            payload: payload.into(),
            is_placeholder: false,
        }
    }

    /// A thing whose key is known but whose body has not been downloaded.
    pub fn placeholder(key: ThingKey, type_id: impl Into<String>, effective_date: DateTime<Utc>) -> Self {
        Self {
            is_placeholder: true,
            ..Self::new(key, type_id, effective_date, String::new())
        }
    }

    pub fn id(&self) -> &str {
        &self.key.id
    }

    /// True if this is a full copy of exactly `key`.
    pub fn is_full_copy_of(&self, key: &ThingKey) -> bool {
        !self.is_placeholder && &self.key == key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholder_is_not_full_copy() {
        let key = ThingKey::new("a", "1");
        let placeholder = Thing::placeholder(key.clone(), "weight", Utc::now());
        assert!(placeholder.is_placeholder);
        assert!(!placeholder.is_full_copy_of(&key));

        let full = Thing::new(key.clone(), "weight", Utc::now(), "{}");
        assert!(full.is_full_copy_of(&key));
        assert!(!full.is_full_copy_of(&ThingKey::new("a", "2")));
    }

    #[test]
    fn test_missing_placeholder_flag_decodes_as_full() {
        let json = r#"{"key":{"id":"a","version":"1"},"type_id":"t",
            "effective_date":"2024-01-01T00:00:00Z","create_date":null,"update_date":null,
            "created_by_app_id":null,"created_by_person_id":null,"updated_by_app_id":null,
            "updated_by_person_id":null,"payload":"x"}"#;
        let thing: Thing = serde_json::from_str(json).unwrap();
        assert!(!thing.is_placeholder);
    }
}
