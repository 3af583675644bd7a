//! Layout of cache entries in the key-value database.
//!
//! ```text
//! rec/{record}/meta
//! rec/{record}/thing/{id}
//! rec/{record}/pending/{id}
//! rec/{record}/view/{name}
//! rec/{record}/query/{name}
//! ```

pub const RECORDS_PREFIX: &str = "rec/";

pub fn record_prefix(record_id: &str) -> Vec<u8> {
    format!("{}{}/", RECORDS_PREFIX, record_id).into_bytes()
}

pub fn meta_key(record_id: &str) -> Vec<u8> {
    format!("{}{}/meta", RECORDS_PREFIX, record_id).into_bytes()
}

pub fn things_prefix(record_id: &str) -> Vec<u8> {
    format!("{}{}/thing/", RECORDS_PREFIX, record_id).into_bytes()
}

pub fn thing_key(record_id: &str, id: &str) -> Vec<u8> {
    format!("{}{}/thing/{}", RECORDS_PREFIX, record_id, id).into_bytes()
}

pub fn pending_prefix(record_id: &str) -> Vec<u8> {
    format!("{}{}/pending/", RECORDS_PREFIX, record_id).into_bytes()
}

pub fn pending_key(record_id: &str, identifier: &str) -> Vec<u8> {
    format!("{}{}/pending/{}", RECORDS_PREFIX, record_id, identifier).into_bytes()
}

pub fn view_key(record_id: &str, name: &str) -> Vec<u8> {
    format!("{}{}/view/{}", RECORDS_PREFIX, record_id, name).into_bytes()
}

pub fn query_key(record_id: &str, name: &str) -> Vec<u8> {
    format!("{}{}/query/{}", RECORDS_PREFIX, record_id, name).into_bytes()
}

/// Extract the record id from a `rec/{record}/meta` key.
pub fn record_id_from_meta_key(key: &[u8]) -> Option<&str> {
    std::str::from_utf8(key)
        .ok()?
        .strip_prefix(RECORDS_PREFIX)?
        .strip_suffix("/meta")
        .filter(|id| !id.contains('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meta_key_round_trip() {
        let key = meta_key("r-1");
        assert_eq!(record_id_from_meta_key(&key), Some("r-1"));
        assert_eq!(record_id_from_meta_key(&thing_key("r-1", "meta")), None);
    }
}
