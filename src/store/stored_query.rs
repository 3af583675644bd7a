//! A query whose last result is kept with the time it was fetched.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;
use crate::model::{ThingQuery, ThingQueryResult};
use crate::transport::ThingClient;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredQuery {
    pub query: ThingQuery,
    pub result: Option<ThingQueryResult>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl StoredQuery {
    pub fn new(query: ThingQuery) -> Self {
        Self {
            query,
            result: None,
            timestamp: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.query.name
    }

    /// A query that has never been synchronized is always stale.
    pub fn is_stale(&self, max_age: Duration) -> bool {
        self.is_stale_at(max_age, Utc::now())
    }

    pub fn is_stale_at(&self, max_age: Duration, now: DateTime<Utc>) -> bool {
        match self.timestamp {
            Some(timestamp) => now - timestamp > max_age,
            None => true,
        }
    }

    /// Re-run the query if it is stale.
    ///
    /// Returns the new result, or `None` if the stored one was fresh. On
    /// failure the previous result and timestamp are kept.
    pub async fn synchronize(
        &mut self,
        client: &ThingClient,
        record_id: &str,
        max_age: Duration,
    ) -> Result<Option<ThingQueryResult>> {
        if !self.is_stale(max_age) {
            return Ok(None);
        }
        debug!(record = record_id, query = %self.query.name, "refreshing stored query");
        let mut results = client.query(record_id, vec![self.query.clone()]).await?;
        let result = results.pop().unwrap_or_default();
        self.result = Some(result.clone());
        self.timestamp = Some(Utc::now());
        Ok(Some(result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Thing, ThingKey};
    use crate::transport::{Fault, MemoryThingServer, MethodName, ServerStatusCode};
    use std::sync::Arc;

    #[test]
    fn test_staleness() {
        let mut query = StoredQuery::new(ThingQuery::named("q"));
        assert!(query.is_stale(Duration::days(365)));

        let now = Utc::now();
        query.timestamp = Some(now - Duration::seconds(30));
        assert!(!query.is_stale_at(Duration::seconds(60), now));
        assert!(query.is_stale_at(Duration::seconds(10), now));
    }

    #[tokio::test]
    async fn test_synchronize_only_when_stale() {
        let server = Arc::new(MemoryThingServer::new());
        server.insert_thing("r1", Thing::new(ThingKey::new("a", "1"), "weight", Utc::now(), "{}"));
        let client = ThingClient::new(server.clone());
        let mut query = StoredQuery::new(ThingQuery::for_type("q", "weight"));

        let result = query.synchronize(&client, "r1", Duration::minutes(5)).await.unwrap();
        assert_eq!(result.unwrap().things.len(), 1);
        assert!(query.synchronize(&client, "r1", Duration::minutes(5)).await.unwrap().is_none());
        assert_eq!(server.call_count(MethodName::GetThings), 1);
    }

    #[tokio::test]
    async fn test_failure_keeps_previous_result() {
        let server = Arc::new(MemoryThingServer::new());
        let client = ThingClient::new(server.clone());
        let mut query = StoredQuery::new(ThingQuery::for_type("q", "weight"));
        query.synchronize(&client, "r1", Duration::minutes(5)).await.unwrap();
        query.timestamp = Some(Utc::now() - Duration::hours(1));
        let before = query.clone();

        server.set_fault(|_| Some(Fault::Status(ServerStatusCode::AccessDenied)));
        assert!(query.synchronize(&client, "r1", Duration::minutes(5)).await.is_err());
        assert_eq!(query, before);
    }
}
