//! # Seed Data
//!
//! Fills the in-memory registry and store at startup:
//!
//! ```json
//! { "queries": [ { "name": "DailyAvg", "executionMode": "PipelineScript", "script": "..." } ],
//!   "collections": { "measurements": [ { "TerminalId": 7, "Timestamp": "..." } ] } }
//! ```

use pv_core::registry::{MemoryRegistry, StoredQueryRecord};
use pv_core::store::MemoryStore;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Default, Deserialize)]
pub struct Seed {
    #[serde(default)]
    pub queries: Vec<StoredQueryRecord>,
    #[serde(default)]
    pub collections: HashMap<String, Vec<Value>>,
}

/// What a seed added.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SeedStats {
    pub queries: usize,
    pub documents: usize,
}

pub async fn load(
    path: &Path,
    store: &MemoryStore,
    registry: &MemoryRegistry,
) -> Result<SeedStats, Box<dyn std::error::Error + Send + Sync>> {
    let content = tokio::fs::read_to_string(path).await?;
    let seed: Seed = serde_json::from_str(&content)?;
    Ok(apply(seed, store, registry).await)
}

pub async fn apply(seed: Seed, store: &MemoryStore, registry: &MemoryRegistry) -> SeedStats {
    let mut stats = SeedStats::default();
    for record in seed.queries {
        registry.register(record).await;
        stats.queries += 1;
    }
    for (collection, docs) in seed.collections {
        stats.documents += docs.len();
        store.insert_many(&collection, docs).await;
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use pv_core::registry::QueryRegistry;
    use pv_core::store::CollectionExecutor;

    #[tokio::test]
    async fn test_seed_populates_registry_and_store() {
        let seed: Seed = serde_json::from_str(
            r#"{
                "queries": [
                    {"name": "DailyAvg", "description": "Average per day",
                     "executionMode": "PipelineScript",
                     "script": "db.Readings.aggregate([{$group:{_id:'$day'}}])"},
                    {"name": "Retired", "executionMode": "ViewScan", "script": "v",
                     "enabled": false}
                ],
                "collections": {
                    "Readings": [{"day": "mon", "value": 1}, {"day": "tue", "value": 2}]
                }
            }"#,
        )
        .unwrap();

        let store = MemoryStore::new();
        let registry = MemoryRegistry::new();
        let stats = apply(seed, &store, &registry).await;

        let expected = SeedStats {
            queries: 2,
            documents: 2,
        };
        assert_eq!(stats, expected);
        assert_eq!(registry.list_enabled().await.unwrap().len(), 1);
        assert_eq!(store.aggregate("Readings", &[]).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_demo_seed_queries_run() {
        use pv_core::dispatcher::{QueriesConfig, QueryDispatcher};
        use pv_core::retry::RetryPolicy;
        use serde_json::json;
        use std::sync::Arc;

        let raw = include_str!("../../../demos/seed.json");
        let seed: Seed = serde_json::from_str(raw).unwrap();
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(MemoryRegistry::new());
        apply(seed, &store, &registry).await;
        let dispatcher = QueryDispatcher::new(
            registry,
            store,
            RetryPolicy::default(),
            QueriesConfig::default(),
        );

        let from = "2024-01-01T00:00:00Z".parse().unwrap();
        let to = "2024-01-01T23:59:59Z".parse().unwrap();
        let rows = dispatcher
            .run_stored_query("PressureByTerminal", from, to)
            .await
            .unwrap();
        assert_eq!(
            rows,
            vec![
                json!({"_id": "T1", "avg": 4.625, "samples": 2}),
                json!({"_id": "T2", "avg": 3.9, "samples": 1}),
            ]
        );

        let rows = dispatcher
            .run_stored_query("HourlyView", from, to)
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn test_missing_file_is_an_error() {
        let store = MemoryStore::new();
        let registry = MemoryRegistry::new();
        let path = Path::new("does-not-exist.json");
        let result = load(path, &store, &registry).await;
        assert!(result.is_err());
    }
}
