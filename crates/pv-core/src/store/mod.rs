//! # Generic Collection Executor
//!
//! The document store is an external collaborator. The query layer only
//! needs two read shapes from it: run an aggregation pipeline against a
//! named collection, and range-scan a collection on one field.

pub mod memory;

use crate::error::StoreError;
use crate::time::format_instant;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub use memory::MemoryStore;

/// Sort direction for [`RangeScan`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Ascending,
    Descending,
}

impl SortOrder {
    /// Numeric form used in `$sort` stages.
    pub fn as_i32(self) -> i32 {
        match self {
            Self::Ascending => 1,
            Self::Descending => -1,
        }
    }
}

/// A filtered scan over one collection.
///
/// `range` is inclusive on both ends. `filter` holds plain equality
/// conditions (dotted paths allowed) applied alongside the range.
#[derive(Debug, Clone, PartialEq)]
pub struct RangeScan {
    pub collection: String,
    pub filter: serde_json::Map<String, Value>,
    pub field: String,
    pub range: Option<(DateTime<Utc>, DateTime<Utc>)>,
    pub sort: Option<(String, SortOrder)>,
    pub limit: Option<usize>,
}

impl RangeScan {
    pub fn new(collection: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            filter: serde_json::Map::new(),
            field: field.into(),
            range: None,
            sort: None,
            limit: None,
        }
    }

    pub fn matching(mut self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter.insert(path.into(), value.into());
        self
    }

    pub fn within(mut self, range: Option<(DateTime<Utc>, DateTime<Utc>)>) -> Self {
        self.range = range;
        self
    }

    /// Sort on the scanned field.
    pub fn sorted(mut self, order: SortOrder) -> Self {
        self.sort = Some((self.field.clone(), order));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// The same read expressed as `$match` / `$sort` / `$limit` stages, for
    /// stores that only speak pipelines.
    pub fn to_pipeline(&self) -> Vec<Value> {
        let mut filter = self.filter.clone();
        if let Some((from, to)) = &self.range {
            filter.insert(
                self.field.clone(),
                json!({ "$gte": format_instant(from), "$lte": format_instant(to) }),
            );
        }

        let mut stages = vec![json!({ "$match": filter })];
        if let Some((field, order)) = &self.sort {
            let mut sort = serde_json::Map::new();
            sort.insert(field.clone(), json!(order.as_i32()));
            stages.push(json!({ "$sort": sort }));
        }
        if let Some(limit) = self.limit {
            stages.push(json!({ "$limit": limit }));
        }
        stages
    }
}

/// Executes reads against arbitrary, dynamically named collections.
///
/// Both calls may fail transiently; callers wrap them in
/// [`crate::retry::execute`].
#[async_trait::async_trait]
pub trait CollectionExecutor: Send + Sync {
    /// Run `stages` in order against `collection`.
    async fn aggregate(
        &self,
        collection: &str,
        stages: &[Value],
    ) -> Result<Vec<Value>, StoreError>;

    /// Filtered, optionally range-bounded, sorted and limited scan.
    async fn range_scan(&self, scan: &RangeScan) -> Result<Vec<Value>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_scan_pipeline_shape() {
        let from = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let to = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        let scan = RangeScan::new("measurements", "Timestamp")
            .matching("TerminalName", "T1")
            .within(Some((from, to)))
            .sorted(SortOrder::Descending)
            .limit(40);

        assert_eq!(
            scan.to_pipeline(),
            vec![
                json!({ "$match": {
                    "TerminalName": "T1",
                    "Timestamp": {
                        "$gte": "2024-01-01T00:00:00.000Z",
                        "$lte": "2024-01-02T00:00:00.000Z"
                    }
                }}),
                json!({ "$sort": { "Timestamp": -1 } }),
                json!({ "$limit": 40 }),
            ]
        );
    }

    #[test]
    fn test_unbounded_scan_has_only_filter() {
        let scan = RangeScan::new("view_daily", "Timestamp");
        assert_eq!(scan.to_pipeline(), vec![json!({ "$match": {} })]);
    }
}
