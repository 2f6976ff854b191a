//! # Time-Series Read Service
//!
//! The dashboard's polling paths. Each read follows the same template:
//! validate identifiers, build a [`CacheKey`], answer from the
//! [`ResultCache`] or run one range scan under retry, then flatten the
//! per-document `Measurands` arrays into points for the requested
//! measurand only.
//!
//! Measurement documents look like:
//!
//! ```json
//! { "TerminalId": 7, "TerminalName": "T1", "PlantId": 2,
//!   "Timestamp": "2024-01-01T00:00:00Z",
//!   "Measurands": [ { "MeasurandId": 3, "MeasurandName": "Pressure", "MeasurandValue": 4.2 } ] }
//! ```

use crate::cache::{CacheKey, ResultCache};
use crate::error::{CoreError, CoreResult};
use crate::retry::{self, RetryPolicy};
use crate::store::{CollectionExecutor, RangeScan, SortOrder};
use crate::time::TimeRange;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

const TIMESTAMP: &str = "Timestamp";

/// `[series]` section of the hub config.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SeriesConfig {
    #[serde(default = "default_collection")]
    pub collection: String,
    /// Most recent points returned by a graph read.
    #[serde(default = "default_graph_limit")]
    pub graph_limit: usize,
}

impl Default for SeriesConfig {
    fn default() -> Self {
        Self {
            collection: default_collection(),
            graph_limit: default_graph_limit(),
        }
    }
}

fn default_collection() -> String {
    "measurements".to_string()
}
fn default_graph_limit() -> usize {
    40
}

/// One measurand reading, as sent to dashboards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SeriesPoint {
    pub timestamp: Value,
    pub measurand_value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub measurand_name: Option<String>,
}

/// Which entries of a document's `Measurands` array a read wants.
enum Measurand<'a> {
    Id(i64),
    Name(&'a str),
}

impl Measurand<'_> {
    fn matches(&self, entry: &Value) -> bool {
        match self {
            Self::Id(id) => entry.get("MeasurandId").and_then(Value::as_i64) == Some(*id),
            Self::Name(name) => entry.get("MeasurandName").and_then(Value::as_str) == Some(*name),
        }
    }
}

pub struct TimeSeriesService {
    executor: Arc<dyn CollectionExecutor>,
    cache: Arc<ResultCache<Vec<SeriesPoint>>>,
    retry: RetryPolicy,
    config: SeriesConfig,
}

impl TimeSeriesService {
    pub fn new(
        executor: Arc<dyn CollectionExecutor>,
        cache: Arc<ResultCache<Vec<SeriesPoint>>>,
        retry: RetryPolicy,
        config: SeriesConfig,
    ) -> Self {
        Self {
            executor,
            cache,
            retry,
            config,
        }
    }

    /// Full history of one measurand on one terminal, oldest first.
    pub async fn history(
        &self,
        terminal_id: &str,
        measurand_id: &str,
        range: &TimeRange,
    ) -> CoreResult<Vec<SeriesPoint>> {
        let terminal_id = parse_id("terminal id", terminal_id)?;
        let measurand_id = parse_id("measurand id", measurand_id)?;

        let key = CacheKey::new("history")
            .part(terminal_id)
            .part(measurand_id)
            .bound(range.raw_from())
            .bound(range.raw_to())
            .finish();
        let scan = RangeScan::new(&self.config.collection, TIMESTAMP)
            .matching("TerminalId", terminal_id)
            .matching("Measurands.MeasurandId", measurand_id)
            .within(range.bounds())
            .sorted(SortOrder::Ascending);

        let wanted = Measurand::Id(measurand_id);
        self.cached_read(&key, "history", scan, wanted, false).await
    }

    /// Most recent `graph_limit` points, newest first.
    pub async fn graph(
        &self,
        terminal_name: &str,
        measurand_name: &str,
        range: &TimeRange,
    ) -> CoreResult<Vec<SeriesPoint>> {
        let terminal_name = require_name("terminal name", terminal_name)?;
        let measurand_name = require_name("measurand name", measurand_name)?;

        let key = CacheKey::new("graph")
            .part(terminal_name)
            .part(measurand_name)
            .bound(range.raw_from())
            .bound(range.raw_to())
            .finish();
        let scan = RangeScan::new(&self.config.collection, TIMESTAMP)
            .matching("TerminalName", terminal_name)
            .matching("Measurands.MeasurandName", measurand_name)
            .within(range.bounds())
            .sorted(SortOrder::Descending)
            .limit(self.config.graph_limit);

        let wanted = Measurand::Name(measurand_name);
        let mut points = self.cached_read(&key, "graph", scan, wanted, true).await?;
        points.truncate(self.config.graph_limit);
        Ok(points)
    }

    /// Latest point for each of `measurand_names` on one terminal.
    ///
    /// A measurand with no reading is left out of the result.
    pub async fn latest(
        &self,
        terminal_name: &str,
        measurand_names: &[String],
    ) -> CoreResult<Vec<SeriesPoint>> {
        let terminal_name = require_name("terminal name", terminal_name)?;
        let names: Vec<&str> = measurand_names
            .iter()
            .map(|n| n.trim())
            .filter(|n| !n.is_empty())
            .collect();
        if names.is_empty() {
            return Err(CoreError::MissingParameters("measurands".into()));
        }

        let mut latest = Vec::with_capacity(names.len());
        for name in names {
            let key = CacheKey::new("latest")
                .part(terminal_name)
                .part(name)
                .finish();
            let scan = RangeScan::new(&self.config.collection, TIMESTAMP)
                .matching("TerminalName", terminal_name)
                .matching("Measurands.MeasurandName", name)
                .sorted(SortOrder::Descending)
                .limit(1);

            let wanted = Measurand::Name(name);
            let points = self.cached_read(&key, "latest", scan, wanted, true).await?;
            match points.into_iter().next() {
                Some(point) => latest.push(point),
                None => {
                    tracing::debug!(
                        terminal = %terminal_name,
                        measurand = %name,
                        "No reading found, skipping"
                    );
                }
            }
        }
        Ok(latest)
    }

    async fn cached_read(
        &self,
        key: &str,
        operation: &str,
        scan: RangeScan,
        measurand: Measurand<'_>,
        with_names: bool,
    ) -> CoreResult<Vec<SeriesPoint>> {
        self.cache
            .get_or_compute(key, || async {
                let run = || self.executor.range_scan(&scan);
                let docs = retry::execute(&self.retry, operation, run).await?;
                Ok::<_, CoreError>(flatten(&docs, &measurand, with_names))
            })
            .await
    }
}

/// One point per matching `Measurands` entry, in document order.
fn flatten(docs: &[Value], measurand: &Measurand<'_>, with_names: bool) -> Vec<SeriesPoint> {
    let mut points = Vec::new();
    for doc in docs {
        let timestamp = doc.get(TIMESTAMP).cloned().unwrap_or(Value::Null);
        let Some(entries) = doc.get("Measurands").and_then(Value::as_array) else {
            continue;
        };
        for entry in entries.iter().filter(|e| measurand.matches(e)) {
            points.push(SeriesPoint {
                timestamp: timestamp.clone(),
                measurand_value: entry.get("MeasurandValue").cloned().unwrap_or(Value::Null),
                measurand_name: if with_names {
                    entry
                        .get("MeasurandName")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                } else {
                    None
                },
            });
        }
    }
    points
}

fn parse_id(what: &str, raw: &str) -> CoreResult<i64> {
    let raw = require_name(what, raw)?;
    match raw.parse() {
        Ok(id) => Ok(id),
        Err(_) => {
            let msg = format!("{} must be an integer: '{}'", what, raw);
            Err(CoreError::InvalidParameter(msg))
        }
    }
}

fn require_name<'a>(what: &str, raw: &'a str) -> CoreResult<&'a str> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(CoreError::MissingParameters(what.to_string()));
    }
    Ok(trimmed)
}
