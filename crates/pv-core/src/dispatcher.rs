//! # Query Dispatcher
//!
//! Resolves a stored query by name, turns it into a [`QueryPlan`] bounded
//! by the requested UTC range, and runs the plan against the collection
//! executor. Rows come back exactly as the store returns them.
//!
//! Only store calls are retried. Validation, lookup misses and script parse
//! failures are deterministic and fail on the first try.

use crate::error::{CoreError, CoreResult};
use crate::pipeline::parse_pipeline_script;
use crate::registry::{ExecutionMode, QueryRegistry, QuerySummary, StoredQuery};
use crate::retry::{self, RetryPolicy};
use crate::store::{CollectionExecutor, RangeScan, SortOrder};
use crate::time::{format_instant, require_instant};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

/// `[queries]` section of the hub config.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct QueriesConfig {
    /// Field every stored query's range filter applies to.
    #[serde(default = "default_timestamp_field")]
    pub timestamp_field: String,
}

impl Default for QueriesConfig {
    fn default() -> Self {
        Self {
            timestamp_field: default_timestamp_field(),
        }
    }
}

fn default_timestamp_field() -> String {
    "Timestamp".to_string()
}

/// Body of `POST /execute-query`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteQueryRequest {
    pub name: Option<String>,
    pub from_date: Option<String>,
    pub to_date: Option<String>,
}

impl ExecuteQueryRequest {
    /// Name and bounds, or the first reason they cannot be used. All missing
    /// fields are reported together.
    pub fn validate(&self) -> CoreResult<(&str, DateTime<Utc>, DateTime<Utc>)> {
        let name = present(&self.name);
        let from = present(&self.from_date);
        let to = present(&self.to_date);

        let missing: Vec<&str> = [("name", name), ("fromDate", from), ("toDate", to)]
            .iter()
            .filter(|(_, v)| v.is_none())
            .map(|(field, _)| *field)
            .collect();

        match (name, from, to) {
            (Some(name), Some(from), Some(to)) => Ok((
                name,
                require_instant("fromDate", from)?,
                require_instant("toDate", to)?,
            )),
            _ => Err(CoreError::MissingParameters(missing.join(", "))),
        }
    }
}

fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

/// What a stored query resolves to once its range is applied.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryPlan {
    Aggregate {
        collection: String,
        stages: Vec<Value>,
    },
    Scan(RangeScan),
}

pub struct QueryDispatcher {
    registry: Arc<dyn QueryRegistry>,
    executor: Arc<dyn CollectionExecutor>,
    retry: RetryPolicy,
    timestamp_field: String,
}

impl QueryDispatcher {
    pub fn new(
        registry: Arc<dyn QueryRegistry>,
        executor: Arc<dyn CollectionExecutor>,
        retry: RetryPolicy,
        config: QueriesConfig,
    ) -> Self {
        Self {
            registry,
            executor,
            retry,
            timestamp_field: config.timestamp_field,
        }
    }

    /// Validate a wire request and run the query it names.
    pub async fn execute(&self, request: &ExecuteQueryRequest) -> CoreResult<Vec<Value>> {
        let (name, from, to) = request.validate()?;
        self.run_stored_query(name, from, to).await
    }

    /// Run the enabled stored query `name` over `[from, to]`, both inclusive.
    pub async fn run_stored_query(
        &self,
        name: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> CoreResult<Vec<Value>> {
        let find = || self.registry.find_enabled_by_name(name);
        let record = retry::execute(&self.retry, "find stored query", find)
            .await?
            .ok_or_else(|| CoreError::NotFound(name.to_string()))?;

        let query = StoredQuery::try_from(record)?;
        let plan = self.plan(&query, from, to)?;
        let rows = self.execute_plan(&plan).await?;

        tracing::info!(
            query = %name,
            mode = %query.mode,
            rows = rows.len(),
            "Stored query executed"
        );
        Ok(rows)
    }

    /// Build the executable form of `query` without touching the store.
    pub fn plan(
        &self,
        query: &StoredQuery,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> CoreResult<QueryPlan> {
        match query.mode {
            ExecutionMode::PipelineScript => {
                let parsed = parse_pipeline_script(&query.script)?;
                let mut stages = Vec::with_capacity(parsed.stages.len() + 1);
                stages.push(self.range_stage(from, to));
                stages.extend(parsed.stages);
                Ok(QueryPlan::Aggregate {
                    collection: parsed.collection,
                    stages,
                })
            }
            ExecutionMode::ViewScan => {
                let view = query.script.trim();
                if view.is_empty() {
                    let msg = format!("query '{}' has no view name", query.name);
                    return Err(CoreError::InvalidScriptFormat(msg));
                }
                let scan = RangeScan::new(view, &self.timestamp_field)
                    .within(Some((from, to)))
                    .sorted(SortOrder::Ascending);
                Ok(QueryPlan::Scan(scan))
            }
        }
    }

    /// Enabled stored queries, for the dashboard's query picker.
    pub async fn list_queries(&self) -> CoreResult<Vec<QuerySummary>> {
        let list = || self.registry.list_enabled();
        let queries = retry::execute(&self.retry, "list queries", list).await?;
        Ok(queries)
    }

    fn range_stage(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Value {
        let mut filter = serde_json::Map::new();
        filter.insert(
            self.timestamp_field.clone(),
            json!({ "$gte": format_instant(&from), "$lte": format_instant(&to) }),
        );
        json!({ "$match": filter })
    }

    async fn execute_plan(&self, plan: &QueryPlan) -> CoreResult<Vec<Value>> {
        let rows = match plan {
            QueryPlan::Aggregate { collection, stages } => {
                let run = || self.executor.aggregate(collection, stages);
                retry::execute(&self.retry, "aggregate", run).await?
            }
            QueryPlan::Scan(scan) => {
                let run = || self.executor.range_scan(scan);
                retry::execute(&self.retry, "view scan", run).await?
            }
        };
        Ok(rows)
    }
}
