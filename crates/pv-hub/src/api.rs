//! # API Handlers
//!
//! Axum handlers for stored queries and dashboard series reads.

use crate::error::{ApiError, ApiResult};
use crate::AppState;
use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    Json,
};
use pv_core::dispatcher::ExecuteQueryRequest;
use pv_core::registry::QuerySummary;
use pv_core::time::TimeRange;
use pv_core::timeseries::SeriesPoint;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

#[derive(Debug, Default, Deserialize)]
pub struct RangeParams {
    pub from: Option<String>,
    pub to: Option<String>,
}

impl RangeParams {
    fn range(&self) -> Result<TimeRange, ApiError> {
        Ok(TimeRange::parse(self.from.as_deref(), self.to.as_deref())?)
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct LatestParams {
    /// Comma-separated measurand names.
    pub measurands: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HubStatus {
    version: &'static str,
    uptime_seconds: u64,
    cache_entries: usize,
    registered_queries: usize,
    collections: Vec<String>,
}

// =============================================================================
// Stored queries
// =============================================================================

pub async fn list_queries(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<Vec<QuerySummary>>> {
    Ok(Json(state.dispatcher.list_queries().await?))
}

pub async fn execute_query(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ExecuteQueryRequest>, JsonRejection>,
) -> ApiResult<Json<Vec<Value>>> {
    let Json(request) = payload?;
    let rows = state.dispatcher.execute(&request).await?;
    Ok(Json(rows))
}

// =============================================================================
// Series
// =============================================================================

pub async fn series_history(
    State(state): State<Arc<AppState>>,
    Path((terminal_id, measurand_id)): Path<(String, String)>,
    Query(params): Query<RangeParams>,
) -> ApiResult<Json<Vec<SeriesPoint>>> {
    let range = params.range()?;
    let points = state
        .series
        .history(&terminal_id, &measurand_id, &range)
        .await?;
    Ok(Json(points))
}

pub async fn series_graph(
    State(state): State<Arc<AppState>>,
    Path((terminal_name, measurand_name)): Path<(String, String)>,
    Query(params): Query<RangeParams>,
) -> ApiResult<Json<Vec<SeriesPoint>>> {
    let range = params.range()?;
    let points = state
        .series
        .graph(&terminal_name, &measurand_name, &range)
        .await?;
    Ok(Json(points))
}

pub async fn series_latest(
    State(state): State<Arc<AppState>>,
    Path(terminal_name): Path<String>,
    Query(params): Query<LatestParams>,
) -> ApiResult<Json<Vec<SeriesPoint>>> {
    let names: Vec<String> = params
        .measurands
        .as_deref()
        .unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    let points = state.series.latest(&terminal_name, &names).await?;
    Ok(Json(points))
}

// =============================================================================
// Status
// =============================================================================

pub async fn status(State(state): State<Arc<AppState>>) -> Json<HubStatus> {
    Json(HubStatus {
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        cache_entries: state.cache.len().await,
        registered_queries: state.registry.len().await,
        collections: state.store.collection_names().await,
    })
}
