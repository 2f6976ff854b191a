use axum::{
    routing::{get, post},
    Router,
};
use clap::Parser;
use pv_core::cache::{CacheConfig, ResultCache};
use pv_core::dispatcher::{QueriesConfig, QueryDispatcher};
use pv_core::registry::MemoryRegistry;
use pv_core::retry::RetryPolicy;
use pv_core::store::MemoryStore;
use pv_core::timeseries::{SeriesConfig, SeriesPoint, TimeSeriesService};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::CorsLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod error;
mod seed;

// =============================================================================
// CLI
// =============================================================================

#[derive(Parser)]
#[command(
    name = "pv-hub",
    version = "0.1.0",
    about = "plantview telemetry dashboard backend"
)]
struct Args {
    /// Server bind address
    #[arg(long, default_value = "127.0.0.1:3000")]
    bind: String,

    /// Path to config file
    #[arg(long, default_value = "pv-hub.toml")]
    config: PathBuf,

    /// JSON file with stored queries and collections to load at startup
    #[arg(long)]
    seed: Option<PathBuf>,
}

// =============================================================================
// Config
// =============================================================================

#[derive(Deserialize, Default, Clone, Debug, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub series: SeriesConfig,
    #[serde(default)]
    pub queries: QueriesConfig,
}

/// Defaults when the file is absent; a broken file is logged and ignored.
fn load_config(path: &Path) -> Config {
    if !path.exists() {
        return Config::default();
    }
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            tracing::warn!("Failed to read config {:?}: {}, using defaults", path, e);
            return Config::default();
        }
    };
    match toml::from_str(&content) {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!("Invalid config {:?}: {}, using defaults", path, e);
            Config::default()
        }
    }
}

// =============================================================================
// Application State
// =============================================================================

pub struct AppState {
    pub dispatcher: QueryDispatcher,
    pub series: TimeSeriesService,
    pub cache: Arc<ResultCache<Vec<SeriesPoint>>>,
    pub registry: Arc<MemoryRegistry>,
    pub store: Arc<MemoryStore>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(config: &Config, store: Arc<MemoryStore>, registry: Arc<MemoryRegistry>) -> Self {
        let cache = Arc::new(ResultCache::new(config.cache));
        Self {
            dispatcher: QueryDispatcher::new(
                registry.clone(),
                store.clone(),
                config.retry,
                config.queries.clone(),
            ),
            series: TimeSeriesService::new(
                store.clone(),
                cache.clone(),
                config.retry,
                config.series.clone(),
            ),
            cache,
            registry,
            store,
            start_time: Instant::now(),
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/status", get(api::status))
        .route("/queries", get(api::list_queries))
        .route("/execute-query", post(api::execute_query))
        .route(
            "/series/history/:terminal_id/:measurand_id",
            get(api::series_history),
        )
        .route(
            "/series/graph/:terminal_name/:measurand_name",
            get(api::series_graph),
        )
        .route("/series/latest/:terminal_name", get(api::series_latest))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "pv_hub=info,pv_core=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = load_config(&args.config);

    let store = Arc::new(MemoryStore::new());
    let registry = Arc::new(MemoryRegistry::new());
    if let Some(path) = &args.seed {
        match seed::load(path, &store, &registry).await {
            Ok(stats) => tracing::info!(
                queries = stats.queries,
                documents = stats.documents,
                "Loaded seed {:?}",
                path
            ),
            Err(e) => {
                tracing::error!("Failed to load seed {:?}: {}", path, e);
                std::process::exit(1);
            }
        }
    }

    let state = Arc::new(AppState::new(&config, store, registry));
    let _sweeper = state.cache.spawn_sweeper();

    let addr: SocketAddr = match args.bind.parse() {
        Ok(addr) => addr,
        Err(e) => {
            tracing::error!("Invalid bind address {:?}: {}", args.bind, e);
            std::process::exit(1);
        }
    };
    tracing::info!("plantview hub listening on http://{}", addr);
    tracing::info!(
        retry_attempts = config.retry.max_attempts,
        retry_delay_ms = config.retry.delay.as_millis() as u64,
        cache_ttl_secs = config.cache.ttl_secs,
        "Read path configured"
    );

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("Failed to bind {}: {}", addr, e);
            std::process::exit(1);
        }
    };
    if let Err(e) = axum::serve(listener, router(state)).await {
        tracing::error!("Server error: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_partial_config_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            [retry]
            delay_ms = 250

            [series]
            graph_limit = 60
            "#,
        )
        .unwrap();

        let retry = RetryPolicy::new(3, Duration::from_millis(250));
        assert_eq!(config.retry, retry);
        assert_eq!(config.series.graph_limit, 60);
        assert_eq!(config.series.collection, "measurements");
        assert_eq!(config.cache, CacheConfig::default());
        assert_eq!(config.queries.timestamp_field, "Timestamp");
    }

    #[test]
    fn test_missing_config_file_means_defaults() {
        let config = load_config(Path::new("no-such-pv-hub.toml"));
        assert_eq!(config, Config::default());
    }
}
