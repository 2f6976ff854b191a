//! # Stored Query Registry
//!
//! Named, operator-authored read definitions kept as data. The dispatcher
//! only reads from the registry; [`MemoryRegistry::register`] and
//! [`MemoryRegistry::set_enabled`] exist for seeding and administration.

use crate::error::{CoreError, StoreError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tokio::sync::RwLock;

/// How a stored query's `script` is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionMode {
    /// `script` is `db.<collection>.aggregate([...])` text.
    PipelineScript,
    /// `script` is the name of a view or collection to range-scan.
    ViewScan,
}

impl ExecutionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PipelineScript => "PipelineScript",
            Self::ViewScan => "ViewScan",
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionMode {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "PipelineScript" | "pipeline_script" => Ok(Self::PipelineScript),
            "ViewScan" | "view_scan" => Ok(Self::ViewScan),
            other => Err(CoreError::InvalidExecutionMode(format!("'{}'", other))),
        }
    }
}

/// A stored query as persisted. The mode stays a raw code until it is used,
/// so one bad record cannot break listing the others.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredQueryRecord {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub execution_mode: String,
    pub script: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// A stored query with a known execution mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredQuery {
    pub name: String,
    pub description: String,
    pub mode: ExecutionMode,
    pub script: String,
}

impl TryFrom<StoredQueryRecord> for StoredQuery {
    type Error = CoreError;

    fn try_from(record: StoredQueryRecord) -> Result<Self, Self::Error> {
        let mode = record.execution_mode.parse()?;
        Ok(Self {
            name: record.name,
            description: record.description,
            mode,
            script: record.script,
        })
    }
}

/// Entry in the public query listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuerySummary {
    pub name: String,
    pub description: String,
}

/// Read access to stored query definitions.
#[async_trait::async_trait]
pub trait QueryRegistry: Send + Sync {
    /// The enabled definition called `name`, if any.
    async fn find_enabled_by_name(
        &self,
        name: &str,
    ) -> Result<Option<StoredQueryRecord>, StoreError>;

    async fn list_enabled(&self) -> Result<Vec<QuerySummary>, StoreError>;
}

/// Registry held in process memory, in registration order.
#[derive(Default)]
pub struct MemoryRegistry {
    records: RwLock<Vec<StoredQueryRecord>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `record`, replacing any existing one with the same name.
    pub async fn register(&self, record: StoredQueryRecord) {
        let mut records = self.records.write().await;
        match records.iter_mut().find(|r| r.name == record.name) {
            Some(existing) => *existing = record,
            None => records.push(record),
        }
    }

    /// Returns false when no query has that name.
    pub async fn set_enabled(&self, name: &str, enabled: bool) -> bool {
        let mut records = self.records.write().await;
        match records.iter_mut().find(|r| r.name == name) {
            Some(record) => {
                record.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// Number of registered queries, disabled ones included.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait::async_trait]
impl QueryRegistry for MemoryRegistry {
    async fn find_enabled_by_name(
        &self,
        name: &str,
    ) -> Result<Option<StoredQueryRecord>, StoreError> {
        let records = self.records.read().await;
        let found = records.iter().find(|r| r.enabled && r.name == name);
        Ok(found.cloned())
    }

    async fn list_enabled(&self) -> Result<Vec<QuerySummary>, StoreError> {
        let records = self.records.read().await;
        Ok(records
            .iter()
            .filter(|r| r.enabled)
            .map(|r| QuerySummary {
                name: r.name.clone(),
                description: r.description.clone(),
            })
            .collect())
    }
}
