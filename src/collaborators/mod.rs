//! Interfaces the orchestrator consumes from the rest of the system.
//!
//! Authentication, endpoint persistence, mock-data storage and variable
//! resolution live outside the sandbox engine. These traits are the seams;
//! [`memory`] has reference implementations for tests and embedders.

pub mod memory;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

pub use crate::orchestrator::audit::AuditSink;

/// Project-level permission checks.
#[async_trait]
pub trait AccessControl: Send + Sync {
    /// Whether `user_id` may edit `project_id`.
    async fn can_edit_project(&self, user_id: &str, project_id: &str) -> Result<bool>;

    /// Whether `user_id` may view `project_id`.
    async fn can_view_project(&self, user_id: &str, project_id: &str) -> Result<bool>;
}

/// A user-registered endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointRecord {
    /// Endpoint identifier.
    pub id: String,
    /// Owning project.
    pub project_id: String,
    /// HTTP method.
    pub method: String,
    /// Route path.
    pub path: String,
    /// User-authored function body.
    pub code: String,
    /// Declared timeout; clamped by configuration.
    #[serde(default)]
    pub timeout: Option<Duration>,
    /// Declared memory ceiling in bytes; clamped by configuration.
    #[serde(default)]
    pub memory_limit: Option<u64>,
    /// Source language, JavaScript when absent.
    #[serde(default)]
    pub language: Option<String>,
    /// Always run with Heavy isolation.
    #[serde(default)]
    pub require_isolation: bool,
    /// Successful executions so far.
    #[serde(default)]
    pub call_count: u64,
    /// Time of the last successful execution.
    #[serde(default)]
    pub last_called_at: Option<DateTime<Utc>>,
}

/// Endpoint persistence.
#[async_trait]
pub trait EndpointStore: Send + Sync {
    /// Look up an endpoint.
    async fn endpoint(&self, endpoint_id: &str) -> Result<Option<EndpointRecord>>;

    /// Bump the call counter and last-called timestamp.
    async fn record_call(&self, endpoint_id: &str, at: DateTime<Utc>) -> Result<()>;
}

/// Required-field schema of a collection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionSchema {
    /// Fields every item must carry.
    pub required: Vec<String>,
}

/// A named array of mock items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MockCollection {
    /// Collection identifier.
    pub id: String,
    /// Owning project.
    pub project_id: String,
    /// Display name.
    pub name: String,
    /// Current items.
    pub items: Vec<Value>,
    /// Optional schema enforced on save.
    #[serde(default)]
    pub schema: Option<CollectionSchema>,
    /// Bumped by one on every save.
    pub version: u64,
}

/// Where a save came from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveContext {
    /// Execution that requested the save.
    pub execution_id: String,
    /// Endpoint that ran.
    pub endpoint_id: String,
    /// Project owning the endpoint.
    pub project_id: String,
}

/// Outcome of a successful save.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveReceipt {
    /// Collection written.
    pub collection_id: String,
    /// New version.
    pub version: u64,
    /// Items now stored.
    pub item_count: usize,
}

/// Mock-data storage.
#[async_trait]
pub trait MockDataStore: Send + Sync {
    /// Read a collection.
    async fn collection(&self, collection_id: &str) -> Result<Option<MockCollection>>;

    /// Replace a collection's items on behalf of an execution.
    ///
    /// Implementations validate against the schema, back up the previous
    /// items and bump the version. Concurrent saves are last-writer-wins.
    async fn save_from_execution(
        &self,
        collection_id: &str,
        items: Vec<Value>,
        user_id: &str,
        context: &SaveContext,
    ) -> Result<SaveReceipt>;
}

/// Environment-variable resolution.
#[async_trait]
pub trait EnvironmentStore: Send + Sync {
    /// Variables of `environment_id`, or of the project's default
    /// environment when `None`.
    async fn variables(
        &self,
        project_id: &str,
        environment_id: Option<&str>,
    ) -> Result<BTreeMap<String, String>>;
}
