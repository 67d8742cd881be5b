//! Data model shared by the executor, the environment manager and the
//! orchestrator.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Isolation strategy used for one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// In-process interpreter (wasmtime + QuickJS).
    Light,
    /// One disposable container per execution.
    Heavy,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::Light => f.write_str("light"),
            Strategy::Heavy => f.write_str("heavy"),
        }
    }
}

/// Snapshot of the inbound HTTP request handed to user code as `req`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestDescriptor {
    /// HTTP method.
    pub method: String,
    /// Request path.
    pub path: String,
    /// Parsed body, `null` when absent.
    #[serde(default)]
    pub body: Value,
    /// Query string parameters.
    #[serde(default)]
    pub query: BTreeMap<String, String>,
    /// Path parameters.
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    /// Request headers (lower-cased names).
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

/// Per-request execution switches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionOptions {
    /// Source language; `None` means JavaScript.
    pub language: Option<String>,
    /// The caller explicitly asked for container isolation.
    pub require_isolation: bool,
}

/// Everything needed to run one piece of user code. Built once by the
/// orchestrator and never modified afterwards.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    /// User-authored code (a function body).
    pub code: String,
    /// Hard wall-clock deadline.
    pub timeout: Duration,
    /// Memory ceiling in bytes.
    pub max_memory: u64,
    /// Inbound request snapshot.
    pub request: RequestDescriptor,
    /// Mock-data collection chosen by the caller.
    pub collection_id: Option<String>,
    /// Variables environment chosen by the caller.
    pub environment_id: Option<String>,
    /// Caller identity.
    pub user_id: String,
    /// Strategy switches.
    pub options: ExecutionOptions,
}

/// A mutation requested by sandboxed code. Applied only after the sandbox
/// exits successfully, and only once the orchestrator has completed the
/// fields the sandbox could not know.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveDirective {
    /// Target collection.
    #[serde(default)]
    pub collection_id: Option<String>,
    /// Full replacement item array.
    #[serde(default)]
    pub items: Vec<Value>,
    /// Execution that produced the directive.
    #[serde(default)]
    pub execution_id: Option<String>,
    /// Endpoint that ran.
    #[serde(default)]
    pub endpoint_id: Option<String>,
    /// Caller identity.
    #[serde(default)]
    pub user_id: Option<String>,
    /// Project owning the endpoint.
    #[serde(default)]
    pub project_id: Option<String>,
}

/// Outcome of one execution. Produced once, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    /// Identifier bound into the sandbox as the execution id.
    pub execution_id: String,
    /// Whether user code completed without throwing.
    pub success: bool,
    /// Returned value; opaque stdout is carried as a JSON string.
    pub output: Value,
    /// Error message when `success` is false.
    pub error: Option<String>,
    /// Buffered console lines.
    pub logs: Vec<String>,
    /// Wall-clock time spent in the sandbox.
    #[serde(serialize_with = "serialize_millis")]
    pub elapsed: Duration,
    /// Strategy that ran the code.
    pub strategy: Strategy,
    /// Heavy was selected but Light ran because the backend was unhealthy.
    pub downgraded: bool,
    /// Save request reported by the sandbox, not yet completed.
    pub save_directive: Option<SaveDirective>,
}

fn serialize_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}
