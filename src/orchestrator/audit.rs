//! Execution log records and the sinks that store them.
//!
//! Every orchestrated attempt produces one [`ExecutionLogRecord`], whatever
//! its outcome. Sinks may fail; the orchestrator logs and swallows those
//! failures.

use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::Result;
use crate::types::Strategy;

/// Marker appended to truncated bodies.
pub const TRUNCATION_MARKER: &str = "...[truncated]";

/// Audit snapshot of one attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionLogRecord {
    /// Record identifier.
    pub id: String,
    /// Sandbox execution id, when execution was reached.
    pub execution_id: Option<String>,
    /// Endpoint that was invoked.
    pub endpoint_id: String,
    /// Owning project, when the endpoint resolved.
    pub project_id: Option<String>,
    /// Caller.
    pub user_id: String,
    /// HTTP method of the inbound request.
    pub method: String,
    /// Path of the inbound request.
    pub path: String,
    /// Status the attempt maps to.
    pub status_code: u16,
    /// Truncated request body.
    pub request_body: Option<String>,
    /// Truncated response body.
    pub response_body: Option<String>,
    /// Error message for failed attempts.
    pub error: Option<String>,
    /// Stable error code for failed attempts.
    pub error_code: Option<String>,
    /// Strategy used, when execution was reached.
    pub strategy: Option<Strategy>,
    /// Heavy was downgraded to Light.
    pub downgraded: bool,
    /// Total time spent in the orchestrator.
    pub duration_ms: u64,
    /// Time spent inside the sandbox.
    pub execution_ms: Option<u64>,
    /// When the attempt started.
    pub timestamp: DateTime<Utc>,
}

/// Append-only execution log writer.
#[async_trait::async_trait]
pub trait AuditSink: Send + Sync {
    /// Append a record.
    async fn append(&self, record: &ExecutionLogRecord) -> Result<()>;
}

/// Serialize `value` and cut it to `max_chars` characters.
pub fn truncate_body(value: &serde_json::Value, max_chars: usize) -> Option<String> {
    if value.is_null() {
        return None;
    }
    let text = match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    Some(truncate_chars(&text, max_chars))
}

/// Cut `text` to at most `max_chars` characters on a char boundary.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        None => text.to_string(),
        Some((end, _)) => format!("{}{}", &text[..end], TRUNCATION_MARKER),
    }
}

/// Writes records as newline-delimited JSON to an `AsyncWrite` sink.
pub struct JsonLinesAuditSink<W: AsyncWrite + Unpin + Send> {
    writer: tokio::sync::Mutex<W>,
}

impl<W: AsyncWrite + Unpin + Send> JsonLinesAuditSink<W> {
    /// Create a sink writing to `writer`.
    pub fn new(writer: W) -> Self {
        Self {
            writer: tokio::sync::Mutex::new(writer),
        }
    }

    /// Recover the writer.
    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

#[async_trait::async_trait]
impl<W: AsyncWrite + Unpin + Send + 'static> AuditSink for JsonLinesAuditSink<W> {
    async fn append(&self, record: &ExecutionLogRecord) -> Result<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let mut writer = self.writer.lock().await;
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }
}

/// Keeps records in memory.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<ExecutionLogRecord>>,
}

impl MemoryAuditSink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records appended so far.
    pub fn records(&self) -> Vec<ExecutionLogRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait::async_trait]
impl AuditSink for MemoryAuditSink {
    async fn append(&self, record: &ExecutionLogRecord) -> Result<()> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record.clone());
        Ok(())
    }
}

/// Emits each record as a `tracing` event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

#[async_trait::async_trait]
impl AuditSink for TracingAuditSink {
    async fn append(&self, record: &ExecutionLogRecord) -> Result<()> {
        tracing::info!(
            target: "endpoint_sandbox::audit",
            endpoint_id = %record.endpoint_id,
            execution_id = record.execution_id.as_deref().unwrap_or("-"),
            user_id = %record.user_id,
            method = %record.method,
            path = %record.path,
            status = record.status_code,
            duration_ms = record.duration_ms,
            error = record.error.as_deref().unwrap_or(""),
            "execution"
        );
        Ok(())
    }
}
