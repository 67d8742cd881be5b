//! Completing save directives reported by sandboxed code.
//!
//! The sandbox can only name a target collection and the items. Every
//! identifier the orchestrator already knows comes from the request
//! context, whatever the sandbox reported for it.

use serde::Serialize;

use crate::collaborators::SaveContext;
use crate::types::SaveDirective;

/// Identifiers the orchestrator holds for the current execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthoritativeContext {
    /// Collection chosen by the caller, if any.
    pub collection_id: Option<String>,
    /// Execution id bound into the sandbox.
    pub execution_id: String,
    /// Endpoint that ran.
    pub endpoint_id: String,
    /// Caller.
    pub user_id: String,
    /// Project owning the endpoint.
    pub project_id: String,
}

/// A directive with every field filled in.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedSave {
    /// Target collection.
    pub collection_id: String,
    /// Replacement items.
    pub items: Vec<serde_json::Value>,
    /// Caller.
    pub user_id: String,
    /// Provenance for the store.
    pub context: SaveContext,
    /// The target came from the sandbox rather than the caller, so edit
    /// access on it has not been checked yet.
    pub needs_access_check: bool,
}

/// Why a directive could not be completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IncompleteSave {
    /// Neither the caller nor the sandbox named a collection.
    NoTarget,
}

/// Fill a sandbox-reported directive from the authoritative context.
pub fn complete_directive(
    directive: SaveDirective,
    ctx: &AuthoritativeContext,
) -> Result<CompletedSave, IncompleteSave> {
    let (collection_id, needs_access_check) = match (&ctx.collection_id, directive.collection_id) {
        (Some(known), reported) => {
            if reported.as_deref().is_some_and(|r| r != known) {
                tracing::warn!(
                    requested = %known,
                    reported = reported.as_deref().unwrap_or_default(),
                    "sandbox reported a different save target, using the requested collection"
                );
            }
            (known.clone(), false)
        }
        (None, Some(reported)) => (reported, true),
        (None, None) => return Err(IncompleteSave::NoTarget),
    };

    Ok(CompletedSave {
        collection_id,
        items: directive.items,
        user_id: ctx.user_id.clone(),
        context: SaveContext {
            execution_id: ctx.execution_id.clone(),
            endpoint_id: ctx.endpoint_id.clone(),
            project_id: ctx.project_id.clone(),
        },
        needs_access_check,
    })
}

/// Result of applying one directive, as reported to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveOutcome {
    /// Collection targeted, when known.
    pub collection_id: Option<String>,
    /// Whether the store accepted the save.
    pub success: bool,
    /// New version on success.
    pub version: Option<u64>,
    /// Items stored on success.
    pub item_count: Option<usize>,
    /// Failure reason.
    pub error: Option<String>,
}

/// The `savedData` block of a response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SavedData {
    /// Saves that were persisted.
    pub count: usize,
    /// One entry per directive.
    pub results: Vec<SaveOutcome>,
}

impl SavedData {
    /// Summarize `results`.
    pub fn from_outcomes(results: Vec<SaveOutcome>) -> Self {
        Self {
            count: results.iter().filter(|r| r.success).count(),
            results,
        }
    }
}
