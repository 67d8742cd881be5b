//! Error types for the endpoint sandbox.

use std::time::Duration;

use thiserror::Error;

/// Coarse classification of [`SandboxError`] used by callers that only care
/// about which stage rejected a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Rejected before any resource was used.
    Validation,
    /// Caller lacks access to the endpoint or collection.
    AccessDenied,
    /// Per-user hourly ceiling reached.
    RateLimited,
    /// Environment ceiling reached.
    ResourceExhausted,
    /// Deadline exceeded; the environment was force-destroyed.
    Timeout,
    /// User code failed.
    Runtime,
    /// A save directive could not be applied.
    Persistence,
    /// Everything else.
    Internal,
}

/// Errors that can occur while validating, executing or persisting.
#[derive(Error, Debug)]
pub enum SandboxError {
    /// The code was rejected by the pre-execution validator.
    #[error("code validation failed at `{construct}`: {reason}")]
    Validation {
        /// The offending construct (pattern, keyword or literal).
        construct: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The caller may not edit the endpoint's project or the collection.
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// The caller exceeded the hourly execution ceiling.
    #[error("rate limit exceeded: {limit} executions per hour")]
    RateLimitExceeded {
        /// Configured hourly ceiling.
        limit: usize,
    },

    /// The live environment ceiling was reached.
    #[error("resource exhausted: {active} of {max} environments in use")]
    ResourceExhausted {
        /// Environments alive when the attempt was made.
        active: usize,
        /// Configured ceiling.
        max: usize,
    },

    /// The execution exceeded the configured timeout.
    #[error("execution timed out after {0:?}")]
    Timeout(Duration),

    /// The execution exceeded memory limits.
    #[error("memory limit exceeded: {0}")]
    MemoryLimitExceeded(String),

    /// Heavy isolation was required but the backend is unhealthy.
    #[error("heavy isolation unavailable: {0}")]
    IsolationUnavailable(String),

    /// Failed to initialize the Wasm runtime.
    #[error("failed to initialize runtime: {0}")]
    RuntimeInit(#[source] anyhow::Error),

    /// Failed to load or instantiate the script interpreter module.
    #[error("failed to load script interpreter: {0}")]
    ModuleLoad(#[source] anyhow::Error),

    /// The interpreter wasm file was not found.
    #[error("script interpreter wasm not found at: {0}")]
    InterpreterNotFound(String),

    /// The container backend failed.
    #[error("environment backend error: {0}")]
    Backend(#[source] anyhow::Error),

    /// The execution failed outside of user code.
    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    /// An exception escaped the harness.
    #[error("{exception_type}: {message}")]
    ScriptException {
        /// The exception constructor name (e.g. "TypeError").
        exception_type: String,
        /// The exception message.
        message: String,
        /// The stack trace, if the interpreter printed one.
        stack: Option<String>,
    },

    /// Execution ran out of fuel (instruction limit).
    #[error("execution ran out of fuel after {consumed:?} instructions")]
    OutOfFuel {
        /// Number of instructions consumed before running out.
        consumed: Option<u64>,
    },

    /// Applying a save directive failed.
    #[error("persistence failed: {0}")]
    Persistence(String),

    /// A referenced record does not exist.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Record type ("endpoint", "collection", ...).
        kind: &'static str,
        /// The identifier that was looked up.
        id: String,
    },

    /// I/O error during execution.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization of bindings or results failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Invariant violation inside the engine.
    #[error("internal error: {0}")]
    Internal(String),
}

impl SandboxError {
    /// Build a validation error.
    pub fn validation(construct: impl Into<String>, reason: impl Into<String>) -> Self {
        SandboxError::Validation {
            construct: construct.into(),
            reason: reason.into(),
        }
    }

    /// Classify the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SandboxError::Validation { .. } => ErrorKind::Validation,
            SandboxError::AccessDenied(_) => ErrorKind::AccessDenied,
            SandboxError::RateLimitExceeded { .. } => ErrorKind::RateLimited,
            SandboxError::ResourceExhausted { .. } | SandboxError::IsolationUnavailable(_) => {
                ErrorKind::ResourceExhausted
            }
            SandboxError::Timeout(_) => ErrorKind::Timeout,
            SandboxError::ScriptException { .. }
            | SandboxError::MemoryLimitExceeded(_)
            | SandboxError::OutOfFuel { .. } => ErrorKind::Runtime,
            SandboxError::Persistence(_) => ErrorKind::Persistence,
            _ => ErrorKind::Internal,
        }
    }

    /// Stable error code reported to callers.
    pub fn code(&self) -> &'static str {
        match self {
            SandboxError::Validation { .. } => "CODE_VALIDATION_FAILED",
            SandboxError::AccessDenied(_) => "ACCESS_DENIED",
            SandboxError::RateLimitExceeded { .. } => "RATE_LIMIT_EXCEEDED",
            SandboxError::ResourceExhausted { .. } => "RESOURCE_EXHAUSTED",
            SandboxError::IsolationUnavailable(_) => "ISOLATION_UNAVAILABLE",
            SandboxError::Timeout(_) => "EXECUTION_TIMEOUT",
            SandboxError::NotFound { .. } => "NOT_FOUND",
            _ => match self.kind() {
                ErrorKind::Runtime => "RUNTIME_ERROR",
                ErrorKind::Persistence => "PERSISTENCE_ERROR",
                _ => "INTERNAL_ERROR",
            },
        }
    }

    /// HTTP status recorded in the execution log for this failure.
    pub fn status_code(&self) -> u16 {
        match self {
            SandboxError::Validation { .. } => 400,
            SandboxError::AccessDenied(_) => 403,
            SandboxError::NotFound { .. } => 404,
            SandboxError::RateLimitExceeded { .. } => 429,
            SandboxError::ResourceExhausted { .. } | SandboxError::IsolationUnavailable(_) => 503,
            SandboxError::Timeout(_) => 504,
            _ => 500,
        }
    }

    /// Check if this error represents a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, SandboxError::Timeout(_))
    }

    /// Check if this error was raised by the validator.
    pub fn is_validation(&self) -> bool {
        matches!(self, SandboxError::Validation { .. })
    }

    /// Check if this error represents a memory limit exceeded.
    pub fn is_memory_limit(&self) -> bool {
        matches!(self, SandboxError::MemoryLimitExceeded(_))
    }

    /// Check if this error represents the environment ceiling.
    pub fn is_resource_exhausted(&self) -> bool {
        matches!(self, SandboxError::ResourceExhausted { .. })
    }

    /// Check if this error represents a script exception.
    pub fn is_script_exception(&self) -> bool {
        matches!(self, SandboxError::ScriptException { .. })
    }
}

/// Result type alias for sandbox operations.
pub type Result<T> = std::result::Result<T, SandboxError>;

/// Parse a script exception from interpreter stderr output.
///
/// Both QuickJS and Node print the exception as `Name: message` followed by
/// indented `at ...` frames. Node prefixes the source excerpt, so the first
/// line that looks like an exception wins.
pub fn parse_script_exception(stderr: &str) -> Option<SandboxError> {
    if stderr.trim().is_empty() {
        return None;
    }

    let lines: Vec<&str> = stderr.lines().collect();
    let (idx, line) = lines
        .iter()
        .enumerate()
        .find(|(_, line)| looks_like_exception(line))?;

    let (exception_type, message) = match line.find(':') {
        Some(colon) => (
            line[..colon].trim().to_string(),
            line[colon + 1..].trim().to_string(),
        ),
        None => (line.trim().to_string(), String::new()),
    };

    let frames: Vec<&str> = lines[idx + 1..]
        .iter()
        .take_while(|l| l.trim_start().starts_with("at "))
        .copied()
        .collect();
    let stack = if frames.is_empty() {
        None
    } else {
        Some(frames.join("\n"))
    };

    Some(SandboxError::ScriptException {
        exception_type,
        message,
        stack,
    })
}

/// Check if a line looks like a thrown JavaScript error.
fn looks_like_exception(line: &str) -> bool {
    let standalone = ["InternalError", "AggregateError"];

    if !line
        .chars()
        .next()
        .map(|c| c.is_ascii_uppercase())
        .unwrap_or(false)
    {
        return false;
    }

    let name = line.split(':').next().unwrap_or(line).trim();
    if name.contains(' ') {
        return false;
    }

    name.ends_with("Error") || name.ends_with("Exception") || standalone.contains(&name)
}
