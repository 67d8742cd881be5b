//! I/O capture and output decoding.
//!
//! Both strategies produce raw stdout/stderr. The harness prints a single
//! envelope line, but user code (or the interpreter) may interleave noise, so
//! decoding looks for the last well-formed JSON value rather than trusting
//! the whole stream.

use serde_json::{Deserializer, Value};
use wasmtime_wasi::pipe::{MemoryInputPipe, MemoryOutputPipe};

use crate::error::parse_script_exception;
use crate::sandbox::harness::{ENVELOPE_KEY, SAVE_DIRECTIVE_KEY};
use crate::types::SaveDirective;

/// Upper bound on captured bytes per stream.
pub const MAX_CAPTURED_OUTPUT: usize = 4 * 1024 * 1024;

/// Raw streams captured from one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawOutput {
    /// Captured stdout.
    pub stdout: String,
    /// Captured stderr.
    pub stderr: String,
    /// Exit code (0 for success).
    pub exit_code: i64,
}

impl RawOutput {
    /// Check if the process exited cleanly.
    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

/// What stdout turned out to contain.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedOutput {
    /// The last well-formed JSON value found.
    Json(Value),
    /// No JSON found; the trimmed stdout.
    Opaque(String),
}

impl ParsedOutput {
    /// Convert to a JSON value, carrying opaque output as a string.
    pub fn into_value(self) -> Value {
        match self {
            ParsedOutput::Json(v) => v,
            ParsedOutput::Opaque(s) => Value::String(s),
        }
    }
}

/// Stdio wiring for the in-process Light strategy.
#[derive(Clone)]
pub struct SandboxIo {
    /// Input provided to the harness.
    pub stdin: MemoryInputPipe,
    /// Captured stdout.
    pub stdout: MemoryOutputPipe,
    /// Captured stderr.
    pub stderr: MemoryOutputPipe,
}

impl SandboxIo {
    /// Create the pipes, preloading stdin with `input`.
    pub fn new(input: &str) -> Self {
        Self {
            stdin: MemoryInputPipe::new(input.to_string()),
            stdout: MemoryOutputPipe::new(MAX_CAPTURED_OUTPUT),
            stderr: MemoryOutputPipe::new(MAX_CAPTURED_OUTPUT),
        }
    }

    /// Get the captured stdout as a string.
    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout.contents()).into_owned()
    }

    /// Get the captured stderr as a string.
    pub fn stderr_str(&self) -> String {
        String::from_utf8_lossy(&self.stderr.contents()).into_owned()
    }

    /// Collect both streams with the given exit code.
    pub fn finish(&self, exit_code: i64) -> RawOutput {
        RawOutput {
            stdout: self.stdout_str(),
            stderr: self.stderr_str(),
            exit_code,
        }
    }
}

/// Locate the last well-formed JSON value in `stdout`.
///
/// Top-level values only: a nested object inside a larger document is never
/// returned on its own.
pub fn locate_last_json(stdout: &str) -> ParsedOutput {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return ParsedOutput::Opaque(String::new());
    }
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return ParsedOutput::Json(value);
    }

    let bytes = stdout.as_bytes();
    let mut last = None;
    let mut pos = 0;
    while pos < bytes.len() {
        let Some(offset) = bytes[pos..].iter().position(|b| *b == b'{' || *b == b'[') else {
            break;
        };
        let start = pos + offset;
        let mut stream = Deserializer::from_str(&stdout[start..]).into_iter::<Value>();
        match stream.next() {
            Some(Ok(value)) => {
                last = Some(value);
                pos = start + stream.byte_offset().max(1);
            }
            _ => pos = start + 1,
        }
    }

    match last {
        Some(value) => ParsedOutput::Json(value),
        None => ParsedOutput::Opaque(trimmed.to_string()),
    }
}

/// The harness envelope, or its best reconstruction when the interpreter
/// died before printing one.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedOutput {
    /// User code completed without throwing.
    pub success: bool,
    /// Returned value.
    pub data: Value,
    /// Error description when `success` is false.
    pub error: Option<String>,
    /// Console lines.
    pub logs: Vec<String>,
    /// Pending save reported by the harness.
    pub save_directive: Option<SaveDirective>,
}

/// Decode the result of one run.
pub fn decode_output(raw: &RawOutput, parsed: ParsedOutput) -> DecodedOutput {
    match parsed {
        ParsedOutput::Json(Value::Object(mut envelope)) if envelope.contains_key(ENVELOPE_KEY) => {
            let save_directive = envelope
                .remove(SAVE_DIRECTIVE_KEY)
                .filter(|v| !v.is_null())
                .and_then(|v| serde_json::from_value::<SaveDirective>(v).ok());
            let logs = envelope
                .remove("logs")
                .and_then(|v| serde_json::from_value::<Vec<String>>(v).ok())
                .unwrap_or_default();
            let success = envelope
                .get("success")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            let error = envelope
                .get("error")
                .and_then(Value::as_str)
                .map(str::to_string)
                .or_else(|| (!success).then(|| "execution failed".to_string()));

            DecodedOutput {
                success,
                data: envelope.remove("data").unwrap_or(Value::Null),
                error,
                logs,
                save_directive: if success { save_directive } else { None },
            }
        }
        other if raw.is_success() => DecodedOutput {
            success: true,
            data: other.into_value(),
            error: None,
            logs: stderr_lines(&raw.stderr),
            save_directive: None,
        },
        _ => {
            let error = match parse_script_exception(&raw.stderr) {
                Some(exception) => exception.to_string(),
                None if raw.stderr.trim().is_empty() => {
                    format!("interpreter exited with code {}", raw.exit_code)
                }
                None => raw.stderr.trim().to_string(),
            };
            DecodedOutput {
                success: false,
                data: Value::Null,
                error: Some(error),
                logs: stderr_lines(&raw.stderr),
                save_directive: None,
            }
        }
    }
}

fn stderr_lines(stderr: &str) -> Vec<String> {
    stderr
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(str::to_string)
        .collect()
}
