//! Execution harness and context binding.
//!
//! User code never gets spliced into program text. Each strategy runs a fixed
//! harness script and receives a single JSON document on stdin holding the
//! user code, the capability lists and the [`ContextBindings`]. The harness
//! compiles the code as the strict-mode body of an `async function` whose
//! parameters are exactly [`SANDBOX_BINDINGS`] followed by
//! [`SHADOWED_GLOBALS`]; the latter are always passed `undefined`.
//!
//! Before the user function exists the harness deletes [`REMOVED_GLOBALS`]
//! from the global object and seals the `constructor` of every function
//! prototype, so no string can be compiled into code from inside. The whole
//! harness runs in one closure; user code, compiled in the global scope,
//! cannot see the harness's own locals.
//!
//! Trust boundary: everything in [`HarnessInput`] is produced by the host
//! through `serde_json`, so no caller-controlled value is ever parsed as
//! JavaScript except `code` itself, and that only as a function body.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

use crate::error::Result;
use crate::types::{RequestDescriptor, Strategy};

/// Symbols reachable from user code, in parameter order.
pub const SANDBOX_BINDINGS: &[&str] = &[
    "mockData",
    "env",
    "req",
    "res",
    "console",
    "saveData",
    "generateId",
    "generateToken",
    "timestamp",
];

/// Globals masked as `undefined` inside the user function.
pub const SHADOWED_GLOBALS: &[&str] = &[
    "require",
    "process",
    "module",
    "exports",
    "globalThis",
    "global",
    "self",
    "std",
    "os",
    "Function",
    "fetch",
    "XMLHttpRequest",
    "WebSocket",
    "Deno",
    "Bun",
    "Buffer",
    "print",
    "scriptArgs",
    "__filename",
    "__dirname",
];

/// Host capabilities deleted from the global object before user code is
/// compiled.
pub const REMOVED_GLOBALS: &[&str] = &[
    "require",
    "process",
    "module",
    "exports",
    "std",
    "os",
    "Function",
    "eval",
    "fetch",
    "XMLHttpRequest",
    "WebSocket",
    "Deno",
    "Bun",
    "Buffer",
    "print",
    "scriptArgs",
    "__filename",
    "__dirname",
];

/// Key under which the harness reports a pending save.
pub const SAVE_DIRECTIVE_KEY: &str = "__saveDirective";

/// Marker key identifying the harness envelope on stdout.
pub const ENVELOPE_KEY: &str = "__envelope";

/// Values bound into the sandbox, keyed by binding name.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextBindings {
    /// Items of the selected mock-data collection (read-only inside).
    pub mock_data: Value,
    /// Resolved environment variables.
    pub env: BTreeMap<String, String>,
    /// Inbound request descriptor.
    pub req: RequestDescriptor,
    /// Collection the save helper targets by default.
    pub collection_id: Option<String>,
    /// Identifier stamped on save directives.
    pub execution_id: String,
    /// Console lines kept before further output is dropped.
    pub max_log_lines: usize,
}

/// The document written to the harness's stdin.
#[derive(Debug, Serialize)]
pub struct HarnessInput<'a> {
    code: &'a str,
    allowed: &'static [&'static str],
    shadowed: &'static [&'static str],
    removed: &'static [&'static str],
    bindings: &'a ContextBindings,
}

/// A harness script plus its stdin payload, ready for a strategy to run.
#[derive(Debug, Clone)]
pub struct Program {
    /// Strategy the harness was built for.
    pub strategy: Strategy,
    /// Harness source passed to the interpreter.
    pub source: String,
    /// JSON document for stdin.
    pub input: String,
}

impl Program {
    /// Build the program for `strategy`.
    pub fn build(strategy: Strategy, code: &str, bindings: &ContextBindings) -> Result<Self> {
        let input = serde_json::to_string(&HarnessInput {
            code,
            allowed: SANDBOX_BINDINGS,
            shadowed: SHADOWED_GLOBALS,
            removed: REMOVED_GLOBALS,
            bindings,
        })?;

        let prologue = match strategy {
            Strategy::Light => LIGHT_PROLOGUE,
            Strategy::Heavy => HEAVY_PROLOGUE,
        };

        Ok(Self {
            strategy,
            source: format!("(() => {{\n\"use strict\";\n{}{}}})();\n", prologue, HARNESS_BODY),
            input,
        })
    }
}

/// QuickJS (`qjs --std`): read stdin and keep a handle on stdout.
const LIGHT_PROLOGUE: &str = r#"
const __input = std.in.readAsString();
const __out = std.out;
const __emit = (line) => { __out.puts(line); __out.puts("\n"); __out.flush(); };
"#;

/// Node (`node -e`): read stdin and bind stdout while `require` and
/// `process` still exist.
const HEAVY_PROLOGUE: &str = r#"
const __input = require("fs").readFileSync(0, "utf8");
const __stdout = process.stdout;
const __write = __stdout.write.bind(__stdout);
const __emit = (line) => { __write(line + "\n"); };
"#;

const HARNESS_BODY: &str = r#"
const __in = JSON.parse(__input);
const __ctx = __in.bindings;
const __stringify = JSON.stringify;
const __logs = [];
const __maxLogs = __ctx.maxLogLines || 100;
let __save = null;

const AsyncFunction = Object.getPrototypeOf(async function () {}).constructor;
const __prototypes = [
  Object.getPrototypeOf(function () {}),
  Object.getPrototypeOf(async function () {}),
  Object.getPrototypeOf(function* () {}),
  Object.getPrototypeOf(async function* () {}),
];

const __fmt = (args) => args.map((v) => {
  if (typeof v === "string") return v;
  try { return __stringify(v); } catch (_) { return String(v); }
}).join(" ");
const __level = (level) => (...args) => {
  if (__logs.length >= __maxLogs) return;
  __logs.push(level === "log" ? __fmt(args) : "[" + level + "] " + __fmt(args));
};
const __freeze = (o) => {
  if (o !== null && typeof o === "object" && !Object.isFrozen(o)) {
    Object.freeze(o);
    Object.keys(o).forEach((k) => __freeze(o[k]));
  }
  return o;
};
const __hex = (n) => {
  let s = "";
  for (let i = 0; i < n; i++) s += Math.floor(Math.random() * 16).toString(16);
  return s;
};
const __reply = (statusCode, body) => ({ statusCode, body });

const __scope = {
  mockData: __freeze(__ctx.mockData == null ? [] : __ctx.mockData),
  env: __freeze(__ctx.env || {}),
  req: __freeze(__ctx.req || {}),
  res: Object.freeze({
    json: (body, status) => __reply(status === undefined ? 200 : status, body),
    send: (body) => __reply(200, body),
    status: (code) => Object.freeze({
      json: (body) => __reply(code, body),
      send: (body) => __reply(code, body),
    }),
  }),
  console: Object.freeze({
    log: __level("log"), info: __level("info"), warn: __level("warn"),
    error: __level("error"), debug: __level("debug"),
  }),
  saveData: async (first, second) => {
    const items = second === undefined ? first : second;
    const target = second === undefined ? null : first;
    if (!Array.isArray(items)) throw new TypeError("saveData expects an array of items");
    __save = {
      collectionId: target == null ? (__ctx.collectionId == null ? null : __ctx.collectionId) : String(target),
      items: JSON.parse(__stringify(items)),
      executionId: __ctx.executionId,
    };
    return { success: true, pending: true, count: items.length };
  },
  generateId: () => __hex(8) + "-" + __hex(4) + "-4" + __hex(3) + "-" + __hex(4) + "-" + __hex(12),
  generateToken: (length) => __hex(length || 32),
  timestamp: () => new Date().toISOString(),
};

const __finish = (success, data, error) => {
  const envelope = { __envelope: 1, success, data: data === undefined ? null : data, error, logs: __logs };
  if (success && __save !== null) envelope.__saveDirective = __save;
  let line;
  try {
    line = __stringify(envelope);
  } catch (e) {
    line = __stringify({ __envelope: 1, success: false, data: null, error: "result is not serializable: " + e.message, logs: __logs });
  }
  __emit(line);
};
const __describe = (err) => (err instanceof Error ? err.name + ": " + err.message : String(err));

for (const name of __in.removed) {
  try { delete globalThis[name]; } catch (_) {}
}
const __sealed = __prototypes.every((proto) => {
  try {
    Object.defineProperty(proto, "constructor", { value: undefined, writable: false, configurable: false });
  } catch (_) {}
  return proto.constructor === undefined;
});
if (!__sealed) {
  __finish(false, null, "SecurityError: function constructors could not be sealed");
  return;
}

const __dynamicImport = /\bimport\s*\(/;
const __uncommented = __in.code.replace(/\/\*[\s\S]*?\*\//g, " ").replace(/\/\/[^\n]*/g, " ");
if (__dynamicImport.test(__in.code) || __dynamicImport.test(__uncommented)) {
  __finish(false, null, "SecurityError: dynamic import is not available inside the sandbox");
  return;
}

let __fn;
try {
  __fn = new AsyncFunction(...__in.allowed, ...__in.shadowed, "\"use strict\";\n" + __in.code);
} catch (err) {
  __finish(false, null, __describe(err));
  return;
}
__fn(...__in.allowed.map((name) => __scope[name])).then(
  (data) => __finish(true, data, null),
  (err) => __finish(false, null, __describe(err)),
);
"#;
