//! Pre-execution code validator.
//!
//! This is a cheap pre-filter that runs before any environment is allocated.
//! The authoritative boundary is the capability allow-list in
//! [`harness`](crate::sandbox::harness): only the symbols listed there are
//! reachable from user code, whatever this filter lets through.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::{Result, SandboxError};
use crate::sandbox::config::SandboxConfig;

/// A deny-list rule: a compiled pattern and the category it blocks.
struct DeniedPattern {
    regex: Regex,
    category: &'static str,
}

const DENY_LIST: &[(&str, &str)] = &[
    // filesystem access
    (r"\brequire\s*\(", "module loading"),
    (r"\bfs\s*\.", "filesystem access"),
    (r"\b(readFile|writeFile|readdir|unlink|mkdir|rmdir)(Sync)?\s*\(", "filesystem access"),
    (r"\bstd\s*\.\s*(open|popen|loadFile|fdopen|tmpfile)", "filesystem access"),
    // process control
    (r"\bprocess\s*\.", "process control"),
    (r"\bchild_process\b", "process control"),
    (r"\bos\s*\.\s*(exec|kill|signal|setReadHandler)", "process control"),
    // dynamic code construction
    (r"\beval\s*\(", "dynamic code construction"),
    (r"\bnew\s+Function\b", "dynamic code construction"),
    (r"\bFunction\s*\(", "dynamic code construction"),
    (r"\bimport\s*\(", "dynamic import"),
    (r"constructor\s*\.\s*constructor", "dynamic code construction"),
    (r"constructor\s*\[", "dynamic code construction"),
    (r"\.\s*constructor\s*\(", "dynamic code construction"),
    (r"\[\s*[\x22'`]constructor[\x22'`]\s*\]", "dynamic code construction"),
    (r"__proto__", "prototype pollution"),
    (r"\bReflect\s*\.", "reflection"),
    (r"\bglobalThis\s*\[", "dynamic global access"),
    // raw network primitives
    (r"\bfetch\s*\(", "network access"),
    (r"\bXMLHttpRequest\b", "network access"),
    (r"\bWebSocket\b", "network access"),
    (r"\b(net|http|https|dgram|tls)\s*\.\s*(connect|request|get|createServer|createSocket)", "network access"),
    // unbounded loop idioms
    (r"\bwhile\s*\(\s*(true|1)\s*\)", "unbounded loop"),
    (r"\bfor\s*\(\s*;\s*;\s*\)", "unbounded loop"),
    (r"\bdo\s*\{[\s\S]*?\}\s*while\s*\(\s*(true|1)\s*\)", "unbounded loop"),
];

static DENIED: LazyLock<Vec<DeniedPattern>> = LazyLock::new(|| {
    DENY_LIST
        .iter()
        .filter_map(|(pattern, category)| {
            Regex::new(pattern).ok().map(|regex| DeniedPattern {
                regex,
                category: *category,
            })
        })
        .collect()
});

static COMMENT: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"/\*[\s\S]*?\*/|//[^\n]*").ok());

/// `code` with comments blanked, so `import/**/(` reads as `import (`.
fn uncommented(code: &str) -> Option<String> {
    let comment = COMMENT.as_ref()?;
    comment
        .is_match(code)
        .then(|| comment.replace_all(code, " ").into_owned())
}

static LOOP_KEYWORD: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\b(for|while)\s*\(|\bdo\s*\{|\.forEach\s*\(").ok());

static STATIC_ALLOCATION: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(
        r"(new\s+Array\s*\(\s*|Array\s*\(\s*|\.repeat\s*\(\s*|Buffer\s*\.\s*alloc(Unsafe)?\s*\(\s*|new\s+(Uint8|Int8|Uint16|Int16|Uint32|Int32|Float32|Float64)Array\s*\(\s*|new\s+ArrayBuffer\s*\(\s*)(?P<size>\d[\d_]*(\.\d+)?(e\d+)?)",
    )
    .ok()
});

/// Limits enforced by [`validate_code`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidationLimits {
    /// Maximum code length in characters.
    pub max_length: usize,
    /// Maximum number of loop constructs.
    pub max_loops: usize,
    /// Largest static allocation literal.
    pub max_static_allocation: u64,
}

impl Default for ValidationLimits {
    fn default() -> Self {
        Self::from(&SandboxConfig::default())
    }
}

impl From<&SandboxConfig> for ValidationLimits {
    fn from(config: &SandboxConfig) -> Self {
        Self {
            max_length: config.max_code_length,
            max_loops: config.max_loops,
            max_static_allocation: config.max_static_allocation,
        }
    }
}

/// Validate user code before any environment is allocated.
pub fn validate_code(code: &str, limits: &ValidationLimits) -> Result<()> {
    // 1. Size limit
    let length = code.chars().count();
    if length > limits.max_length {
        return Err(SandboxError::validation(
            format!("{} characters", length),
            format!("code exceeds maximum length of {}", limits.max_length),
        ));
    }

    // 2. Empty code
    if code.trim().is_empty() {
        return Err(SandboxError::validation("<empty>", "code is empty"));
    }

    // 3. Deny-list, over the code as written and with comments blanked
    let stripped = uncommented(code);
    for text in std::iter::once(code).chain(stripped.as_deref()) {
        for denied in DENIED.iter() {
            if let Some(found) = denied.regex.find(text) {
                return Err(SandboxError::validation(
                    found.as_str().trim(),
                    format!("{} is not available inside the sandbox", denied.category),
                ));
            }
        }
    }

    // 4. Loop budget
    if let Some(loops) = LOOP_KEYWORD.as_ref() {
        let count = loops.find_iter(code).count();
        if count > limits.max_loops {
            return Err(SandboxError::validation(
                format!("{} loops", count),
                format!("code contains more than {} loop constructs", limits.max_loops),
            ));
        }
    }

    // 5. Static allocations
    if let Some(alloc) = STATIC_ALLOCATION.as_ref() {
        for caps in alloc.captures_iter(code) {
            let literal = caps.name("size").map(|m| m.as_str()).unwrap_or("0");
            let size = parse_size_literal(literal);
            if size > limits.max_static_allocation as f64 {
                let construct = caps.get(0).map(|m| m.as_str()).unwrap_or(literal);
                return Err(SandboxError::validation(
                    construct.trim(),
                    format!(
                        "static allocation of {} exceeds the limit of {}",
                        literal, limits.max_static_allocation
                    ),
                ));
            }
        }
    }

    Ok(())
}

fn parse_size_literal(literal: &str) -> f64 {
    literal.replace('_', "").parse::<f64>().unwrap_or(f64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> ValidationLimits {
        ValidationLimits::default()
    }

    fn construct_of(err: SandboxError) -> String {
        match err {
            SandboxError::Validation { construct, .. } => construct,
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn accepts_plain_handler() {
        let code = r#"const users = mockData.filter(u => u.active); return res.json({ users }, 200);"#;
        assert!(validate_code(code, &limits()).is_ok());
    }

    #[test]
    fn accepts_async_save() {
        let code = r#"const items = [...mockData, { id: generateId() }]; await saveData(items); return { count: items.length };"#;
        assert!(validate_code(code, &limits()).is_ok());
    }

    #[test]
    fn rejects_empty_code() {
        assert!(validate_code("", &limits()).is_err());
        assert!(validate_code("   \n", &limits()).is_err());
    }

    #[test]
    fn rejects_oversized_code() {
        let big = "x".repeat(60_000);
        let err = validate_code(&big, &limits()).unwrap_err();
        assert!(construct_of(err).contains("60000"));
    }

    #[test]
    fn rejects_eval() {
        let err = validate_code(r#"return eval("1+1");"#, &limits()).unwrap_err();
        assert_eq!(construct_of(err), "eval(");
    }

    #[test]
    fn rejects_filesystem_api() {
        let err = validate_code(r#"const fs = require('fs'); return 1;"#, &limits()).unwrap_err();
        assert!(construct_of(err).starts_with("require"));

        let err = validate_code(r#"return fs.readFileSync('/etc/passwd');"#, &limits()).unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn rejects_function_constructor() {
        assert!(validate_code(r#"return new Function("return 1")();"#, &limits()).is_err());
        assert!(validate_code(r#"return (()=>1).constructor.constructor("x")();"#, &limits()).is_err());
        assert!(validate_code(r#"const g = (() => 0).constructor("return this")(); return g;"#, &limits()).is_err());
        assert!(validate_code(r#"const F = (() => 0)["constructor"]; return F("x")();"#, &limits()).is_err());
    }

    #[test]
    fn comments_do_not_hide_denied_calls() {
        let err = validate_code("return import/* x */('std');", &limits()).unwrap_err();
        assert_eq!(construct_of(err), "import (");
        assert!(validate_code("return import// x\n('os');", &limits()).is_err());
        assert!(validate_code("return eval/**/('1');", &limits()).is_err());
    }

    #[test]
    fn urls_in_strings_still_validate() {
        let code = r#"return res.json({ api: "https://api.example.test/v1" });"#;
        assert!(validate_code(code, &limits()).is_ok());
    }

    #[test]
    fn rejects_network_and_process() {
        assert!(validate_code(r#"return fetch("http://evil");"#, &limits()).is_err());
        assert!(validate_code(r#"return process.env.SECRET;"#, &limits()).is_err());
        assert!(validate_code(r#"const ws = new WebSocket("ws://x");"#, &limits()).is_err());
    }

    #[test]
    fn accepts_lookalike_identifiers() {
        // identifiers that merely contain a denied name
        let code = r#"const prefs = { x: 1 }; const reprocess = (v) => v; return reprocess(prefs.x);"#;
        assert!(validate_code(code, &limits()).is_ok());
    }

    #[test]
    fn rejects_unbounded_loops() {
        assert!(validate_code("while (true) {}", &limits()).is_err());
        assert!(validate_code("for (;;) { }", &limits()).is_err());
    }

    #[test]
    fn rejects_too_many_loops() {
        let code = "for (let i = 0; i < 2; i++) {}\n".repeat(11);
        let err = validate_code(&code, &limits()).unwrap_err();
        assert_eq!(construct_of(err), "11 loops");

        let code = "for (let i = 0; i < 2; i++) {}\n".repeat(10);
        assert!(validate_code(&code, &limits()).is_ok());
    }

    #[test]
    fn rejects_large_static_allocations() {
        assert!(validate_code("const a = new Array(50000000); return a.length;", &limits()).is_err());
        assert!(validate_code("return 'x'.repeat(1e9);", &limits()).is_err());
        assert!(validate_code("const a = new Array(100); return a.length;", &limits()).is_ok());
    }

    #[test]
    fn custom_max_length() {
        let code = "return 1;".repeat(20);
        let tight = ValidationLimits {
            max_length: 50,
            ..limits()
        };
        assert!(validate_code(&code, &tight).is_err());
        assert!(validate_code(&code, &limits()).is_ok());
    }
}
