//! # Endpoint Sandbox
//!
//! Sandboxed execution engine for user-authored HTTP endpoint handlers.
//!
//! User code is a JavaScript function body. It runs against a snapshot of a
//! mock-data collection, a set of environment variables and the inbound
//! request, and may ask for the collection to be replaced through a save
//! helper. The crate is split into three layers:
//!
//! - **Environment lifecycle** ([`environment`]): disposable containers with
//!   no network, a read-only root filesystem and memory/CPU/pid ceilings,
//!   behind a global concurrency ceiling, with a sweeper for leaks.
//! - **Code executor** ([`sandbox`]): validation, strategy selection
//!   (in-process QuickJS on wasmtime, or a container), a fixed harness that
//!   binds an allow-listed set of capabilities, output decoding and a
//!   content-addressed result cache.
//! - **Orchestrator** ([`orchestrator`]): authorization, rate limiting,
//!   context building, save-directive completion and persistence, and an
//!   execution log written on every path.
//!
//! ## Example
//!
//! ```rust,ignore
//! use endpoint_sandbox_rs::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = SandboxConfig::from_env()?;
//!
//!     let light = Arc::new(LightStrategy::new(ScriptSandbox::new(&config)?));
//!     let manager = Arc::new(EnvironmentManager::new(
//!         Arc::new(DockerBackend::connect()?),
//!         &config,
//!     ));
//!     let _sweeper = manager.spawn_sweeper();
//!     let heavy = Arc::new(HeavyStrategy::new(Arc::clone(&manager)));
//!
//!     let executor = Arc::new(CodeExecutor::new(&config, light, Some(heavy)));
//!     let orchestrator = Orchestrator::new(config, executor, collaborators())
//!         .with_environment_manager(manager);
//!
//!     let response = orchestrator.execute(invocation).await?;
//!     println!("{}", serde_json::to_string(&response)?);
//!     Ok(())
//! }
//! ```
//!
//! ## Security Model
//!
//! 1. **Validator**: a deny-list pre-filter rejects obviously hostile code
//!    before anything is allocated.
//! 2. **Capability allow-list**: the harness compiles user code as a
//!    function whose only reachable names are the bound capabilities; host
//!    globals are shadowed as `undefined`.
//! 3. **No source templating**: user code and context travel to the
//!    interpreter as JSON on stdin.
//! 4. **Isolation**: Wasm + WASI with no preopens for Light; a locked-down
//!    container for Heavy.
//! 5. **Two-phase saves**: the sandbox can only request a write; the
//!    orchestrator completes the request from authoritative context and
//!    applies it after a successful exit.

pub mod collaborators;
pub mod environment;
pub mod error;
pub mod orchestrator;
pub mod prelude;
pub mod sandbox;
pub mod types;

// Re-export main types at crate root for convenience
pub use environment::{DockerBackend, EnvironmentBackend, EnvironmentManager};
pub use error::{ErrorKind, Result, SandboxError};
pub use orchestrator::{ExecutionResponse, HealthReport, Invocation, Orchestrator};
pub use sandbox::config::{SandboxConfig, SandboxConfigBuilder};
pub use sandbox::executor::CodeExecutor;
pub use types::{ExecutionRequest, ExecutionResult, SaveDirective, Strategy};
