//! `mcporter-runtime` — the long-lived MCP runtime.
//!
//! The [`Runtime`] merges server definitions from the primary mcporter
//! config and foreign editor imports into a single namespace, keeps a pool
//! of connected MCP clients with per-server lifecycle and OAuth state,
//! negotiates transport fallbacks (streamable HTTP → SSE) and authorization
//! (401 → OAuth promotion → browser flow → retry), and guarantees bounded
//! teardown of child processes and network sessions.
//!
//! # Usage
//!
//! ```rust,ignore
//! use mcporter_runtime::Runtime;
//!
//! let runtime = Runtime::builder().load()?;
//! for name in runtime.list_servers() {
//!     let tools = runtime.list_tools(&name, Default::default()).await?;
//!     println!("{name}: {} tools", tools.len());
//! }
//! runtime.close_all().await;
//! ```

pub mod config;
pub mod imports;
pub mod loader;
pub mod oauth;
pub mod orchestrator;
pub mod pool;
pub mod runtime;
pub mod trace;

// Re-exports for convenience.
pub use config::PrimaryConfig;
pub use imports::{ImportKind, ImportRoots};
pub use loader::Loader;
pub use oauth::OauthSession;
pub use runtime::{CallOptions, ConnectOptions, ListToolsOptions, Runtime, RuntimeBuilder, ServerToolInfo};
