//! `mcporter-client` — MCP (Model Context Protocol) wire client.
//!
//! This crate provides:
//! - JSON-RPC 2.0 protocol types for the MCP conversation.
//! - Three transports: a stdio child process with supervised teardown, a
//!   streamable HTTP client, and an SSE client.
//! - An [`McpClient`] that performs the MCP handshake and exposes typed
//!   `list_tools` / `call_tool` / `list_resources` operations.
//!
//! # Usage
//!
//! ```rust,ignore
//! use mcporter_client::{McpClient, StdioTransport};
//!
//! let transport = StdioTransport::spawn("npx", &args, &cwd, env)?;
//! let client = McpClient::new(Box::new(transport), "mcporter");
//! client.connect().await?;
//! for tool in client.list_tools().await? {
//!     println!("{}", tool.name);
//! }
//! client.close().await;
//! ```

pub mod client;
pub mod http;
pub mod protocol;
pub mod reap;
pub mod sse;
pub mod stdio;
pub mod transport;

// Re-exports for convenience.
pub use client::McpClient;
pub use http::StreamableHttpTransport;
pub use protocol::{ToolCallResult, ToolDef};
pub use sse::SseTransport;
pub use stdio::StdioTransport;
pub use transport::{McpTransport, TokenProvider};
