//! Purpose: Library crate behind the `sgmcp` binary: an MCP tool server for code search.
//! Exports: `mcp` (protocol + transport), `tools`, `pipeline`, `cache`, `overflow`,
//! `telemetry`, `config`, `server`, and the shared `Error` type.
//! Role: Internal library backing the binary and its integration tests.
//! Invariants: Handler failures become JSON-RPC error replies; they never end the process.
//! Invariants: Only transport-level failures (stdout write errors, bad config) are fatal.
pub mod cache;
pub mod config;
pub mod core;
pub mod mcp;
pub mod overflow;
pub mod pipeline;
pub mod server;
pub mod telemetry;
pub mod tools;

pub use crate::core::error::{Error, ErrorKind, to_exit_code};
