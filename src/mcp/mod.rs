//! Model Context Protocol transport (§4.E) — JSON-RPC 2.0 over a single
//! `POST /mcp` endpoint, session-scoped via the `mcp-session-id` header.

pub mod server;
pub mod tools;
