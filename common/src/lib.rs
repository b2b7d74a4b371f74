//! Shared building blocks for the database gateway.
//!
//! - [`errors`]: the error taxonomy every tool call can fail with
//! - [`config`]: process and per-dialect configuration
//! - [`models`]: connect arguments, table structures, query outcomes, tools
//! - [`response`]: the `{success, ...}` result envelope
//! - [`middleware`]: HTTP middleware shared by the transport layer
//! - [`utils`]: id generation and SQL text helpers

pub mod config;
pub mod errors;
pub mod logging;
pub mod middleware;
pub mod models;
pub mod response;
pub mod utils;
