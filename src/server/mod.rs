//! Server core functionality
//!
//! The listener and accept loop, plus the shared context every connection
//! is handed.

pub mod context;
pub mod core;

pub use context::ServerContext;
pub use core::{Server, serve_stream};
