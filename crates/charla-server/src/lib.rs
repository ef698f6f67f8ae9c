//! charla-server
//!
//! Multi-client TCP chat server: one task per connection, shared client
//! and user registries, graceful drain on shutdown.

pub mod config;
pub mod context;
pub mod server;

// these are internal modules, not re-exported
mod delivery;
mod service;

pub use config::Config;
pub use context::ServerContext;
pub use server::Server;
