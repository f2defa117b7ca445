//! runbox: per-tenant ephemeral dev runtimes behind an HTTP API.
//!
//! A tenant asks for a runtime, gets a port and a preview URL, runs commands
//! in it and watches its status over server-sent events. Idle runtimes are
//! reaped.

#[cfg(not(unix))]
compile_error!("runbox only works on Unix-like systems.");

pub mod boot;
pub mod broadcast;
pub mod config;
pub mod driver;
pub mod error;
pub mod executor;
pub mod files;
pub mod http_server;
pub mod lifecycle;
pub mod ports;
pub mod reaper;
pub mod registry;
pub mod service;
pub mod state;
pub mod store;

pub use config::{Config, DriverKind, ResourceSpec};
pub use error::{Result, RunboxError};
pub use service::Service;
