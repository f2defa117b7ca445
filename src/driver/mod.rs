//! Adapter boundary to the engine that actually hosts runtimes.
//!
//! The orchestrator only sees the fixed types in this module. Anything
//! engine-specific (container names, process groups, CLI output formats)
//! stays behind [`RuntimeDriver`].

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::process::Child;
use uuid::Uuid;

use crate::config::{Config, DriverKind, ResourceSpec};
use crate::files::FileMap;

pub mod docker;
pub mod local;

pub use docker::DockerDriver;
pub use local::LocalDriver;

/// Identifies a runtime inside the driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeHandle {
    pub id: String,
    /// Host port the runtime's dev server is reachable on.
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct CreateSpec {
    pub tenant_id: String,
    pub runtime_id: Uuid,
    pub port: u16,
    pub resources: ResourceSpec,
}

#[derive(Debug, Clone, Default)]
pub struct SpawnRequest {
    /// Shell command line, run through `sh -c`.
    pub command: String,
    pub env: BTreeMap<String, String>,
    /// Working directory relative to the runtime's workspace root.
    pub cwd: Option<String>,
}

/// A process started inside a runtime. Stdout and stderr are piped.
#[derive(Debug)]
pub struct Spawned {
    pub exec_id: String,
    pub child: Child,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeStats {
    pub cpu_percent: f64,
    pub memory_bytes: u64,
    pub memory_limit_bytes: Option<u64>,
}

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    /// The engine cannot be reached at all.
    #[error("{0}")]
    Unavailable(String),
    #[error("{op}: {message}")]
    Failed { op: &'static str, message: String },
    #[error("{op} timed out after {}ms", after.as_millis())]
    Timeout { op: &'static str, after: Duration },
}

impl DriverError {
    pub fn failed(op: &'static str, message: impl Into<String>) -> Self {
        Self::Failed {
            op,
            message: message.into(),
        }
    }
}

pub type DriverResult<T> = std::result::Result<T, DriverError>;

#[async_trait]
pub trait RuntimeDriver: Send + Sync {
    /// Short backend name for logs and `/health`.
    fn name(&self) -> &'static str;

    /// Cheap reachability check of the engine.
    async fn ping(&self) -> DriverResult<()>;

    async fn create(&self, spec: &CreateSpec) -> DriverResult<RuntimeHandle>;

    async fn start(&self, handle: &RuntimeHandle) -> DriverResult<()>;

    /// Stop everything running in the runtime. Stopping a stopped or missing
    /// runtime succeeds.
    async fn stop(&self, handle: &RuntimeHandle) -> DriverResult<()>;

    /// Delete the runtime and its files. Removing a missing runtime succeeds.
    async fn remove(&self, handle: &RuntimeHandle) -> DriverResult<()>;

    async fn write_files(&self, handle: &RuntimeHandle, files: &FileMap) -> DriverResult<()>;

    async fn read_file(&self, handle: &RuntimeHandle, path: &str) -> DriverResult<String>;

    /// Start `request.command` inside the runtime with piped stdout/stderr.
    async fn spawn(&self, handle: &RuntimeHandle, request: &SpawnRequest)
        -> DriverResult<Spawned>;

    /// Force-kill a spawned command and everything it started.
    async fn kill(&self, handle: &RuntimeHandle, spawned: &mut Spawned) -> DriverResult<()>;

    async fn stats(&self, handle: &RuntimeHandle) -> DriverResult<RuntimeStats>;
}

/// Run a driver call under a deadline.
pub async fn with_timeout<T, F>(op: &'static str, after: Duration, fut: F) -> DriverResult<T>
where
    F: Future<Output = DriverResult<T>>,
{
    match tokio::time::timeout(after, fut).await {
        Ok(res) => res,
        Err(_) => Err(DriverError::Timeout { op, after }),
    }
}

/// Build the driver selected by the configuration.
pub fn from_config(config: &Config) -> Arc<dyn RuntimeDriver> {
    match config.driver {
        DriverKind::Local => Arc::new(LocalDriver::new(config.work_root.clone())),
        DriverKind::Docker => Arc::new(DockerDriver::new(
            config.docker_image.clone(),
            config.container_port,
        )),
    }
}

/// Lowercase alphanumerics and dashes, safe for directory and container names.
pub(crate) fn sanitize_name(raw: &str) -> String {
    let mut out: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    out.truncate(40);
    let trimmed = out.trim_matches('-');
    if trimmed.is_empty() {
        "tenant".to_string()
    } else {
        trimmed.to_string()
    }
}

pub(crate) fn runtime_name(spec: &CreateSpec) -> String {
    let short = spec.runtime_id.simple().to_string();
    format!("runbox-{}-{}", sanitize_name(&spec.tenant_id), &short[..8])
}
