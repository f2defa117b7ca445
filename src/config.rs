//! Service configuration.
//!
//! Every knob the engine reads lives on [`Config`]. Defaults are spelled out
//! in `Config::default()`; the `serve` subcommand overrides them from flags
//! or `RUNBOX_*` environment variables.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RunboxError};

/// Which engine hosts tenant runtimes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    /// Workspace directories on the host, commands run as local process groups.
    Local,
    /// One Docker container per runtime, driven through the docker CLI.
    Docker,
}

/// CPU and memory caps requested for a runtime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSpec {
    #[serde(default)]
    pub cpus: Option<f64>,
    #[serde(default)]
    pub memory_mb: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Port the HTTP API listens on.
    pub listen_port: u16,
    /// First port handed to runtimes (inclusive).
    pub port_range_start: u16,
    /// Last port handed to runtimes (inclusive).
    pub port_range_end: u16,
    /// Runtimes idle longer than this are evicted by the reaper.
    pub idle_timeout: Duration,
    /// How often the reaper sweeps the registry.
    pub reaper_interval: Duration,
    /// How often subscribers receive a `ping`.
    pub heartbeat_interval: Duration,
    /// Overall deadline for creating a runtime, rollback included.
    pub create_timeout: Duration,
    /// Overall deadline for tearing a runtime down.
    pub remove_timeout: Duration,
    /// Deadline applied to each individual driver call.
    pub driver_timeout: Duration,
    /// Timeout for blocking exec calls that do not carry their own.
    pub exec_default_timeout: Duration,
    /// Per-stream cap on captured output of a blocking exec.
    pub max_output_bytes: usize,
    pub default_cpus: f64,
    pub default_memory_mb: u64,
    pub max_cpus: f64,
    pub max_memory_mb: u64,
    /// Log lines retained per tenant for cursor-based tailing.
    pub log_buffer_lines: usize,
    /// Events buffered per tenant channel before slow subscribers lag.
    pub subscriber_buffer: usize,
    pub driver: DriverKind,
    /// Root directory for local runtime workspaces.
    pub work_root: PathBuf,
    /// Image used by the docker driver.
    pub docker_image: String,
    /// Port the dev server listens on inside a container.
    pub container_port: u16,
    /// Host name used when building preview URLs.
    pub public_host: String,
    /// Run the install + dev server sequence after a runtime is created.
    pub boot: bool,
    pub install_command: String,
    pub dev_command: String,
    /// How long to wait for the dev server to answer HTTP.
    pub ready_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_port: 8080,
            port_range_start: 4000,
            port_range_end: 5000,
            idle_timeout: Duration::from_secs(30 * 60),
            reaper_interval: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(15),
            create_timeout: Duration::from_secs(120),
            remove_timeout: Duration::from_secs(30),
            driver_timeout: Duration::from_secs(60),
            exec_default_timeout: Duration::from_secs(300),
            max_output_bytes: 1024 * 1024,
            default_cpus: 1.0,
            default_memory_mb: 512,
            max_cpus: 2.0,
            max_memory_mb: 2048,
            log_buffer_lines: 1000,
            subscriber_buffer: 256,
            driver: DriverKind::Local,
            work_root: std::env::temp_dir().join("runbox"),
            docker_image: "node:20-alpine".to_string(),
            container_port: 3000,
            public_host: "localhost".to_string(),
            boot: true,
            install_command: "npm install".to_string(),
            dev_command: "npm run dev".to_string(),
            ready_timeout: Duration::from_secs(90),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.port_range_start == 0 {
            return Err(RunboxError::InvalidConfig(
                "port range must not include port 0".into(),
            ));
        }
        if self.port_range_start > self.port_range_end {
            return Err(RunboxError::InvalidConfig(format!(
                "port range start {} is above end {}",
                self.port_range_start, self.port_range_end
            )));
        }
        for (name, d) in [
            ("idle_timeout", self.idle_timeout),
            ("reaper_interval", self.reaper_interval),
            ("heartbeat_interval", self.heartbeat_interval),
            ("create_timeout", self.create_timeout),
            ("remove_timeout", self.remove_timeout),
            ("driver_timeout", self.driver_timeout),
            ("exec_default_timeout", self.exec_default_timeout),
        ] {
            if d.is_zero() {
                return Err(RunboxError::InvalidConfig(format!("{name} must be non-zero")));
            }
        }
        if self.default_cpus <= 0.0 || self.default_cpus > self.max_cpus {
            return Err(RunboxError::InvalidConfig(format!(
                "default_cpus {} must be in (0, {}]",
                self.default_cpus, self.max_cpus
            )));
        }
        if self.default_memory_mb == 0 || self.default_memory_mb > self.max_memory_mb {
            return Err(RunboxError::InvalidConfig(format!(
                "default_memory_mb {} must be in [1, {}]",
                self.default_memory_mb, self.max_memory_mb
            )));
        }
        if self.subscriber_buffer == 0 || self.log_buffer_lines == 0 {
            return Err(RunboxError::InvalidConfig(
                "subscriber_buffer and log_buffer_lines must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// Fill missing fields from the defaults and clamp to the per-tenant caps.
    pub fn resolve_resources(&self, requested: ResourceSpec) -> ResourceSpec {
        let cpus = requested
            .cpus
            .filter(|c| c.is_finite() && *c > 0.0)
            .unwrap_or(self.default_cpus)
            .min(self.max_cpus);
        let memory_mb = requested
            .memory_mb
            .filter(|m| *m > 0)
            .unwrap_or(self.default_memory_mb)
            .min(self.max_memory_mb);
        ResourceSpec {
            cpus: Some(cpus),
            memory_mb: Some(memory_mb),
        }
    }

    pub fn preview_url(&self, port: u16) -> String {
        format!("http://{}:{}", self.public_host, port)
    }

    pub fn port_capacity(&self) -> usize {
        (self.port_range_end as usize).saturating_sub(self.port_range_start as usize) + 1
    }
}
