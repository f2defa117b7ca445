//! runbox - per-tenant ephemeral dev runtimes with an HTTP API.
//!
//! Usage:
//!   runbox serve [--port 8080] [--driver local|docker]   # Start HTTP server
//!   runbox check [--driver docker]                       # Check the runtime driver

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use runbox::http_server::run_server;
use runbox::{Config, DriverKind, Service};

#[derive(Parser, Debug)]
#[command(name = "runbox")]
#[command(about = "Per-tenant ephemeral dev runtimes with an HTTP API", version)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP server
    Serve(ServeArgs),
    /// Validate the configuration and check that the driver is reachable
    Check(ServeArgs),
}

/// Overrides for [`Config`]. Anything left unset keeps its default.
#[derive(clap::Args, Debug)]
struct ServeArgs {
    /// Port to listen on
    #[arg(long, env = "RUNBOX_PORT")]
    port: Option<u16>,

    /// First port handed to runtimes
    #[arg(long, env = "RUNBOX_PORT_RANGE_START")]
    port_range_start: Option<u16>,

    /// Last port handed to runtimes (inclusive)
    #[arg(long, env = "RUNBOX_PORT_RANGE_END")]
    port_range_end: Option<u16>,

    /// Evict runtimes idle for longer than this many seconds
    #[arg(long, env = "RUNBOX_IDLE_TIMEOUT_SECS")]
    idle_timeout_secs: Option<u64>,

    #[arg(long, env = "RUNBOX_REAPER_INTERVAL_SECS")]
    reaper_interval_secs: Option<u64>,

    #[arg(long, env = "RUNBOX_HEARTBEAT_SECS")]
    heartbeat_secs: Option<u64>,

    #[arg(long, env = "RUNBOX_CREATE_TIMEOUT_SECS")]
    create_timeout_secs: Option<u64>,

    #[arg(long, env = "RUNBOX_REMOVE_TIMEOUT_SECS")]
    remove_timeout_secs: Option<u64>,

    #[arg(long, env = "RUNBOX_DRIVER_TIMEOUT_SECS")]
    driver_timeout_secs: Option<u64>,

    /// Default timeout for blocking exec
    #[arg(long, env = "RUNBOX_EXEC_TIMEOUT_SECS")]
    exec_timeout_secs: Option<u64>,

    #[arg(long, env = "RUNBOX_MAX_OUTPUT_BYTES")]
    max_output_bytes: Option<usize>,

    #[arg(long, env = "RUNBOX_DEFAULT_CPUS")]
    default_cpus: Option<f64>,

    #[arg(long, env = "RUNBOX_DEFAULT_MEMORY_MB")]
    default_memory_mb: Option<u64>,

    #[arg(long, env = "RUNBOX_MAX_CPUS")]
    max_cpus: Option<f64>,

    #[arg(long, env = "RUNBOX_MAX_MEMORY_MB")]
    max_memory_mb: Option<u64>,

    #[arg(long, env = "RUNBOX_LOG_BUFFER_LINES")]
    log_buffer_lines: Option<usize>,

    #[arg(long, env = "RUNBOX_SUBSCRIBER_BUFFER")]
    subscriber_buffer: Option<usize>,

    /// Runtime engine
    #[arg(long, value_enum, env = "RUNBOX_DRIVER")]
    driver: Option<DriverKind>,

    /// Directory holding local runtime workspaces
    #[arg(long, env = "RUNBOX_WORK_ROOT")]
    work_root: Option<PathBuf>,

    #[arg(long, env = "RUNBOX_DOCKER_IMAGE")]
    docker_image: Option<String>,

    /// Dev server port inside containers
    #[arg(long, env = "RUNBOX_CONTAINER_PORT")]
    container_port: Option<u16>,

    /// Host name used in preview URLs
    #[arg(long, env = "RUNBOX_PUBLIC_HOST")]
    public_host: Option<String>,

    /// Do not run install and dev server after create
    #[arg(long, env = "RUNBOX_NO_BOOT")]
    no_boot: bool,

    #[arg(long, env = "RUNBOX_INSTALL_COMMAND")]
    install_command: Option<String>,

    #[arg(long, env = "RUNBOX_DEV_COMMAND")]
    dev_command: Option<String>,

    #[arg(long, env = "RUNBOX_READY_TIMEOUT_SECS")]
    ready_timeout_secs: Option<u64>,
}

impl ServeArgs {
    fn into_config(self) -> Config {
        let mut cfg = Config::default();
        let secs = Duration::from_secs;

        if let Some(v) = self.port {
            cfg.listen_port = v;
        }
        if let Some(v) = self.port_range_start {
            cfg.port_range_start = v;
        }
        if let Some(v) = self.port_range_end {
            cfg.port_range_end = v;
        }
        if let Some(v) = self.idle_timeout_secs {
            cfg.idle_timeout = secs(v);
        }
        if let Some(v) = self.reaper_interval_secs {
            cfg.reaper_interval = secs(v);
        }
        if let Some(v) = self.heartbeat_secs {
            cfg.heartbeat_interval = secs(v);
        }
        if let Some(v) = self.create_timeout_secs {
            cfg.create_timeout = secs(v);
        }
        if let Some(v) = self.remove_timeout_secs {
            cfg.remove_timeout = secs(v);
        }
        if let Some(v) = self.driver_timeout_secs {
            cfg.driver_timeout = secs(v);
        }
        if let Some(v) = self.exec_timeout_secs {
            cfg.exec_default_timeout = secs(v);
        }
        if let Some(v) = self.max_output_bytes {
            cfg.max_output_bytes = v;
        }
        if let Some(v) = self.default_cpus {
            cfg.default_cpus = v;
        }
        if let Some(v) = self.default_memory_mb {
            cfg.default_memory_mb = v;
        }
        if let Some(v) = self.max_cpus {
            cfg.max_cpus = v;
        }
        if let Some(v) = self.max_memory_mb {
            cfg.max_memory_mb = v;
        }
        if let Some(v) = self.log_buffer_lines {
            cfg.log_buffer_lines = v;
        }
        if let Some(v) = self.subscriber_buffer {
            cfg.subscriber_buffer = v;
        }
        if let Some(v) = self.driver {
            cfg.driver = v;
        }
        if let Some(v) = self.work_root {
            cfg.work_root = v;
        }
        if let Some(v) = self.docker_image {
            cfg.docker_image = v;
        }
        if let Some(v) = self.container_port {
            cfg.container_port = v;
        }
        if let Some(v) = self.public_host {
            cfg.public_host = v;
        }
        if self.no_boot {
            cfg.boot = false;
        }
        if let Some(v) = self.install_command {
            cfg.install_command = v;
        }
        if let Some(v) = self.dev_command {
            cfg.dev_command = v;
        }
        if let Some(v) = self.ready_timeout_secs {
            cfg.ready_timeout = secs(v);
        }
        cfg
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("runbox=info,tower_http=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();

    match args.command {
        Commands::Serve(serve) => {
            let config = serve.into_config();
            let port = config.listen_port;
            let service = Arc::new(Service::new(config).context("invalid configuration")?);
            if let Err(e) = service.check_driver().await {
                warn!(error = %e, "runtime driver is not reachable yet");
            }
            run_server(service, port)
                .await
                .context("HTTP server failed")?;
        }
        Commands::Check(serve) => {
            let service = Service::new(serve.into_config()).context("invalid configuration")?;
            service
                .check_driver()
                .await
                .context("runtime driver is not reachable")?;
            info!(driver = ?service.config().driver, "configuration valid, driver reachable");
        }
    }
    Ok(())
}
