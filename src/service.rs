//! Wiring of all components and ownership of the background tasks.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::broadcast::StatusBroadcaster;
use crate::config::Config;
use crate::driver::{self, with_timeout, RuntimeDriver};
use crate::error::Result;
use crate::executor::CommandExecutor;
use crate::lifecycle::LifecycleManager;
use crate::ports::PortAllocator;
use crate::reaper::IdleReaper;
use crate::registry::RuntimeRegistry;
use crate::state::AppState;
use crate::store::{InMemoryProjectStore, ProjectStore};

pub struct Service {
    config: Arc<Config>,
    registry: Arc<RuntimeRegistry>,
    ports: Arc<PortAllocator>,
    driver: Arc<dyn RuntimeDriver>,
    broadcaster: Arc<StatusBroadcaster>,
    executor: CommandExecutor,
    lifecycle: Arc<LifecycleManager>,
    reaper: Arc<IdleReaper>,
    tasks: TaskTracker,
    cancel: CancellationToken,
}

impl Service {
    /// Build the service with the driver selected by `config` and an
    /// in-memory project store.
    pub fn new(config: Config) -> Result<Self> {
        let driver = driver::from_config(&config);
        Self::with_parts(config, driver, Arc::new(InMemoryProjectStore::new()))
    }

    pub fn with_parts(
        config: Config,
        driver: Arc<dyn RuntimeDriver>,
        store: Arc<dyn ProjectStore>,
    ) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let registry = Arc::new(RuntimeRegistry::new());
        let ports = Arc::new(PortAllocator::new(
            config.port_range_start,
            config.port_range_end,
        )?);
        let broadcaster = Arc::new(StatusBroadcaster::new(
            config.subscriber_buffer,
            config.log_buffer_lines,
        ));
        let executor = CommandExecutor::new(
            registry.clone(),
            driver.clone(),
            config.exec_default_timeout,
            config.driver_timeout,
            config.max_output_bytes,
        );
        let lifecycle = Arc::new(
            LifecycleManager::new(
                config.clone(),
                registry.clone(),
                ports.clone(),
                driver.clone(),
                broadcaster.clone(),
                executor.clone(),
            )
            .with_store(store),
        );
        let reaper = Arc::new(IdleReaper::new(
            registry.clone(),
            lifecycle.clone(),
            config.idle_timeout,
        ));

        Ok(Self {
            config,
            registry,
            ports,
            driver,
            broadcaster,
            executor,
            lifecycle,
            reaper,
            tasks: TaskTracker::new(),
            cancel: CancellationToken::new(),
        })
    }

    /// Ping the driver once. A failure is only reported; runtimes created
    /// while the engine is down fail individually.
    pub async fn check_driver(&self) -> Result<()> {
        with_timeout("ping", self.config.driver_timeout, self.driver.ping()).await?;
        Ok(())
    }

    /// Start the idle reaper and the heartbeat ticker.
    pub fn start(&self) {
        self.tasks.spawn(
            self.reaper
                .clone()
                .run(self.config.reaper_interval, self.cancel.child_token()),
        );
        self.tasks.spawn(self.broadcaster.clone().run_heartbeat(
            self.config.heartbeat_interval,
            self.cancel.child_token(),
        ));
        info!(
            driver = self.driver.name(),
            ports = %format!("{}-{}", self.config.port_range_start, self.config.port_range_end),
            idle_timeout_secs = self.config.idle_timeout.as_secs(),
            "background tasks started"
        );
    }

    /// Stop background tasks and remove every runtime.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        let failed = self.lifecycle.shutdown().await;
        if failed > 0 {
            warn!(failed, "some runtimes could not be removed on shutdown");
        }
        info!("service stopped");
    }

    pub fn state(&self) -> AppState {
        AppState {
            config: self.config.clone(),
            lifecycle: self.lifecycle.clone(),
            executor: self.executor.clone(),
            broadcaster: self.broadcaster.clone(),
            ports: self.ports.clone(),
            shutdown: self.cancel.clone(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<RuntimeRegistry> {
        &self.registry
    }

    pub fn ports(&self) -> &Arc<PortAllocator> {
        &self.ports
    }

    pub fn broadcaster(&self) -> &Arc<StatusBroadcaster> {
        &self.broadcaster
    }

    pub fn executor(&self) -> &CommandExecutor {
        &self.executor
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleManager> {
        &self.lifecycle
    }

    pub fn reaper(&self) -> &Arc<IdleReaper> {
        &self.reaper
    }
}
