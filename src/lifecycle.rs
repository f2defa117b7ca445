//! Create, reuse, update and tear down tenant runtimes.
//!
//! Every multi-step operation on a tenant runs under that tenant's lock from
//! [`RuntimeRegistry::tenant_lock`], so duplicates and create/remove races
//! for one tenant are totally ordered. A failed or timed-out create undoes
//! whatever it had done: the driver runtime is removed, the port released and
//! the registry entry deleted.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::boot::BootSequence;
use crate::broadcast::{StatusBroadcaster, StatusEvent};
use crate::config::{Config, ResourceSpec};
use crate::driver::{runtime_name, with_timeout, CreateSpec, RuntimeDriver, RuntimeHandle};
use crate::error::{Result, RunboxError};
use crate::executor::CommandExecutor;
use crate::files::{normalize_file_map, normalize_rel_path, FileMap};
use crate::ports::PortAllocator;
use crate::registry::{RuntimeRecord, RuntimeRegistry, RuntimeStatus};
use crate::store::ProjectStore;

/// Public projection of a runtime record.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeView {
    pub tenant_id: String,
    pub runtime_id: Uuid,
    pub port: u16,
    pub url: String,
    pub status: RuntimeStatus,
    pub created_at: DateTime<Utc>,
    pub uptime_secs: u64,
    pub idle_secs: u64,
    pub resources: ResourceSpec,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsView {
    pub tenant_id: String,
    pub status: RuntimeStatus,
    /// CPU usage in percent of one core, `None` when metrics are unavailable.
    pub cpu: Option<f64>,
    pub memory: Option<u64>,
    pub memory_limit: Option<u64>,
    pub uptime_secs: u64,
    pub idle_secs: u64,
}

/// What a create had done by the time it stopped, for rollback.
struct Progress {
    stage: &'static str,
    handle: Option<RuntimeHandle>,
}

pub struct LifecycleManager {
    config: Arc<Config>,
    registry: Arc<RuntimeRegistry>,
    ports: Arc<PortAllocator>,
    driver: Arc<dyn RuntimeDriver>,
    broadcaster: Arc<StatusBroadcaster>,
    executor: CommandExecutor,
    store: Option<Arc<dyn ProjectStore>>,
    boots: Mutex<HashMap<String, CancellationToken>>,
}

impl LifecycleManager {
    pub fn new(
        config: Arc<Config>,
        registry: Arc<RuntimeRegistry>,
        ports: Arc<PortAllocator>,
        driver: Arc<dyn RuntimeDriver>,
        broadcaster: Arc<StatusBroadcaster>,
        executor: CommandExecutor,
    ) -> Self {
        Self {
            config,
            registry,
            ports,
            driver,
            broadcaster,
            executor,
            store: None,
            boots: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn ProjectStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn driver_name(&self) -> &'static str {
        self.driver.name()
    }

    fn view(&self, record: &RuntimeRecord, now: Instant) -> RuntimeView {
        RuntimeView {
            tenant_id: record.tenant_id.clone(),
            runtime_id: record.runtime_id,
            port: record.port,
            url: self.config.preview_url(record.port),
            status: record.status,
            created_at: record.created_at_utc,
            uptime_secs: record.uptime_secs(now),
            idle_secs: record.idle_secs(now),
            resources: record.resources,
        }
    }

    fn publish_status(&self, record: &RuntimeRecord) {
        self.broadcaster.publish(StatusEvent::status_change(
            record,
            &self.config.preview_url(record.port),
        ));
    }

    /// Return the tenant's live runtime, or provision a new one.
    pub async fn create_or_get_runtime(
        &self,
        tenant_id: &str,
        files: FileMap,
        resources: ResourceSpec,
    ) -> Result<RuntimeView> {
        let files = normalize_file_map(&files)?;

        let lock = self.registry.tenant_lock(tenant_id);
        let _guard = lock.lock().await;

        if let Some(existing) = self.registry.get(tenant_id).await {
            if existing.status.is_live() {
                debug!(tenant = %tenant_id, port = existing.port, status = %existing.status, "reusing runtime");
                self.registry.touch(tenant_id, Instant::now()).await;
                return Ok(self.view(&existing, Instant::now()));
            }
            info!(tenant = %tenant_id, status = %existing.status, "replacing stale runtime");
            self.teardown(existing).await?;
        }

        let files = if files.is_empty() {
            self.load_stored(tenant_id).await
        } else {
            files
        };
        let resources = self.config.resolve_resources(resources);

        let port = match self.ports.allocate() {
            Ok(port) => port,
            Err(e) => {
                warn!(tenant = %tenant_id, error = %e, "cannot allocate port");
                self.broadcaster
                    .publish(StatusEvent::error(tenant_id, e.code(), e.to_string()));
                return Err(e);
            }
        };

        let mut record = RuntimeRecord::new(tenant_id, port, resources);
        info!(tenant = %tenant_id, port, runtime_id = %record.runtime_id, "creating runtime");
        self.registry.upsert(record.clone()).await;
        self.publish_status(&record);

        let mut progress = Progress {
            stage: "allocate",
            handle: None,
        };
        let outcome = tokio::time::timeout(
            self.config.create_timeout,
            self.provision(&record, &files, &mut progress),
        )
        .await;

        let cause = match outcome {
            Ok(Ok(handle)) => {
                record.handle = Some(handle);
                record.status = RuntimeStatus::Running;
                record.last_active_at = Instant::now();
                self.registry.upsert(record.clone()).await;
                self.publish_status(&record);
                info!(tenant = %tenant_id, port, runtime_id = %record.runtime_id, "runtime running");

                self.save_stored(tenant_id, &files).await;
                if self.config.boot {
                    self.spawn_boot(&record);
                }
                return Ok(self.view(&record, Instant::now()));
            }
            Ok(Err(e)) => e,
            Err(_) => RunboxError::Driver {
                op: "create",
                message: format!(
                    "runtime not ready within {}ms",
                    self.config.create_timeout.as_millis()
                ),
            },
        };

        warn!(
            tenant = %tenant_id,
            port,
            stage = progress.stage,
            error = %cause,
            "runtime creation failed, rolling back"
        );
        self.rollback(tenant_id, port, progress.handle).await;

        let err = match cause {
            RunboxError::DriverUnavailable { message, .. } => RunboxError::DriverUnavailable {
                message,
                rolled_back: true,
            },
            other => RunboxError::RuntimeCreateFailed {
                tenant: tenant_id.to_string(),
                stage: progress.stage,
                message: other.to_string(),
            },
        };
        self.broadcaster
            .publish(StatusEvent::error(tenant_id, err.code(), err.to_string()));
        self.broadcaster.publish(StatusEvent::absent(tenant_id));
        Err(err)
    }

    async fn provision(
        &self,
        record: &RuntimeRecord,
        files: &FileMap,
        progress: &mut Progress,
    ) -> Result<RuntimeHandle> {
        let timeout = self.config.driver_timeout;
        let spec = CreateSpec {
            tenant_id: record.tenant_id.clone(),
            runtime_id: record.runtime_id,
            port: record.port,
            resources: record.resources,
        };

        progress.stage = "create";
        // Names are deterministic, so a create cut off by the deadline is
        // still removed on rollback.
        progress.handle = Some(RuntimeHandle {
            id: runtime_name(&spec),
            port: spec.port,
        });
        let handle = with_timeout("create", timeout, self.driver.create(&spec)).await?;
        progress.handle = Some(handle.clone());

        progress.stage = "start";
        with_timeout("start", timeout, self.driver.start(&handle)).await?;

        if !files.is_empty() {
            progress.stage = "write_files";
            with_timeout("write_files", timeout, self.driver.write_files(&handle, files)).await?;
        }
        Ok(handle)
    }

    async fn rollback(&self, tenant_id: &str, port: u16, handle: Option<RuntimeHandle>) {
        if let Some(handle) = handle {
            let removed = with_timeout(
                "remove",
                self.config.remove_timeout,
                self.driver.remove(&handle),
            )
            .await;
            if let Err(e) = removed {
                warn!(tenant = %tenant_id, runtime = %handle.id, error = %e, "rollback could not remove runtime");
            }
        }
        self.registry.delete(tenant_id).await;
        self.ports.release(port);
    }

    /// Stop and delete the tenant's runtime. Succeeds when there is none.
    pub async fn remove_runtime(&self, tenant_id: &str) -> Result<()> {
        let lock = self.registry.tenant_lock(tenant_id);
        let _guard = lock.lock().await;

        match self.registry.get(tenant_id).await {
            Some(record) => self.teardown(record).await,
            None => {
                self.cancel_boot(tenant_id);
                self.broadcaster.prune(tenant_id);
                debug!(tenant = %tenant_id, "remove: no runtime");
                Ok(())
            }
        }
    }

    /// Remove the tenant's runtime only if it is still `runtime_id` and still
    /// idle past `idle_timeout` at `now`. Returns whether it was removed.
    pub async fn evict_if_idle(
        &self,
        tenant_id: &str,
        runtime_id: Uuid,
        now: Instant,
        idle_timeout: Duration,
    ) -> Result<bool> {
        let lock = self.registry.tenant_lock(tenant_id);
        let _guard = lock.lock().await;

        let Some(record) = self.registry.get(tenant_id).await else {
            return Ok(false);
        };
        if record.runtime_id != runtime_id || !record.idle_past(now, idle_timeout) {
            debug!(tenant = %tenant_id, status = %record.status, "runtime no longer idle, skipping");
            return Ok(false);
        }
        info!(
            tenant = %tenant_id,
            port = record.port,
            idle_secs = record.idle_secs(now),
            status = %record.status,
            "evicting idle runtime"
        );
        self.teardown(record).await.map(|()| true)
    }

    /// Tear down a record. The caller holds the tenant lock.
    async fn teardown(&self, record: RuntimeRecord) -> Result<()> {
        let tenant = record.tenant_id.clone();
        let tenant_id = tenant.as_str();
        self.cancel_boot(tenant_id);

        let stopping = self
            .registry
            .set_status(tenant_id, RuntimeStatus::Stopping)
            .await
            .unwrap_or(record);
        self.publish_status(&stopping);
        info!(tenant = %tenant_id, port = stopping.port, "removing runtime");

        if let Some(handle) = &stopping.handle {
            if let Err(e) = self.stop_and_remove(handle).await {
                warn!(tenant = %tenant_id, runtime = %handle.id, error = %e, "runtime removal failed");
                if let Some(failed) = self
                    .registry
                    .set_status(tenant_id, RuntimeStatus::Error)
                    .await
                {
                    self.publish_status(&failed);
                }
                self.broadcaster
                    .publish(StatusEvent::error(tenant_id, e.code(), e.to_string()));
                return Err(e);
            }
        }

        self.ports.release(stopping.port);
        self.registry.delete(tenant_id).await;
        self.broadcaster.publish(StatusEvent::absent(tenant_id));
        self.broadcaster.prune(tenant_id);
        info!(tenant = %tenant_id, port = stopping.port, "runtime removed");
        Ok(())
    }

    async fn stop_and_remove(&self, handle: &RuntimeHandle) -> Result<()> {
        let timeout = self.config.driver_timeout;
        let work = async {
            with_timeout("stop", timeout, self.driver.stop(handle)).await?;
            with_timeout("remove", timeout, self.driver.remove(handle)).await
        };
        match tokio::time::timeout(self.config.remove_timeout, work).await {
            Ok(res) => res.map_err(RunboxError::from),
            Err(_) => Err(RunboxError::Driver {
                op: "remove",
                message: format!(
                    "timed out after {}ms",
                    self.config.remove_timeout.as_millis()
                ),
            }),
        }
    }

    /// Record of a running runtime with its handle.
    async fn running(&self, tenant_id: &str) -> Result<(RuntimeRecord, RuntimeHandle)> {
        let record = self
            .registry
            .get(tenant_id)
            .await
            .ok_or_else(|| RunboxError::RuntimeNotFound(tenant_id.to_string()))?;
        match (&record.status, record.handle.clone()) {
            (RuntimeStatus::Running, Some(handle)) => Ok((record, handle)),
            _ => Err(RunboxError::RuntimeNotRunning {
                tenant: tenant_id.to_string(),
                status: record.status,
            }),
        }
    }

    /// Write files into the live runtime. Returns how many were written.
    pub async fn update_files(&self, tenant_id: &str, files: FileMap) -> Result<usize> {
        let files = normalize_file_map(&files)?;
        let lock = self.registry.tenant_lock(tenant_id);
        let _guard = lock.lock().await;
        let (_, handle) = self.running(tenant_id).await?;
        if !files.is_empty() {
            with_timeout(
                "write_files",
                self.config.driver_timeout,
                self.driver.write_files(&handle, &files),
            )
            .await?;
        }
        self.registry.touch(tenant_id, Instant::now()).await;
        self.save_stored(tenant_id, &files).await;
        debug!(tenant = %tenant_id, count = files.len(), "files updated");
        Ok(files.len())
    }

    /// Read files back out of the live runtime.
    pub async fn read_files(&self, tenant_id: &str, paths: &[String]) -> Result<FileMap> {
        let paths = paths
            .iter()
            .map(|p| normalize_rel_path(p).map(|n| n.to_string_lossy().into_owned()))
            .collect::<Result<Vec<_>>>()?;
        let lock = self.registry.tenant_lock(tenant_id);
        let _guard = lock.lock().await;
        let (_, handle) = self.running(tenant_id).await?;

        let mut files = FileMap::new();
        for path in paths {
            let content = with_timeout(
                "read_file",
                self.config.driver_timeout,
                self.driver.read_file(&handle, &path),
            )
            .await?;
            files.insert(path, content);
        }
        self.registry.touch(tenant_id, Instant::now()).await;
        Ok(files)
    }

    pub async fn get(&self, tenant_id: &str) -> Option<RuntimeView> {
        let record = self.registry.get(tenant_id).await?;
        Some(self.view(&record, Instant::now()))
    }

    /// Status plus live metrics. Metric failures yield `None` fields.
    pub async fn get_stats(&self, tenant_id: &str) -> Result<StatsView> {
        let record = self
            .registry
            .get(tenant_id)
            .await
            .ok_or_else(|| RunboxError::RuntimeNotFound(tenant_id.to_string()))?;

        let stats = match (&record.status, &record.handle) {
            (RuntimeStatus::Running, Some(handle)) => {
                match with_timeout("stats", self.config.driver_timeout, self.driver.stats(handle))
                    .await
                {
                    Ok(stats) => Some(stats),
                    Err(e) => {
                        debug!(tenant = %tenant_id, error = %e, "stats unavailable");
                        None
                    }
                }
            }
            _ => None,
        };

        let now = Instant::now();
        Ok(StatsView {
            tenant_id: record.tenant_id.clone(),
            status: record.status,
            cpu: stats.as_ref().map(|s| s.cpu_percent),
            memory: stats.as_ref().map(|s| s.memory_bytes),
            memory_limit: stats.and_then(|s| s.memory_limit_bytes),
            uptime_secs: record.uptime_secs(now),
            idle_secs: record.idle_secs(now),
        })
    }

    pub async fn list_all(&self) -> Vec<RuntimeView> {
        let now = Instant::now();
        self.registry
            .list_all()
            .await
            .iter()
            .map(|r| self.view(r, now))
            .collect()
    }

    /// Record user activity. Returns false if the tenant has no runtime.
    pub async fn touch(&self, tenant_id: &str) -> bool {
        self.registry.touch(tenant_id, Instant::now()).await
    }

    /// Remove every runtime. Returns how many could not be removed.
    pub async fn shutdown(&self) -> usize {
        let records = self.registry.list_all().await;
        info!(count = records.len(), "removing all runtimes");
        let mut failed = 0;
        for record in records {
            if let Err(e) = self.remove_runtime(&record.tenant_id).await {
                warn!(tenant = %record.tenant_id, error = %e, "shutdown removal failed");
                failed += 1;
            }
        }
        failed
    }

    fn boots(&self) -> std::sync::MutexGuard<'_, HashMap<String, CancellationToken>> {
        self.boots.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn spawn_boot(&self, record: &RuntimeRecord) {
        let cancel = CancellationToken::new();
        if let Some(previous) = self.boots().insert(record.tenant_id.clone(), cancel.clone()) {
            previous.cancel();
        }
        let boot = BootSequence::new(
            self.executor.clone(),
            self.broadcaster.clone(),
            &self.config,
        );
        tokio::spawn(boot.run(
            record.tenant_id.clone(),
            record.port,
            self.config.preview_url(record.port),
            cancel,
        ));
    }

    fn cancel_boot(&self, tenant_id: &str) {
        if let Some(cancel) = self.boots().remove(tenant_id) {
            cancel.cancel();
        }
    }

    async fn load_stored(&self, tenant_id: &str) -> FileMap {
        let Some(store) = &self.store else {
            return FileMap::new();
        };
        match store.load(tenant_id).await {
            Ok(Some(files)) => match normalize_file_map(&files) {
                Ok(files) => {
                    debug!(tenant = %tenant_id, count = files.len(), "using stored project files");
                    files
                }
                Err(e) => {
                    warn!(tenant = %tenant_id, error = %e, "stored project has invalid paths");
                    FileMap::new()
                }
            },
            Ok(None) => FileMap::new(),
            Err(e) => {
                warn!(tenant = %tenant_id, error = %e, "could not load stored project");
                FileMap::new()
            }
        }
    }

    async fn save_stored(&self, tenant_id: &str, files: &FileMap) {
        let Some(store) = &self.store else { return };
        if files.is_empty() {
            return;
        }
        if let Err(e) = store.save(tenant_id, files).await {
            warn!(tenant = %tenant_id, error = %e, "could not save project files");
        }
    }
}
