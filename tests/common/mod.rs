#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use runbox::driver::{
    CreateSpec, DriverError, DriverResult, LocalDriver, RuntimeDriver, RuntimeHandle,
    RuntimeStats, SpawnRequest, Spawned,
};
use runbox::files::FileMap;
use runbox::store::InMemoryProjectStore;
use runbox::{Config, Service};

/// Two-port pool over a temporary work root, without the boot sequence.
pub fn test_config(root: &Path) -> Config {
    Config {
        port_range_start: 4000,
        port_range_end: 4001,
        work_root: root.join("work"),
        boot: false,
        idle_timeout: Duration::from_secs(60),
        create_timeout: Duration::from_secs(10),
        remove_timeout: Duration::from_secs(10),
        driver_timeout: Duration::from_secs(5),
        exec_default_timeout: Duration::from_secs(10),
        ..Config::default()
    }
}

pub fn local_service(config: Config) -> Arc<Service> {
    let driver = Arc::new(LocalDriver::new(config.work_root.clone()));
    Arc::new(
        Service::with_parts(config, driver, Arc::new(InMemoryProjectStore::new()))
            .expect("valid test config"),
    )
}

pub fn flaky_service(config: Config, driver: Arc<FlakyDriver>) -> Arc<Service> {
    Arc::new(
        Service::with_parts(config, driver, Arc::new(InMemoryProjectStore::new()))
            .expect("valid test config"),
    )
}

pub fn files(entries: &[(&str, &str)]) -> FileMap {
    entries
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Local driver whose calls can be made to fail on demand.
pub struct FlakyDriver {
    pub inner: LocalDriver,
    pub unavailable: AtomicBool,
    pub fail_write: AtomicBool,
    pub fail_stop: AtomicBool,
    /// Fail `stop` only for runtimes of this tenant.
    pub fail_stop_tenant: Mutex<Option<String>>,
    /// Stall after the workspace exists, as a slow engine would.
    pub create_delay: Option<Duration>,
}

impl FlakyDriver {
    pub fn new(root: &Path) -> Self {
        Self {
            inner: LocalDriver::new(root.join("work")),
            unavailable: AtomicBool::new(false),
            fail_write: AtomicBool::new(false),
            fail_stop: AtomicBool::new(false),
            fail_stop_tenant: Mutex::new(None),
            create_delay: None,
        }
    }

    pub fn set(flag: &AtomicBool, value: bool) {
        flag.store(value, Ordering::SeqCst);
    }

    pub fn fail_stop_for(&self, tenant: Option<&str>) {
        *self.fail_stop_tenant.lock().unwrap() = tenant.map(str::to_string);
    }

    fn stop_refused(&self, handle: &RuntimeHandle) -> bool {
        if self.fail_stop.load(Ordering::SeqCst) {
            return true;
        }
        self.fail_stop_tenant
            .lock()
            .unwrap()
            .as_deref()
            .is_some_and(|tenant| handle.id.starts_with(&format!("runbox-{tenant}-")))
    }
}

#[async_trait]
impl RuntimeDriver for FlakyDriver {
    fn name(&self) -> &'static str {
        "flaky"
    }

    async fn ping(&self) -> DriverResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(DriverError::Unavailable("engine is down".into()));
        }
        Ok(())
    }

    async fn create(&self, spec: &CreateSpec) -> DriverResult<RuntimeHandle> {
        self.ping().await?;
        let handle = self.inner.create(spec).await?;
        if let Some(delay) = self.create_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(handle)
    }

    async fn start(&self, handle: &RuntimeHandle) -> DriverResult<()> {
        self.inner.start(handle).await
    }

    async fn stop(&self, handle: &RuntimeHandle) -> DriverResult<()> {
        if self.stop_refused(handle) {
            return Err(DriverError::failed("stop", "refused"));
        }
        self.inner.stop(handle).await
    }

    async fn remove(&self, handle: &RuntimeHandle) -> DriverResult<()> {
        self.inner.remove(handle).await
    }

    async fn write_files(&self, handle: &RuntimeHandle, files: &FileMap) -> DriverResult<()> {
        if self.fail_write.load(Ordering::SeqCst) {
            return Err(DriverError::failed("write_files", "disk full"));
        }
        self.inner.write_files(handle, files).await
    }

    async fn read_file(&self, handle: &RuntimeHandle, path: &str) -> DriverResult<String> {
        self.inner.read_file(handle, path).await
    }

    async fn spawn(
        &self,
        handle: &RuntimeHandle,
        request: &SpawnRequest,
    ) -> DriverResult<Spawned> {
        self.inner.spawn(handle, request).await
    }

    async fn kill(&self, handle: &RuntimeHandle, spawned: &mut Spawned) -> DriverResult<()> {
        self.inner.kill(handle, spawned).await
    }

    async fn stats(&self, handle: &RuntimeHandle) -> DriverResult<RuntimeStats> {
        self.inner.stats(handle).await
    }
}
