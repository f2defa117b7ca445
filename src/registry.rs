//! In-memory runtime registry: which tenant has which runtime, in what state.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::config::ResourceSpec;
use crate::driver::RuntimeHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeStatus {
    Creating,
    Running,
    Stopping,
    Stopped,
    Error,
}

impl RuntimeStatus {
    /// Creating, Running and Stopping count against the one-runtime-per-tenant rule.
    pub fn is_live(self) -> bool {
        matches!(self, Self::Creating | Self::Running | Self::Stopping)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for RuntimeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One tenant's runtime.
#[derive(Debug, Clone)]
pub struct RuntimeRecord {
    pub tenant_id: String,
    pub runtime_id: Uuid,
    /// Set once the driver has created the runtime.
    pub handle: Option<RuntimeHandle>,
    pub port: u16,
    pub status: RuntimeStatus,
    pub created_at: Instant,
    pub created_at_utc: DateTime<Utc>,
    pub last_active_at: Instant,
    pub resources: ResourceSpec,
}

impl RuntimeRecord {
    pub fn new(tenant_id: &str, port: u16, resources: ResourceSpec) -> Self {
        let now = Instant::now();
        Self {
            tenant_id: tenant_id.to_string(),
            runtime_id: Uuid::new_v4(),
            handle: None,
            port,
            status: RuntimeStatus::Creating,
            created_at: now,
            created_at_utc: Utc::now(),
            last_active_at: now,
            resources,
        }
    }

    pub fn uptime_secs(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.created_at).as_secs()
    }

    pub fn idle_secs(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.last_active_at).as_secs()
    }

    /// `Running` or `Error` and inactive for longer than `idle_timeout` at `now`.
    pub fn idle_past(&self, now: Instant, idle_timeout: Duration) -> bool {
        matches!(self.status, RuntimeStatus::Running | RuntimeStatus::Error)
            && now.saturating_duration_since(self.last_active_at) > idle_timeout
    }
}

/// Thread-safe record storage keyed by tenant id.
///
/// The map lock is only held for the in-memory transition itself. Work that
/// spans driver calls serializes on [`RuntimeRegistry::tenant_lock`] instead,
/// which orders operations on one tenant without blocking the others.
#[derive(Debug, Default)]
pub struct RuntimeRegistry {
    records: RwLock<HashMap<String, RuntimeRecord>>,
    tenant_locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl RuntimeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, tenant_id: &str) -> Option<RuntimeRecord> {
        self.records.read().await.get(tenant_id).cloned()
    }

    pub async fn upsert(&self, record: RuntimeRecord) {
        self.records
            .write()
            .await
            .insert(record.tenant_id.clone(), record);
    }

    pub async fn delete(&self, tenant_id: &str) -> Option<RuntimeRecord> {
        self.records.write().await.remove(tenant_id)
    }

    pub async fn list_all(&self) -> Vec<RuntimeRecord> {
        let mut list: Vec<RuntimeRecord> = self.records.read().await.values().cloned().collect();
        list.sort_by(|a, b| a.tenant_id.cmp(&b.tenant_id));
        list
    }

    /// Update the status of an existing record. Returns the updated record.
    pub async fn set_status(
        &self,
        tenant_id: &str,
        status: RuntimeStatus,
    ) -> Option<RuntimeRecord> {
        let mut records = self.records.write().await;
        let record = records.get_mut(tenant_id)?;
        record.status = status;
        Some(record.clone())
    }

    /// Bump `last_active_at`. Returns false if the tenant has no record.
    pub async fn touch(&self, tenant_id: &str, now: Instant) -> bool {
        let mut records = self.records.write().await;
        match records.get_mut(tenant_id) {
            Some(record) => {
                if now > record.last_active_at {
                    record.last_active_at = now;
                }
                true
            }
            None => false,
        }
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// Per-tenant mutex serializing create/remove for one tenant.
    pub fn tenant_lock(&self, tenant_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self
            .tenant_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // Entries nobody else references can be dropped; the map lock keeps
        // anyone from cloning them concurrently.
        locks.retain(|tenant, lock| tenant == tenant_id || Arc::strong_count(lock) > 1);
        locks
            .entry(tenant_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}
