//! Persistence of tenant project files between runtime lifetimes.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::Result;
use crate::files::FileMap;

#[async_trait]
pub trait ProjectStore: Send + Sync {
    /// Last saved file map for the tenant, if any.
    async fn load(&self, tenant_id: &str) -> Result<Option<FileMap>>;

    async fn save(&self, tenant_id: &str, files: &FileMap) -> Result<()>;
}

/// Process-local store. Contents are lost on restart.
#[derive(Debug, Default)]
pub struct InMemoryProjectStore {
    projects: RwLock<HashMap<String, FileMap>>,
}

impl InMemoryProjectStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProjectStore for InMemoryProjectStore {
    async fn load(&self, tenant_id: &str) -> Result<Option<FileMap>> {
        Ok(self.projects.read().await.get(tenant_id).cloned())
    }

    async fn save(&self, tenant_id: &str, files: &FileMap) -> Result<()> {
        let mut projects = self.projects.write().await;
        projects
            .entry(tenant_id.to_string())
            .or_default()
            .extend(files.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }
}
