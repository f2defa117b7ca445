//! Shared application state handed to the HTTP handlers.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::broadcast::StatusBroadcaster;
use crate::config::Config;
use crate::executor::CommandExecutor;
use crate::lifecycle::LifecycleManager;
use crate::ports::PortAllocator;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub lifecycle: Arc<LifecycleManager>,
    pub executor: CommandExecutor,
    pub broadcaster: Arc<StatusBroadcaster>,
    pub ports: Arc<PortAllocator>,
    /// Fires when the server is shutting down; ends open event streams.
    pub shutdown: CancellationToken,
}
