//! Server state

use crate::backup::BackupEngine;
use crate::compose::InjectorConfig;
use crate::deploy::DeploymentLifecycle;

/// Server state shared across handlers
pub struct ServerState {
    pub lifecycle: DeploymentLifecycle,
    pub backups: BackupEngine,
    /// Injector settings for the stateless compose endpoints
    pub injector: InjectorConfig,
}

impl ServerState {
    pub fn new(lifecycle: DeploymentLifecycle, backups: BackupEngine, injector: InjectorConfig) -> Self {
        Self {
            lifecycle,
            backups,
            injector,
        }
    }
}
