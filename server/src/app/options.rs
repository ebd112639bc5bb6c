//! Application configuration options

use std::path::PathBuf;
use std::time::Duration;

use crate::backup::BackupEngineOptions;
use crate::compose::InjectorConfig;
use crate::deploy::LifecycleOptions;
use crate::errors::DockyardError;
use crate::storage::layout::StorageLayout;
use crate::storage::settings::{BackupStorageSettings, Settings};
use crate::workers::scheduler;

/// Main application options
#[derive(Debug, Clone)]
pub struct AppOptions {
    /// Storage layout paths
    pub layout: StorageLayout,

    /// Deployment lifecycle configuration
    pub deployments: LifecycleOptions,

    pub docker: DockerOptions,

    pub templates: TemplateOptions,

    /// Backup engine configuration
    pub backup: BackupEngineOptions,

    pub backup_storage: BackupStorageSettings,

    /// Enable local HTTP server
    pub enable_server: bool,

    /// Enable the backup scheduler
    pub enable_scheduler: bool,

    /// Server configuration
    pub server: ServerOptions,

    /// Scheduler worker options
    pub scheduler: scheduler::Options,

    /// Maximum delay for graceful shutdown
    pub max_shutdown_delay: Duration,
}

impl Default for AppOptions {
    fn default() -> Self {
        Self {
            layout: StorageLayout::default(),
            deployments: LifecycleOptions::default(),
            docker: DockerOptions::default(),
            templates: TemplateOptions::default(),
            backup: BackupEngineOptions::default(),
            backup_storage: BackupStorageSettings::default(),
            enable_server: true,
            enable_scheduler: true,
            server: ServerOptions::default(),
            scheduler: scheduler::Options::default(),
            max_shutdown_delay: Duration::from_secs(30),
        }
    }
}

impl AppOptions {
    /// Build runtime options from validated settings
    pub fn from_settings(settings: &Settings, layout: StorageLayout) -> Result<Self, DockyardError> {
        settings.validate()?;

        let compose_timeout = Duration::from_secs(settings.docker.compose_timeout_secs);
        let backup = &settings.backup;

        Ok(Self {
            layout,
            deployments: LifecycleOptions {
                operation_timeout: compose_timeout,
                tunnel_enabled: settings.tunnel.enabled,
                tunnel_domain: settings.tunnel.tunnel_domain.clone(),
                injector: InjectorConfig::from(&settings.tunnel),
                ..Default::default()
            },
            docker: DockerOptions {
                compose_command: settings.docker.compose_command.clone(),
                compose_timeout,
            },
            templates: TemplateOptions {
                dir: settings.templates.dir.clone(),
                base_url: settings.templates.base_url.clone(),
            },
            backup: BackupEngineOptions {
                passphrase: backup.encryption.passphrase.clone(),
                always_encrypt: backup.encryption.enabled,
            },
            backup_storage: backup.storage.clone(),
            enable_server: settings.server.enabled,
            enable_scheduler: backup.enabled,
            server: ServerOptions {
                host: settings.server.host.clone(),
                port: settings.server.port,
            },
            scheduler: scheduler::Options {
                poll_interval: Duration::from_secs(backup.scheduler_poll_secs),
                schedules: backup.schedules.clone(),
                retention: backup.retention.clone(),
                ..Default::default()
            },
            max_shutdown_delay: Duration::from_secs(30),
        })
    }
}

/// Compose CLI options
#[derive(Debug, Clone)]
pub struct DockerOptions {
    /// Program and leading arguments, e.g. `docker compose`
    pub compose_command: Vec<String>,

    /// Ceiling for one compose invocation
    pub compose_timeout: Duration,
}

impl Default for DockerOptions {
    fn default() -> Self {
        Self {
            compose_command: vec!["docker".to_string(), "compose".to_string()],
            compose_timeout: Duration::from_secs(300),
        }
    }
}

/// Where templates come from; a base URL wins over a directory
#[derive(Debug, Clone, Default)]
pub struct TemplateOptions {
    pub dir: Option<PathBuf>,
    pub base_url: Option<String>,
}

/// Local HTTP server options
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}
