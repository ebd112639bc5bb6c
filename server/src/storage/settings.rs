//! Settings file management

use std::path::PathBuf;

use chrono::{NaiveTime, Weekday};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::errors::DockyardError;
use crate::filesys::file::File;
use crate::logs::LogLevel;

/// Server settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub log_level: LogLevel,

    /// Emit JSON log lines instead of plain text
    #[serde(default)]
    pub log_json: bool,

    /// Also write a daily rolling log file under `<data_dir>/logs`
    #[serde(default)]
    pub log_to_file: bool,

    /// Data directory; the platform default is used when unset
    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    #[serde(default)]
    pub server: ServerSettings,

    #[serde(default)]
    pub docker: DockerSettings,

    #[serde(default)]
    pub tunnel: TunnelSettings,

    #[serde(default)]
    pub templates: TemplateSettings,

    #[serde(default)]
    pub backup: BackupSettings,
}

impl Settings {
    /// Load settings from a JSON file; a missing file yields the defaults
    pub async fn load(file: &File) -> Result<Self, DockyardError> {
        if !file.exists().await {
            info!("No settings file at {}, using defaults", file.path().display());
            return Ok(Self::default());
        }
        let settings: Settings = file.read_json().await?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject values that would only fail later at runtime
    pub fn validate(&self) -> Result<(), DockyardError> {
        if self.docker.compose_command.is_empty() {
            return Err(DockyardError::ConfigError(
                "docker.compose_command must not be empty".to_string(),
            ));
        }
        if self.docker.compose_timeout_secs == 0 {
            return Err(DockyardError::ConfigError(
                "docker.compose_timeout_secs must be positive".to_string(),
            ));
        }
        if self.tunnel.service_name.trim().is_empty() {
            return Err(DockyardError::ConfigError(
                "tunnel.service_name must not be empty".to_string(),
            ));
        }
        self.backup.schedules.daily.time_of_day()?;
        self.backup.schedules.weekly.time_of_day()?;
        self.backup.schedules.weekly.weekday()?;
        Ok(())
    }
}

fn default_true() -> bool {
    true
}

/// HTTP server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Orchestration CLI settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerSettings {
    /// Program and leading arguments, e.g. `["docker", "compose"]`
    #[serde(default = "default_compose_command")]
    pub compose_command: Vec<String>,

    /// Ceiling for a single orchestration invocation
    #[serde(default = "default_compose_timeout")]
    pub compose_timeout_secs: u64,
}

fn default_compose_command() -> Vec<String> {
    vec!["docker".to_string(), "compose".to_string()]
}

fn default_compose_timeout() -> u64 {
    300
}

impl Default for DockerSettings {
    fn default() -> Self {
        Self {
            compose_command: default_compose_command(),
            compose_timeout_secs: default_compose_timeout(),
        }
    }
}

/// Tunnel agent injection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelSettings {
    /// Inject the tunnel agent into deployments that carry tunnel credentials
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_tunnel_image")]
    pub image: String,

    #[serde(default = "default_tunnel_service")]
    pub service_name: String,

    /// Domain tunnel URLs are built under
    #[serde(default = "default_tunnel_domain")]
    pub tunnel_domain: String,

    #[serde(default = "default_default_network")]
    pub default_network: String,

    #[serde(default = "default_agent_log_level")]
    pub log_level: String,

    #[serde(default = "default_health_file")]
    pub health_file: String,

    #[serde(default = "default_docker_socket")]
    pub docker_socket: String,
}

fn default_tunnel_image() -> String {
    "fosrl/newt:latest".to_string()
}

fn default_tunnel_service() -> String {
    "newt".to_string()
}

fn default_tunnel_domain() -> String {
    "tunnel.example.com".to_string()
}

fn default_default_network() -> String {
    "app_network".to_string()
}

fn default_agent_log_level() -> String {
    "INFO".to_string()
}

fn default_health_file() -> String {
    "/tmp/healthy".to_string()
}

fn default_docker_socket() -> String {
    "/var/run/docker.sock".to_string()
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            image: default_tunnel_image(),
            service_name: default_tunnel_service(),
            tunnel_domain: default_tunnel_domain(),
            default_network: default_default_network(),
            log_level: default_agent_log_level(),
            health_file: default_health_file(),
            docker_socket: default_docker_socket(),
        }
    }
}

/// Where compose templates are fetched from
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TemplateSettings {
    /// Local template directory; defaults to `<data_dir>/templates`
    #[serde(default)]
    pub dir: Option<PathBuf>,

    /// Remote template base URL; takes precedence over `dir` when set
    #[serde(default)]
    pub base_url: Option<String>,
}

/// Backup settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupSettings {
    /// Run the backup scheduler
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub storage: BackupStorageSettings,

    #[serde(default)]
    pub retention: RetentionSettings,

    #[serde(default)]
    pub encryption: EncryptionSettings,

    #[serde(default)]
    pub schedules: ScheduleSettings,

    #[serde(default = "default_scheduler_poll")]
    pub scheduler_poll_secs: u64,
}

fn default_scheduler_poll() -> u64 {
    30
}

impl Default for BackupSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            storage: BackupStorageSettings::default(),
            retention: RetentionSettings::default(),
            encryption: EncryptionSettings::default(),
            schedules: ScheduleSettings::default(),
            scheduler_poll_secs: default_scheduler_poll(),
        }
    }
}

/// Archive storage backend settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupStorageSettings {
    /// Backend type; only `local` is built in
    #[serde(rename = "type", default = "default_storage_type")]
    pub storage_type: String,

    /// Archive root; defaults to `<data_dir>/backups`
    #[serde(default)]
    pub path: Option<PathBuf>,
}

fn default_storage_type() -> String {
    "local".to_string()
}

impl Default for BackupStorageSettings {
    fn default() -> Self {
        Self {
            storage_type: default_storage_type(),
            path: None,
        }
    }
}

/// How many scheduled backups each bucket keeps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionSettings {
    #[serde(default = "default_daily_retention")]
    pub daily: u32,

    #[serde(default = "default_weekly_retention")]
    pub weekly: u32,

    #[serde(default = "default_monthly_retention")]
    pub monthly: u32,
}

fn default_daily_retention() -> u32 {
    7
}

fn default_weekly_retention() -> u32 {
    4
}

fn default_monthly_retention() -> u32 {
    12
}

impl Default for RetentionSettings {
    fn default() -> Self {
        Self {
            daily: default_daily_retention(),
            weekly: default_weekly_retention(),
            monthly: default_monthly_retention(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EncryptionSettings {
    /// Encrypt scheduled backups
    #[serde(default)]
    pub enabled: bool,

    /// Derive keys from this passphrase instead of generating random ones
    #[serde(default)]
    pub passphrase: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleSettings {
    #[serde(default = "default_daily_schedule")]
    pub daily: Schedule,

    #[serde(default = "default_weekly_schedule")]
    pub weekly: Schedule,
}

impl Default for ScheduleSettings {
    fn default() -> Self {
        Self {
            daily: default_daily_schedule(),
            weekly: default_weekly_schedule(),
        }
    }
}

/// One periodic backup schedule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// UTC time of day as `HH:MM`
    #[serde(default = "default_schedule_time")]
    pub time: String,

    /// Day of week for weekly schedules, e.g. `sunday`
    #[serde(default)]
    pub weekday: Option<String>,

    #[serde(default)]
    pub include_volumes: bool,

    #[serde(default)]
    pub encrypted: bool,
}

fn default_schedule_time() -> String {
    "00:00".to_string()
}

fn default_daily_schedule() -> Schedule {
    Schedule {
        enabled: true,
        time: default_schedule_time(),
        weekday: None,
        include_volumes: false,
        encrypted: false,
    }
}

fn default_weekly_schedule() -> Schedule {
    Schedule {
        enabled: true,
        time: default_schedule_time(),
        weekday: Some("sunday".to_string()),
        include_volumes: true,
        encrypted: false,
    }
}

impl Schedule {
    /// Parsed time of day
    pub fn time_of_day(&self) -> Result<NaiveTime, DockyardError> {
        NaiveTime::parse_from_str(&self.time, "%H:%M").map_err(|e| {
            DockyardError::ConfigError(format!("invalid schedule time '{}': {}", self.time, e))
        })
    }

    /// Parsed weekday, if the schedule has one
    pub fn weekday(&self) -> Result<Option<Weekday>, DockyardError> {
        match &self.weekday {
            None => Ok(None),
            Some(day) => day.parse::<Weekday>().map(Some).map_err(|_| {
                DockyardError::ConfigError(format!("invalid schedule weekday '{}'", day))
            }),
        }
    }
}
