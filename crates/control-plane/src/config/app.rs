//! Application configuration for the pg-dd control plane.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::dispatch::DispatchSettings;

/// Where worker compute comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LauncherKind {
    /// One Kubernetes Job per run.
    Kubernetes,
    /// Local child process, for development.
    Process,
}

/// Where settled runs are archived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveKind {
    Memory,
    Postgres,
}

/// Application configuration loaded from environment variables.
///
/// Environment variables are prefixed with `PG_DD_`:
/// - `PG_DD_HOST`: Server bind address (default: "0.0.0.0")
/// - `PG_DD_PORT`: Server port (default: 8082)
/// - `PG_DD_PUBLIC_URL`: Base URL workers post callbacks to
/// - `PG_DD_CALLBACK_TIMEOUT_SECS`: Deadline for the terminal callback (default: 12h)
/// - `PG_DD_LAUNCHER`: `kubernetes` or `process`
/// - `PG_DD_CONTRACT_FILE`: YAML file with the default worker contract
/// - `PG_DD_ARCHIVE`: `memory` or `postgres`
///
/// Kubernetes launcher settings (`PG_DD_NAMESPACE`, `PG_DD_IMAGE`, ...) are
/// read separately by `KubernetesSettings::from_env`.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server bind address
    #[serde(default = "default_host")]
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Server name for identification
    #[serde(default = "default_server_name")]
    pub server_name: String,

    /// Base URL handed to workers as `PG_DD_CALLBACK_URL`
    #[serde(default)]
    pub public_url: Option<String>,

    #[serde(default = "default_callback_timeout")]
    pub callback_timeout_secs: u64,

    #[serde(default = "default_launcher")]
    pub launcher: LauncherKind,

    /// Program run by the process launcher
    #[serde(default = "default_worker_program")]
    pub worker_program: String,

    /// Default worker contract, used when a dispatch request carries none
    #[serde(default)]
    pub contract_file: Option<PathBuf>,

    /// NATS URL (optional)
    #[serde(default)]
    pub nats_url: Option<String>,

    #[serde(default)]
    pub nats_subject: Option<String>,

    #[serde(default)]
    pub nats_stream: Option<String>,

    #[serde(default = "default_archive")]
    pub archive: ArchiveKind,

    /// How often settled runs are swept from memory
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// How long settled runs stay in memory before the sweep drops them
    #[serde(default = "default_terminal_retention")]
    pub terminal_retention_secs: u64,

    /// Emit JSON logs
    #[serde(default)]
    pub log_json: bool,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8082
}

fn default_server_name() -> String {
    "pg-dd-control-plane".to_string()
}

fn default_callback_timeout() -> u64 {
    12 * 60 * 60
}

fn default_launcher() -> LauncherKind {
    LauncherKind::Kubernetes
}

fn default_worker_program() -> String {
    "pg-dd".to_string()
}

fn default_archive() -> ArchiveKind {
    ArchiveKind::Memory
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_terminal_retention() -> u64 {
    3600
}

impl AppConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables are prefixed with `PG_DD_`.
    pub fn from_env() -> Result<Self, envy::Error> {
        envy::prefixed("PG_DD_").from_env::<AppConfig>()
    }

    /// Get the server bind address as a string suitable for `TcpListener::bind`.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn dispatch_settings(&self) -> DispatchSettings {
        DispatchSettings {
            callback_timeout: Duration::from_secs(self.callback_timeout_secs),
            callback_url: self
                .public_url
                .as_ref()
                .map(|url| url.trim_end_matches('/').to_string()),
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn terminal_retention(&self) -> Duration {
        Duration::from_secs(self.terminal_retention_secs)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            server_name: default_server_name(),
            public_url: None,
            callback_timeout_secs: default_callback_timeout(),
            launcher: default_launcher(),
            worker_program: default_worker_program(),
            contract_file: None,
            nats_url: None,
            nats_subject: None,
            nats_stream: None,
            archive: default_archive(),
            sweep_interval_secs: default_sweep_interval(),
            terminal_retention_secs: default_terminal_retention(),
            log_json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 8082);
        assert_eq!(config.launcher, LauncherKind::Kubernetes);
        assert_eq!(config.archive, ArchiveKind::Memory);
        assert_eq!(
            config.dispatch_settings().callback_timeout,
            Duration::from_secs(43200)
        );
    }

    #[test]
    fn test_bind_address() {
        let config = AppConfig::default();
        assert_eq!(config.bind_address(), "0.0.0.0:8082");
    }

    #[test]
    fn test_from_iter() {
        let vars = vec![
            ("LAUNCHER".to_string(), "process".to_string()),
            ("CALLBACK_TIMEOUT_SECS".to_string(), "5".to_string()),
            ("PUBLIC_URL".to_string(), "http://pg-dd:8082/".to_string()),
            ("ARCHIVE".to_string(), "postgres".to_string()),
        ];
        let config: AppConfig = envy::from_iter(vars).unwrap();
        assert_eq!(config.launcher, LauncherKind::Process);
        assert_eq!(config.archive, ArchiveKind::Postgres);

        let settings = config.dispatch_settings();
        assert_eq!(settings.callback_timeout, Duration::from_secs(5));
        assert_eq!(settings.callback_url.as_deref(), Some("http://pg-dd:8082"));
    }
}
