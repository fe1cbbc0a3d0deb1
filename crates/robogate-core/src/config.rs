//! Gateway configuration.
//!
//! One TOML file configures the whole gateway. Subsystem-specific sections
//! ([`crate::safety::SafetyConfig`], [`crate::lease::LeaseConfig`],
//! [`crate::rewind::RewindConfig`]) live next to their modules; this module
//! aggregates them with the server, backend, executor, and service-manager
//! sections.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::lease::LeaseConfig;
use crate::rewind::RewindConfig;
use crate::safety::SafetyConfig;
use crate::supervisor::{RestartPolicy, ServiceDefinition};

/// HTTP server section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address.
    #[serde(default = "default_host")]
    pub host: String,
    /// Bind port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Use simulated adapters instead of live backends.
    #[serde(default)]
    pub dry_run: bool,
    /// Snapshot publish rate, Hz.
    #[serde(default = "default_publish_hz")]
    pub publish_hz: f64,
    /// Default WebSocket state stream rate, Hz.
    #[serde(default = "default_observer_hz")]
    pub observer_hz: f64,
    /// Trajectory recorder capacity.
    #[serde(default = "default_max_trajectory_length")]
    pub max_trajectory_length: usize,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

const fn default_port() -> u16 {
    8080
}

const fn default_publish_hz() -> f64 {
    50.0
}

const fn default_observer_hz() -> f64 {
    10.0
}

const fn default_max_trajectory_length() -> usize {
    10_000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            dry_run: false,
            publish_hz: default_publish_hz(),
            observer_hz: default_observer_hz(),
            max_trajectory_length: default_max_trajectory_length(),
        }
    }
}

/// Arm backend connection section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArmBackendConfig {
    #[serde(default = "default_localhost")]
    pub host: String,
    /// Command/mode request port.
    #[serde(default = "default_arm_cmd_port")]
    pub cmd_port: u16,
    /// Streaming target rate, Hz.
    #[serde(default = "default_stream_rate")]
    pub stream_rate: f64,
    /// State poll rate, Hz.
    #[serde(default = "default_arm_poll_hz")]
    pub poll_hz: f64,
    /// Round-trip timeout.
    #[serde(default = "default_request_timeout")]
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

fn default_localhost() -> String {
    "localhost".to_string()
}

const fn default_arm_cmd_port() -> u16 {
    5555
}

const fn default_stream_rate() -> f64 {
    50.0
}

const fn default_arm_poll_hz() -> f64 {
    100.0
}

const fn default_request_timeout() -> Duration {
    Duration::from_secs(5)
}

impl Default for ArmBackendConfig {
    fn default() -> Self {
        Self {
            host: default_localhost(),
            cmd_port: default_arm_cmd_port(),
            stream_rate: default_stream_rate(),
            poll_hz: default_arm_poll_hz(),
            request_timeout: default_request_timeout(),
        }
    }
}

/// Base backend connection section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaseBackendConfig {
    #[serde(default = "default_localhost")]
    pub host: String,
    #[serde(default = "default_base_port")]
    pub port: u16,
    /// State poll rate, Hz.
    #[serde(default = "default_base_poll_hz")]
    pub poll_hz: f64,
    #[serde(default = "default_request_timeout")]
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

const fn default_base_port() -> u16 {
    50000
}

const fn default_base_poll_hz() -> f64 {
    10.0
}

impl Default for BaseBackendConfig {
    fn default() -> Self {
        Self {
            host: default_localhost(),
            port: default_base_port(),
            poll_hz: default_base_poll_hz(),
            request_timeout: default_request_timeout(),
        }
    }
}

/// Gripper backend connection section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GripperBackendConfig {
    #[serde(default = "default_localhost")]
    pub host: String,
    #[serde(default = "default_gripper_port")]
    pub port: u16,
    #[serde(default = "default_base_poll_hz")]
    pub poll_hz: f64,
    #[serde(default = "default_request_timeout")]
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

const fn default_gripper_port() -> u16 {
    5560
}

impl Default for GripperBackendConfig {
    fn default() -> Self {
        Self {
            host: default_localhost(),
            port: default_gripper_port(),
            poll_hz: default_base_poll_hz(),
            request_timeout: default_request_timeout(),
        }
    }
}

/// Camera backend section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_camera_devices")]
    pub devices: Vec<String>,
    #[serde(default = "default_camera_width")]
    pub width: u32,
    #[serde(default = "default_camera_height")]
    pub height: u32,
    #[serde(default = "default_camera_fps")]
    pub fps: u32,
}

fn default_camera_devices() -> Vec<String> {
    vec!["/dev/video0".to_string()]
}

const fn default_camera_width() -> u32 {
    640
}

const fn default_camera_height() -> u32 {
    480
}

const fn default_camera_fps() -> u32 {
    30
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            devices: default_camera_devices(),
            width: default_camera_width(),
            height: default_camera_height(),
            fps: default_camera_fps(),
        }
    }
}

/// Code executor section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Timeout applied when a submission does not specify one.
    #[serde(default = "default_exec_timeout")]
    #[serde(with = "humantime_serde")]
    pub default_timeout: Duration,
    /// Upper bound on the per-submission timeout.
    #[serde(default = "default_exec_max_timeout")]
    #[serde(with = "humantime_serde")]
    pub max_timeout: Duration,
    /// Grace window between SIGTERM and SIGKILL on stop.
    #[serde(default = "default_stop_grace")]
    #[serde(with = "humantime_serde")]
    pub stop_grace: Duration,
    /// Interpreter used to run submitted scripts.
    #[serde(default = "default_interpreter")]
    pub interpreter: String,
}

const fn default_exec_timeout() -> Duration {
    Duration::from_secs(300)
}

const fn default_exec_max_timeout() -> Duration {
    Duration::from_secs(1800)
}

const fn default_stop_grace() -> Duration {
    Duration::from_secs(2)
}

fn default_interpreter() -> String {
    "python3".to_string()
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            default_timeout: default_exec_timeout(),
            max_timeout: default_exec_max_timeout(),
            stop_grace: default_stop_grace(),
            interpreter: default_interpreter(),
        }
    }
}

/// Service manager section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceManagerConfig {
    /// Whether the gateway manages backend processes at all.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Start every service on gateway startup.
    #[serde(default)]
    pub auto_start: bool,
    /// Delay between auto-started services.
    #[serde(default = "default_startup_stagger")]
    #[serde(with = "humantime_serde")]
    pub startup_stagger: Duration,
    /// Health probe interval.
    #[serde(default = "default_health_interval")]
    #[serde(with = "humantime_serde")]
    pub health_interval: Duration,
    /// Graceful stop window before SIGKILL.
    #[serde(default = "default_service_stop_timeout")]
    #[serde(with = "humantime_serde")]
    pub stop_timeout: Duration,
    /// Log ring capacity per service, lines.
    #[serde(default = "default_log_lines")]
    pub log_lines: usize,
    /// Where tracked PIDs are persisted for crash recovery.
    #[serde(default = "default_pid_file")]
    pub pid_file: PathBuf,
    /// Restart backoff policy.
    #[serde(default)]
    pub restart: RestartPolicy,
    /// Managed service definitions, keyed by service key.
    #[serde(default = "default_services")]
    pub definitions: BTreeMap<String, ServiceDefinition>,
}

const fn default_true() -> bool {
    true
}

const fn default_startup_stagger() -> Duration {
    Duration::from_secs(3)
}

const fn default_health_interval() -> Duration {
    Duration::from_secs(5)
}

const fn default_service_stop_timeout() -> Duration {
    Duration::from_secs(5)
}

const fn default_log_lines() -> usize {
    200
}

fn default_pid_file() -> PathBuf {
    PathBuf::from("/tmp/robogate-services.json")
}

/// Default backend service set: the base RPC server, the arm control loop,
/// and the controller that depends on both.
fn default_services() -> BTreeMap<String, ServiceDefinition> {
    let mut services = BTreeMap::new();
    services.insert(
        "base_server".to_string(),
        ServiceDefinition {
            name: "Base server".to_string(),
            command: "python3 -m base_server".to_string(),
            cwd: None,
            shell_prelude: None,
            kill_patterns: vec!["base_server".to_string()],
            health_probe: None,
            auto_restart: false,
            depends_on: vec![],
        },
    );
    services.insert(
        "franka_server".to_string(),
        ServiceDefinition {
            name: "Franka server".to_string(),
            command: "./franka_server".to_string(),
            cwd: None,
            shell_prelude: None,
            kill_patterns: vec!["franka_server".to_string()],
            health_probe: None,
            auto_restart: false,
            depends_on: vec![],
        },
    );
    services.insert(
        "controller".to_string(),
        ServiceDefinition {
            name: "Controller".to_string(),
            command: "python3 -m controller".to_string(),
            cwd: None,
            shell_prelude: None,
            kill_patterns: vec!["controller".to_string()],
            health_probe: None,
            auto_restart: false,
            depends_on: vec!["base_server".to_string(), "franka_server".to_string()],
        },
    );
    services
}

impl Default for ServiceManagerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_start: false,
            startup_stagger: default_startup_stagger(),
            health_interval: default_health_interval(),
            stop_timeout: default_service_stop_timeout(),
            log_lines: default_log_lines(),
            pid_file: default_pid_file(),
            restart: RestartPolicy::default(),
            definitions: default_services(),
        }
    }
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct GatewayConfig {
    pub server: ServerConfig,
    pub arm: ArmBackendConfig,
    pub base: BaseBackendConfig,
    pub gripper: GripperBackendConfig,
    pub cameras: CameraConfig,
    pub safety: SafetyConfig,
    pub lease: LeaseConfig,
    pub rewind: RewindConfig,
    pub executor: ExecutorConfig,
    pub services: ServiceManagerConfig,
}

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// The file is not valid TOML for this schema.
    #[error("failed to parse config file: {0}")]
    Parse(String),
}

impl GatewayConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let mut config: Self =
            toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.rewind.sanitize();
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.max_trajectory_length, 10_000);
        assert!(config.services.definitions.contains_key("controller"));
        assert_eq!(
            config.services.definitions["controller"].depends_on,
            vec!["base_server", "franka_server"]
        );
    }

    #[test]
    fn test_partial_toml_roundtrip() {
        let toml = r#"
            [server]
            port = 9090
            dry_run = true

            [lease]
            idle_timeout = "45s"

            [rewind]
            chunk_size = 100
        "#;
        let mut config: GatewayConfig = toml::from_str(toml).unwrap();
        config.rewind.sanitize();

        assert_eq!(config.server.port, 9090);
        assert!(config.server.dry_run);
        assert_eq!(config.lease.idle_timeout, Duration::from_secs(45));
        // Out-of-range chunk sizes are clamped.
        assert_eq!(config.rewind.chunk_size, 50);
        // Untouched sections keep their defaults.
        assert_eq!(config.base.port, 50000);
    }
}

mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
