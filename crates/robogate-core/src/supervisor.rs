//! Service supervisor state machine.
//!
//! The registry tracks every managed backend process: its definition, state,
//! health history, restart budget, and a bounded ring of recent log lines.
//! Process I/O (spawning, signals, stdout readers) lives in the daemon; the
//! registry only decides what is allowed.
//!
//! ```text
//!  stopped ──start──► starting ──health_ok──► running
//!   ▲                   │                      │
//!   │                   └──spawn_fail──► crashed
//!   │                                          │
//!   └───stop/exit◄──stopping◄──stop/dep_down───┘
//!                                  │
//!                      unhealthy◄──(consecutive failed probes)
//! ```
//!
//! Start rule: a service may leave `stopped` only when every dependency is
//! `running`. Stop rule: when a service leaves `running`, its dependents are
//! scheduled to stop in breadth-first waves. Dependency graphs must be
//! acyclic; cycles are rejected at registration time.

use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Consecutive failed probes before a running service is marked unhealthy.
pub const UNHEALTHY_THRESHOLD: u32 = 3;

/// Consecutive successful probes before an unhealthy service recovers.
pub const HEALTHY_THRESHOLD: u32 = 1;

/// Definition of one managed service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDefinition {
    /// Human-readable name.
    pub name: String,

    /// Shell command line to run.
    pub command: String,

    /// Working directory.
    #[serde(default)]
    pub cwd: Option<PathBuf>,

    /// Shell fragment prepended to the command (environment setup).
    #[serde(default)]
    pub shell_prelude: Option<String>,

    /// Command-line patterns used to sweep up orphaned children on stop.
    #[serde(default)]
    pub kill_patterns: Vec<String>,

    /// Optional shell probe run on each health tick; exit 0 means healthy.
    /// When absent, process liveness is the probe.
    #[serde(default)]
    pub health_probe: Option<String>,

    /// Restart automatically after a crash.
    #[serde(default)]
    pub auto_restart: bool,

    /// Keys of services that must be `running` before this one starts.
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// Lifecycle state of a managed service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    /// Not running.
    #[default]
    Stopped,
    /// Spawned, waiting for the first successful health probe.
    Starting,
    /// Alive and healthy.
    Running,
    /// Alive but failing health probes.
    Unhealthy,
    /// Graceful stop in progress.
    Stopping,
    /// Exited unexpectedly.
    Crashed,
}

impl ServiceState {
    /// Whether the underlying process is expected to be alive.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Unhealthy)
    }
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Unhealthy => write!(f, "unhealthy"),
            Self::Stopping => write!(f, "stopping"),
            Self::Crashed => write!(f, "crashed"),
        }
    }
}

/// Bounded exponential backoff applied between automatic restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestartPolicy {
    /// Delay before the first restart.
    #[serde(default = "default_initial_delay")]
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,

    /// Cap on the restart delay.
    #[serde(default = "default_max_delay")]
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,

    /// Delay multiplier per consecutive restart.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

const fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

const fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

const fn default_multiplier() -> f64 {
    2.0
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            multiplier: default_multiplier(),
        }
    }
}

impl RestartPolicy {
    /// Delay before restart attempt `attempt` (1-based).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        #[allow(clippy::cast_possible_wrap)] // restart counts stay tiny
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32 - 1);
        Duration::from_secs_f64(secs).min(self.max_delay)
    }
}

/// Runtime record for one service.
#[derive(Debug)]
pub struct ServiceRecord {
    /// Static definition.
    pub definition: ServiceDefinition,
    /// Current lifecycle state.
    pub state: ServiceState,
    /// OS process id while active.
    pub pid: Option<u32>,
    /// When the current process was spawned.
    pub started_at: Option<DateTime<Utc>>,
    /// When the last health probe ran.
    pub last_health: Option<DateTime<Utc>>,
    /// Restarts since registration.
    pub restart_count: u32,
    consecutive_failures: u32,
    consecutive_successes: u32,
    logs: VecDeque<String>,
    log_capacity: usize,
}

impl ServiceRecord {
    fn new(definition: ServiceDefinition, log_capacity: usize) -> Self {
        Self {
            definition,
            state: ServiceState::Stopped,
            pid: None,
            started_at: None,
            last_health: None,
            restart_count: 0,
            consecutive_failures: 0,
            consecutive_successes: 0,
            logs: VecDeque::new(),
            log_capacity: log_capacity.max(1),
        }
    }

    /// Seconds since the current process was spawned.
    #[must_use]
    pub fn uptime_secs(&self) -> Option<i64> {
        self.started_at.map(|s| (Utc::now() - s).num_seconds())
    }

    /// Append a log line, evicting the oldest once the ring is full.
    pub fn push_log(&mut self, line: impl Into<String>) {
        if self.logs.len() == self.log_capacity {
            self.logs.pop_front();
        }
        self.logs.push_back(line.into());
    }

    /// The last `n` log lines, oldest first.
    #[must_use]
    pub fn tail_logs(&self, n: usize) -> Vec<String> {
        let skip = self.logs.len().saturating_sub(n);
        self.logs.iter().skip(skip).cloned().collect()
    }
}

/// Serializable status view of one service.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub key: String,
    pub name: String,
    pub state: ServiceState,
    pub pid: Option<u32>,
    pub uptime_s: Option<i64>,
    pub restart_count: u32,
    pub depends_on: Vec<String>,
}

/// Supervisor errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SupervisorError {
    /// No service registered under this key.
    #[error("unknown service: {0}")]
    UnknownService(String),

    /// A service with this key already exists.
    #[error("service '{0}' already registered")]
    DuplicateService(String),

    /// A definition names a dependency that is not registered.
    #[error("service '{service}' depends on unknown service '{dependency}'")]
    UnknownDependency {
        service: String,
        dependency: String,
    },

    /// The dependency graph contains a cycle.
    #[error("cyclic service dependencies: {0:?}")]
    CyclicDependency(Vec<String>),

    /// Start refused because dependencies are not running.
    #[error("service '{service}' dependencies not running: {missing:?}")]
    DependencyNotRunning {
        service: String,
        missing: Vec<String>,
    },

    /// The service is already active.
    #[error("service '{0}' is already running")]
    AlreadyRunning(String),
}

/// Registry of managed services. Pure bookkeeping; the daemon's service
/// runtime drives it under a single lock.
#[derive(Debug, Default)]
pub struct ServiceRegistry {
    services: BTreeMap<String, ServiceRecord>,
    restart_policy: RestartPolicy,
    log_capacity: usize,
}

impl ServiceRegistry {
    /// Create a registry whose log rings keep `log_capacity` lines each.
    #[must_use]
    pub fn new(restart_policy: RestartPolicy, log_capacity: usize) -> Self {
        Self {
            services: BTreeMap::new(),
            restart_policy,
            log_capacity: log_capacity.max(1),
        }
    }

    /// Register a service definition.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::DuplicateService`] when the key is taken.
    pub fn register(
        &mut self,
        key: impl Into<String>,
        definition: ServiceDefinition,
    ) -> Result<(), SupervisorError> {
        let key = key.into();
        if self.services.contains_key(&key) {
            return Err(SupervisorError::DuplicateService(key));
        }
        self.services
            .insert(key, ServiceRecord::new(definition, self.log_capacity));
        Ok(())
    }

    /// Validate the dependency graph: all dependencies exist and the graph
    /// is acyclic.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::UnknownDependency`] or
    /// [`SupervisorError::CyclicDependency`].
    pub fn validate(&self) -> Result<(), SupervisorError> {
        for (key, record) in &self.services {
            for dep in &record.definition.depends_on {
                if !self.services.contains_key(dep) {
                    return Err(SupervisorError::UnknownDependency {
                        service: key.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        // Depth-first cycle search. 0 = unvisited, 1 = on stack, 2 = done.
        let mut color: BTreeMap<&str, u8> = BTreeMap::new();
        for key in self.services.keys() {
            if color.get(key.as_str()).copied().unwrap_or(0) == 0 {
                self.dfs_cycle(key, &mut color, &mut Vec::new())?;
            }
        }
        Ok(())
    }

    fn dfs_cycle<'a>(
        &'a self,
        key: &'a str,
        color: &mut BTreeMap<&'a str, u8>,
        stack: &mut Vec<String>,
    ) -> Result<(), SupervisorError> {
        color.insert(key, 1);
        stack.push(key.to_string());
        if let Some(record) = self.services.get(key) {
            for dep in &record.definition.depends_on {
                match color.get(dep.as_str()).copied().unwrap_or(0) {
                    0 => self.dfs_cycle(dep, color, stack)?,
                    1 => {
                        let mut cycle = stack.clone();
                        cycle.push(dep.clone());
                        return Err(SupervisorError::CyclicDependency(cycle));
                    },
                    _ => {},
                }
            }
        }
        stack.pop();
        color.insert(key, 2);
        Ok(())
    }

    /// Whether `key` may transition `stopped → starting`.
    ///
    /// # Errors
    ///
    /// [`SupervisorError::UnknownService`] for unknown keys,
    /// [`SupervisorError::AlreadyRunning`] when active, and
    /// [`SupervisorError::DependencyNotRunning`] listing the missing
    /// dependencies otherwise.
    pub fn can_start(&self, key: &str) -> Result<(), SupervisorError> {
        let record = self
            .services
            .get(key)
            .ok_or_else(|| SupervisorError::UnknownService(key.to_string()))?;
        if record.state.is_active() {
            return Err(SupervisorError::AlreadyRunning(key.to_string()));
        }
        let missing: Vec<String> = record
            .definition
            .depends_on
            .iter()
            .filter(|dep| {
                self.services
                    .get(dep.as_str())
                    .map_or(true, |r| r.state != ServiceState::Running)
            })
            .cloned()
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(SupervisorError::DependencyNotRunning {
                service: key.to_string(),
                missing,
            })
        }
    }

    /// Record a successful spawn.
    pub fn mark_started(&mut self, key: &str, pid: u32) {
        if let Some(record) = self.services.get_mut(key) {
            record.state = ServiceState::Starting;
            record.pid = Some(pid);
            record.started_at = Some(Utc::now());
            record.consecutive_failures = 0;
            record.consecutive_successes = 0;
        }
    }

    /// Record a stop or exit. `crashed` selects the terminal state.
    pub fn mark_stopped(&mut self, key: &str, crashed: bool) {
        if let Some(record) = self.services.get_mut(key) {
            record.state = if crashed {
                ServiceState::Crashed
            } else {
                ServiceState::Stopped
            };
            record.pid = None;
            record.started_at = None;
        }
    }

    /// Set a state directly (e.g. `stopping` while signalling).
    pub fn set_state(&mut self, key: &str, state: ServiceState) {
        if let Some(record) = self.services.get_mut(key) {
            record.state = state;
        }
    }

    /// Bump the restart counter and return the backoff delay to apply.
    pub fn record_restart(&mut self, key: &str) -> Duration {
        let Some(record) = self.services.get_mut(key) else {
            return self.restart_policy.initial_delay;
        };
        record.restart_count += 1;
        self.restart_policy.delay_for_attempt(record.restart_count)
    }

    /// Record a health probe outcome. Returns the new state when the probe
    /// caused a transition.
    pub fn record_health(&mut self, key: &str, healthy: bool) -> Option<ServiceState> {
        let record = self.services.get_mut(key)?;
        record.last_health = Some(Utc::now());
        if healthy {
            record.consecutive_successes += 1;
            record.consecutive_failures = 0;
            match record.state {
                ServiceState::Starting => {
                    record.state = ServiceState::Running;
                    Some(ServiceState::Running)
                },
                ServiceState::Unhealthy
                    if record.consecutive_successes >= HEALTHY_THRESHOLD =>
                {
                    record.state = ServiceState::Running;
                    Some(ServiceState::Running)
                },
                _ => None,
            }
        } else {
            record.consecutive_failures += 1;
            record.consecutive_successes = 0;
            if record.state == ServiceState::Running
                && record.consecutive_failures >= UNHEALTHY_THRESHOLD
            {
                record.state = ServiceState::Unhealthy;
                Some(ServiceState::Unhealthy)
            } else {
                None
            }
        }
    }

    /// Whether any of `key`'s dependencies has left the `running` state.
    #[must_use]
    pub fn dependencies_down(&self, key: &str) -> bool {
        self.services.get(key).is_some_and(|record| {
            record.definition.depends_on.iter().any(|dep| {
                self.services
                    .get(dep)
                    .map_or(true, |r| r.state != ServiceState::Running)
            })
        })
    }

    /// Services that directly depend on `key`.
    #[must_use]
    pub fn dependents_of(&self, key: &str) -> Vec<String> {
        self.services
            .iter()
            .filter(|(_, r)| r.definition.depends_on.iter().any(|d| d == key))
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Breadth-first waves of active dependents to stop when `key` leaves
    /// `running`. Wave `i + 1` depends on wave `i`; the root itself is not
    /// included.
    #[must_use]
    pub fn stop_waves(&self, key: &str) -> Vec<Vec<String>> {
        let mut waves = Vec::new();
        let mut frontier = vec![key.to_string()];
        let mut seen = vec![key.to_string()];

        loop {
            let mut next = Vec::new();
            for node in &frontier {
                for dep in self.dependents_of(node) {
                    let active = self
                        .services
                        .get(&dep)
                        .is_some_and(|r| r.state.is_active());
                    if active && !seen.contains(&dep) {
                        seen.push(dep.clone());
                        next.push(dep);
                    }
                }
            }
            if next.is_empty() {
                break;
            }
            waves.push(next.clone());
            frontier = next;
        }
        waves
    }

    /// PIDs of all active services, for persistence across restarts.
    #[must_use]
    pub fn pid_snapshot(&self) -> BTreeMap<String, u32> {
        self.services
            .iter()
            .filter(|(_, r)| r.state.is_active())
            .filter_map(|(k, r)| r.pid.map(|pid| (k.clone(), pid)))
            .collect()
    }

    /// Append a log line to a service's ring.
    pub fn push_log(&mut self, key: &str, line: impl Into<String>) {
        if let Some(record) = self.services.get_mut(key) {
            record.push_log(line);
        }
    }

    /// The last `n` log lines of a service.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::UnknownService`] for unknown keys.
    pub fn tail_logs(&self, key: &str, n: usize) -> Result<Vec<String>, SupervisorError> {
        self.services
            .get(key)
            .map(|r| r.tail_logs(n))
            .ok_or_else(|| SupervisorError::UnknownService(key.to_string()))
    }

    /// A record by key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&ServiceRecord> {
        self.services.get(key)
    }

    /// Registered keys.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.services.keys().cloned().collect()
    }

    /// Status view of one service.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::UnknownService`] for unknown keys.
    pub fn status(&self, key: &str) -> Result<ServiceStatus, SupervisorError> {
        let record = self
            .services
            .get(key)
            .ok_or_else(|| SupervisorError::UnknownService(key.to_string()))?;
        Ok(ServiceStatus {
            key: key.to_string(),
            name: record.definition.name.clone(),
            state: record.state,
            pid: record.pid,
            uptime_s: record.uptime_secs(),
            restart_count: record.restart_count,
            depends_on: record.definition.depends_on.clone(),
        })
    }

    /// Status views of every service.
    #[must_use]
    pub fn statuses(&self) -> Vec<ServiceStatus> {
        self.services
            .keys()
            .filter_map(|k| self.status(k).ok())
            .collect()
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
