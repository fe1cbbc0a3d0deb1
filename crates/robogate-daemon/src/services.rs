//! Service runtime.
//!
//! Owns the backend processes described by the service definitions: spawn
//! in their own process groups, capture stdout/stderr into the per-service
//! log rings, poll health at a fixed interval, cascade stops through the
//! dependency graph, auto-restart crashed services with bounded backoff,
//! and persist PIDs so a crashed gateway does not orphan its children.
//!
//! All state decisions live in [`ServiceRegistry`]; this module only does
//! the I/O around them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use nix::sys::signal::Signal;
use robogate_core::config::ServiceManagerConfig;
use robogate_core::supervisor::{
    ServiceRegistry, ServiceState, ServiceStatus, SupervisorError,
};
use robogate_core::GatewayError;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::feedback::FeedbackHub;

/// Runtime driving the supervised backend processes.
pub struct ServiceRuntime {
    cfg: ServiceManagerConfig,
    dry_run: bool,
    registry: Arc<StdMutex<ServiceRegistry>>,
    children: Arc<tokio::sync::Mutex<HashMap<String, Child>>>,
    feedback: FeedbackHub,
}

impl ServiceRuntime {
    /// Build the runtime from configuration. Rejects duplicate keys,
    /// unknown dependencies, and dependency cycles.
    ///
    /// # Errors
    ///
    /// Returns the registry's [`SupervisorError`] for invalid definitions.
    pub fn new(
        cfg: ServiceManagerConfig,
        dry_run: bool,
        feedback: FeedbackHub,
    ) -> Result<Self, SupervisorError> {
        let mut registry = ServiceRegistry::new(cfg.restart.clone(), cfg.log_lines);
        for (key, definition) in &cfg.definitions {
            registry.register(key.clone(), definition.clone())?;
        }
        registry.validate()?;
        Ok(Self {
            cfg,
            dry_run,
            registry: Arc::new(StdMutex::new(registry)),
            children: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
            feedback,
        })
    }

    /// Registered service keys.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.registry.lock().expect("registry lock").keys()
    }

    /// Status of one service.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidArgument`] for unknown keys.
    pub fn status(&self, key: &str) -> Result<ServiceStatus, GatewayError> {
        Ok(self.registry.lock().expect("registry lock").status(key)?)
    }

    /// Statuses of every service.
    #[must_use]
    pub fn statuses(&self) -> Vec<ServiceStatus> {
        self.registry.lock().expect("registry lock").statuses()
    }

    /// The last `lines` log lines of a service.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidArgument`] for unknown keys.
    pub fn logs(&self, key: &str, lines: usize) -> Result<Vec<String>, GatewayError> {
        Ok(self
            .registry
            .lock()
            .expect("registry lock")
            .tail_logs(key, lines)?)
    }

    /// On startup: signal any PIDs left by a previous run, sweep kill
    /// patterns, and remove the stale PID file.
    pub async fn adopt_or_cleanup(&self) {
        if let Ok(text) = std::fs::read_to_string(&self.cfg.pid_file) {
            if let Ok(pids) = serde_json::from_str::<HashMap<String, u32>>(&text) {
                for (key, pid) in pids {
                    info!(key, pid, "terminating orphaned service from previous run");
                    signal_group(pid, Signal::SIGTERM);
                }
            }
            let _ = std::fs::remove_file(&self.cfg.pid_file);
        }

        if !self.dry_run {
            let patterns: Vec<String> = {
                let registry = self.registry.lock().expect("registry lock");
                registry
                    .keys()
                    .iter()
                    .filter_map(|k| registry.get(k))
                    .flat_map(|r| r.definition.kill_patterns.clone())
                    .collect()
            };
            for pattern in patterns {
                sweep_pattern(&pattern).await;
            }
        }
    }

    /// Auto-start every service in dependency order, staggered.
    pub async fn auto_start(&self) {
        let keys = self.keys();
        let mut remaining: Vec<String> = keys;
        // Dependency order: keep retrying until nothing new starts.
        for _ in 0..remaining.len().max(1) {
            let mut next = Vec::new();
            for key in remaining {
                match self.start(&key).await {
                    Ok(_) => tokio::time::sleep(self.cfg.startup_stagger).await,
                    Err(GatewayError::DependencyNotRunning { .. }) => next.push(key),
                    Err(e) => warn!(key, error = %e, "auto-start failed"),
                }
            }
            if next.is_empty() {
                break;
            }
            remaining = next;
        }
    }

    /// Start a service.
    ///
    /// # Errors
    ///
    /// [`GatewayError::DependencyNotRunning`] when dependencies are not
    /// running, [`GatewayError::Busy`] when already active, or an internal
    /// error when the spawn fails.
    pub async fn start(&self, key: &str) -> Result<ServiceStatus, GatewayError> {
        let definition = {
            let registry = self.registry.lock().expect("registry lock");
            match registry.can_start(key) {
                Ok(()) => {},
                Err(SupervisorError::AlreadyRunning(_)) => return Err(GatewayError::Busy),
                Err(e) => return Err(e.into()),
            }
            registry
                .get(key)
                .map(|r| r.definition.clone())
                .ok_or_else(|| GatewayError::InvalidArgument(format!("unknown service: {key}")))?
        };

        if self.dry_run {
            let mut registry = self.registry.lock().expect("registry lock");
            registry.mark_started(key, 0);
            registry.record_health(key, true);
            registry.push_log(key, "[dry-run] started");
            drop(registry);
            self.feedback.service_event("service_started", key);
            return self.status(key);
        }

        let command_line = match &definition.shell_prelude {
            Some(prelude) => format!("{prelude} {}", definition.command),
            None => definition.command.clone(),
        };

        let mut command = Command::new("bash");
        command
            .arg("-c")
            .arg(&command_line)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(false);
        if let Some(cwd) = &definition.cwd {
            command.current_dir(cwd);
        }
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|e| {
            self.registry
                .lock()
                .expect("registry lock")
                .mark_stopped(key, true);
            GatewayError::Internal(format!("failed to spawn '{key}': {e}"))
        })?;
        let pid = child.id().unwrap_or_default();

        if let Some(stdout) = child.stdout.take() {
            self.spawn_log_reader(key.to_string(), stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            self.spawn_log_reader(key.to_string(), stderr);
        }

        {
            let mut registry = self.registry.lock().expect("registry lock");
            registry.mark_started(key, pid);
            registry.push_log(key, format!("[started pid={pid}]"));
        }
        self.children.lock().await.insert(key.to_string(), child);
        self.save_pids();
        self.feedback.service_event("service_started", key);
        info!(key, pid, "service started");
        self.status(key)
    }

    /// Stop a service and cascade to everything depending on it,
    /// breadth-first and synchronously per wave.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidArgument`] for unknown keys.
    pub async fn stop(&self, key: &str) -> Result<ServiceStatus, GatewayError> {
        let waves = {
            let registry = self.registry.lock().expect("registry lock");
            if registry.get(key).is_none() {
                return Err(GatewayError::InvalidArgument(format!(
                    "unknown service: {key}"
                )));
            }
            registry.stop_waves(key)
        };

        self.stop_one(key).await;
        for wave in waves {
            for dependent in wave {
                info!(key = dependent, root = key, "stopping dependent service");
                self.stop_one(&dependent).await;
            }
        }
        self.status(key)
    }

    /// Restart a service (with its stop cascade).
    ///
    /// # Errors
    ///
    /// Propagates stop and start failures.
    pub async fn restart(&self, key: &str) -> Result<ServiceStatus, GatewayError> {
        self.stop(key).await?;
        tokio::time::sleep(Duration::from_millis(500)).await;
        self.start(key).await
    }

    /// Health loop: probe active services every interval, mark crashes,
    /// auto-restart, and stop services whose dependencies went down.
    pub async fn run_health_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.cfg.health_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {},
            }
            if self.dry_run {
                continue;
            }
            Self::health_tick(&self).await;
        }
    }

    /// Stop every service, dependents before their dependencies.
    pub async fn shutdown(&self) {
        for _ in 0..self.keys().len().max(1) {
            let active: Vec<String> = {
                let registry = self.registry.lock().expect("registry lock");
                registry
                    .keys()
                    .into_iter()
                    .filter(|k| registry.get(k).is_some_and(|r| r.state.is_active()))
                    .collect()
            };
            if active.is_empty() {
                break;
            }
            // Leaves first: services with no active dependents.
            let leaves: Vec<String> = {
                let registry = self.registry.lock().expect("registry lock");
                active
                    .iter()
                    .filter(|k| {
                        registry
                            .dependents_of(k)
                            .iter()
                            .all(|d| registry.get(d).map_or(true, |r| !r.state.is_active()))
                    })
                    .cloned()
                    .collect()
            };
            let batch = if leaves.is_empty() { active } else { leaves };
            for key in batch {
                self.stop_one(&key).await;
            }
        }
        let _ = std::fs::remove_file(&self.cfg.pid_file);
    }

    // -- internals -----------------------------------------------------------

    async fn health_tick(this: &Arc<Self>) {
        let keys = this.keys();

        for key in &keys {
            let (state, auto_restart, probe) = {
                let registry = this.registry.lock().expect("registry lock");
                let Some(record) = registry.get(key) else { continue };
                (
                    record.state,
                    record.definition.auto_restart,
                    record.definition.health_probe.clone(),
                )
            };
            if !state.is_active() {
                continue;
            }

            // Liveness: the tracked child must still be running.
            let exited = {
                let mut children = this.children.lock().await;
                match children.get_mut(key) {
                    Some(child) => match child.try_wait() {
                        Ok(Some(status)) => {
                            children.remove(key);
                            Some(status.code())
                        },
                        Ok(None) => None,
                        Err(e) => {
                            warn!(key, error = %e, "child wait failed");
                            children.remove(key);
                            Some(None)
                        },
                    },
                    None => Some(None),
                }
            };

            if let Some(code) = exited {
                warn!(key, ?code, "service crashed");
                {
                    let mut registry = this.registry.lock().expect("registry lock");
                    registry.mark_stopped(key, true);
                    registry.push_log(key, format!("[exited with code {code:?}]"));
                }
                this.save_pids();
                this.feedback.service_event("service_crashed", key);

                if auto_restart {
                    let delay = this
                        .registry
                        .lock()
                        .expect("registry lock")
                        .record_restart(key);
                    let runtime = Arc::clone(this);
                    let key = key.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        match runtime.start(&key).await {
                            Ok(_) => info!(key, "service auto-restarted"),
                            Err(e) => warn!(key, error = %e, "auto-restart failed"),
                        }
                    });
                }
                continue;
            }

            // Alive: run the definition probe, defaulting to process-alive.
            let healthy = match &probe {
                Some(probe) => run_probe(probe).await,
                None => true,
            };
            let transition = this
                .registry
                .lock()
                .expect("registry lock")
                .record_health(key, healthy);
            match transition {
                Some(ServiceState::Unhealthy) => {
                    warn!(key, "service unhealthy");
                    this.feedback.service_event("service_unhealthy", key);
                },
                Some(ServiceState::Running) => {
                    this.feedback.service_event("service_running", key);
                },
                _ => {},
            }
        }

        // Dependency cascade: anything whose dependency left `running`
        // is scheduled to stop.
        let to_stop: Vec<String> = {
            let registry = this.registry.lock().expect("registry lock");
            keys.iter()
                .filter(|k| registry.get(k).is_some_and(|r| r.state.is_active()))
                .filter(|k| registry.dependencies_down(k))
                .cloned()
                .collect()
        };
        for key in to_stop {
            warn!(key, "dependencies down, stopping service");
            {
                let mut registry = this.registry.lock().expect("registry lock");
                registry.push_log(&key, "[stopping: dependencies down]");
            }
            let _ = this.stop(&key).await;
        }
    }

    async fn stop_one(&self, key: &str) {
        let (was_active, kill_patterns) = {
            let mut registry = self.registry.lock().expect("registry lock");
            let Some(record) = registry.get(key) else { return };
            let was_active = record.state.is_active();
            let patterns = record.definition.kill_patterns.clone();
            if was_active {
                registry.set_state(key, ServiceState::Stopping);
            }
            (was_active, patterns)
        };

        if self.dry_run {
            let mut registry = self.registry.lock().expect("registry lock");
            registry.mark_stopped(key, false);
            registry.push_log(key, "[stopped]");
            drop(registry);
            if was_active {
                self.feedback.service_event("service_stopped", key);
            }
            return;
        }

        let child = self.children.lock().await.remove(key);
        if let Some(mut child) = child {
            if let Some(pid) = child.id() {
                signal_group(pid, Signal::SIGTERM);
                match tokio::time::timeout(self.cfg.stop_timeout, child.wait()).await {
                    Ok(_) => {},
                    Err(_) => {
                        warn!(key, "graceful stop timed out, sending SIGKILL");
                        signal_group(pid, Signal::SIGKILL);
                        let _ = child.wait().await;
                    },
                }
            }
        }

        // Sweep by pattern to catch children that escaped the group.
        for pattern in &kill_patterns {
            sweep_pattern(pattern).await;
        }

        {
            let mut registry = self.registry.lock().expect("registry lock");
            registry.mark_stopped(key, false);
            registry.push_log(key, "[stopped]");
        }
        self.save_pids();
        if was_active {
            self.feedback.service_event("service_stopped", key);
            info!(key, "service stopped");
        }
    }

    fn spawn_log_reader(
        &self,
        key: String,
        stream: impl tokio::io::AsyncRead + Unpin + Send + 'static,
    ) {
        let registry = Arc::clone(&self.registry);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stream).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                registry.lock().expect("registry lock").push_log(&key, line);
            }
        });
    }

    fn save_pids(&self) {
        let pids = self.registry.lock().expect("registry lock").pid_snapshot();
        match serde_json::to_string(&pids) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&self.cfg.pid_file, json) {
                    warn!(error = %e, "failed to persist service PIDs");
                }
            },
            Err(e) => warn!(error = %e, "failed to encode service PIDs"),
        }
    }
}

async fn run_probe(probe: &str) -> bool {
    let result = tokio::time::timeout(
        Duration::from_secs(5),
        Command::new("bash").arg("-c").arg(probe).output(),
    )
    .await;
    matches!(result, Ok(Ok(output)) if output.status.success())
}

async fn sweep_pattern(pattern: &str) {
    let _ = Command::new("pkill")
        .arg("-TERM")
        .arg("-f")
        .arg(pattern)
        .output()
        .await;
}

fn signal_group(pid: u32, signal: Signal) {
    #[allow(clippy::cast_possible_wrap)]
    let pid = nix::unistd::Pid::from_raw(pid as i32);
    if let Err(e) = nix::sys::signal::killpg(pid, signal) {
        warn!(%pid, ?signal, error = %e, "killpg failed");
    }
}

#[cfg(test)]
mod tests {
    use robogate_core::supervisor::ServiceDefinition;

    use super::*;

    fn manager_config() -> ServiceManagerConfig {
        ServiceManagerConfig {
            pid_file: std::env::temp_dir().join(format!(
                "robogate-test-pids-{}.json",
                uuid::Uuid::new_v4()
            )),
            health_interval: Duration::from_millis(50),
            ..ServiceManagerConfig::default()
        }
    }

    fn runtime(dry_run: bool) -> Arc<ServiceRuntime> {
        Arc::new(ServiceRuntime::new(manager_config(), dry_run, FeedbackHub::new()).unwrap())
    }

    #[tokio::test]
    async fn test_dry_run_start_requires_dependencies() {
        let runtime = runtime(true);

        let err = runtime.start("controller").await.unwrap_err();
        assert!(matches!(err, GatewayError::DependencyNotRunning { .. }));

        runtime.start("base_server").await.unwrap();
        runtime.start("franka_server").await.unwrap();
        let status = runtime.start("controller").await.unwrap();
        assert_eq!(status.state, ServiceState::Running);
    }

    #[tokio::test]
    async fn test_stop_cascades_to_dependents() {
        let runtime = runtime(true);
        runtime.start("base_server").await.unwrap();
        runtime.start("franka_server").await.unwrap();
        runtime.start("controller").await.unwrap();

        runtime.stop("base_server").await.unwrap();

        assert_eq!(
            runtime.status("base_server").unwrap().state,
            ServiceState::Stopped
        );
        assert_eq!(
            runtime.status("controller").unwrap().state,
            ServiceState::Stopped
        );
        // franka_server does not depend on base_server and keeps running.
        assert_eq!(
            runtime.status("franka_server").unwrap().state,
            ServiceState::Running
        );
    }

    #[tokio::test]
    async fn test_double_start_is_busy() {
        let runtime = runtime(true);
        runtime.start("base_server").await.unwrap();
        assert!(matches!(
            runtime.start("base_server").await,
            Err(GatewayError::Busy)
        ));
    }

    #[tokio::test]
    async fn test_live_spawn_and_log_capture() {
        let mut cfg = manager_config();
        cfg.definitions.clear();
        cfg.definitions.insert(
            "echoer".to_string(),
            ServiceDefinition {
                name: "Echoer".to_string(),
                command: "echo live-marker; sleep 5".to_string(),
                cwd: None,
                shell_prelude: None,
                kill_patterns: vec![],
                health_probe: None,
                auto_restart: false,
                depends_on: vec![],
            },
        );
        cfg.stop_timeout = Duration::from_millis(500);
        let runtime =
            Arc::new(ServiceRuntime::new(cfg, false, FeedbackHub::new()).unwrap());

        let status = runtime.start("echoer").await.unwrap();
        assert_eq!(status.state, ServiceState::Starting);
        assert!(status.pid.is_some());

        // The log reader should capture the echoed line.
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            let logs = runtime.logs("echoer", 50).unwrap();
            if logs.iter().any(|l| l.contains("live-marker")) {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "log never captured");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        runtime.stop("echoer").await.unwrap();
        assert_eq!(
            runtime.status("echoer").unwrap().state,
            ServiceState::Stopped
        );
    }

    #[tokio::test]
    async fn test_shutdown_stops_everything() {
        let runtime = runtime(true);
        runtime.start("base_server").await.unwrap();
        runtime.start("franka_server").await.unwrap();
        runtime.start("controller").await.unwrap();

        runtime.shutdown().await;
        for status in runtime.statuses() {
            assert_eq!(status.state, ServiceState::Stopped);
        }
    }
}
