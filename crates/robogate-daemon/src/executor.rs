//! Sandboxed command-script executor.
//!
//! Submitted code never runs in the gateway's address space. The executor
//! writes the code plus a generated prelude into a scratch file and spawns
//! an interpreter child in its own process group. The prelude is a small
//! RPC shim: arm/base/gripper/sensor/rewind calls are HTTP requests back
//! into the gateway, carrying the submitter's lease token from the
//! environment, so every scripted command passes the same lease and safety
//! gates as a direct one.
//!
//! At most one execution is live at a time. Timeouts are enforced by
//! termination; `stop()` sends SIGTERM, waits a grace window, then SIGKILL.
//! Every exit path ends with the arm holding at its current pose and the
//! base at zero velocity.

use std::collections::VecDeque;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use nix::sys::signal::Signal;
use robogate_core::config::ExecutorConfig;
use robogate_core::GatewayError;
use serde::Serialize;
use tokio::io::AsyncReadExt;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::backends::{ArmAdapter, BaseAdapter};

/// Lifecycle of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    /// Accepted, child not yet spawned.
    Pending,
    /// Child is running.
    Running,
    /// Child exited zero.
    Completed,
    /// Child exited nonzero or failed to spawn.
    Failed,
    /// Child was killed at the deadline.
    Timeout,
    /// Child was stopped on request.
    Stopped,
}

impl std::fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Timeout => write!(f, "timeout"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Result record of one execution.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionRecord {
    pub execution_id: String,
    pub state: ExecutionState,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_s: f64,
    pub error: Option<String>,
}

/// Executor status view.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutorStatus {
    pub execution_id: Option<String>,
    pub status: Option<ExecutionState>,
    pub is_running: bool,
}

struct RunningExec {
    execution_id: String,
    pid: u32,
    stop_requested: bool,
}

#[derive(Default)]
struct ExecInner {
    current: Option<RunningExec>,
    last: Option<ExecutionRecord>,
    history: VecDeque<ExecutionRecord>,
}

const HISTORY_LIMIT: usize = 10;

/// Manages the single live script child.
pub struct CodeExecutor {
    cfg: ExecutorConfig,
    server_url: String,
    arm: Arc<ArmAdapter>,
    base: Arc<BaseAdapter>,
    inner: Arc<Mutex<ExecInner>>,
}

impl CodeExecutor {
    /// Create an executor that points script shims at `server_url`.
    #[must_use]
    pub fn new(
        cfg: ExecutorConfig,
        server_url: String,
        arm: Arc<ArmAdapter>,
        base: Arc<BaseAdapter>,
    ) -> Self {
        Self {
            cfg,
            server_url,
            arm,
            base,
            inner: Arc::new(Mutex::new(ExecInner::default())),
        }
    }

    /// Whether a child is live.
    pub async fn is_running(&self) -> bool {
        self.inner.lock().await.current.is_some()
    }

    /// Status of the current or most recent execution.
    pub async fn status(&self) -> ExecutorStatus {
        let inner = self.inner.lock().await;
        match (&inner.current, &inner.last) {
            (Some(running), _) => ExecutorStatus {
                execution_id: Some(running.execution_id.clone()),
                status: Some(ExecutionState::Running),
                is_running: true,
            },
            (None, Some(last)) => ExecutorStatus {
                execution_id: Some(last.execution_id.clone()),
                status: Some(last.state),
                is_running: false,
            },
            (None, None) => ExecutorStatus {
                execution_id: None,
                status: None,
                is_running: false,
            },
        }
    }

    /// The most recent finished result.
    pub async fn last_result(&self) -> Option<ExecutionRecord> {
        self.inner.lock().await.last.clone()
    }

    /// The last `n` finished results, newest first.
    pub async fn history(&self, n: usize) -> Vec<ExecutionRecord> {
        let inner = self.inner.lock().await;
        inner.history.iter().rev().take(n).cloned().collect()
    }

    /// Start an execution.
    ///
    /// # Errors
    ///
    /// [`GatewayError::Busy`] while a child is live,
    /// [`GatewayError::Internal`] when the scratch file or spawn fails.
    pub async fn execute(
        &self,
        code: &str,
        timeout: Option<Duration>,
        lease_id: &str,
    ) -> Result<String, GatewayError> {
        let script = format!("{SDK_PRELUDE}\n# ---- submitted code ----\n{code}\n");
        self.spawn_script(&script, timeout, lease_id).await
    }

    /// Write a ready script to scratch and run it. Split from
    /// [`execute`](Self::execute) so the lifecycle can be exercised without
    /// the generated prelude.
    async fn spawn_script(
        &self,
        script: &str,
        timeout: Option<Duration>,
        lease_id: &str,
    ) -> Result<String, GatewayError> {
        let mut inner = self.inner.lock().await;
        if inner.current.is_some() {
            return Err(GatewayError::Busy);
        }

        let timeout = timeout
            .unwrap_or(self.cfg.default_timeout)
            .min(self.cfg.max_timeout);
        let execution_id = Uuid::new_v4().to_string()[..8].to_string();
        let file = tempfile::Builder::new()
            .prefix("robogate-exec-")
            .suffix(".py")
            .tempfile()
            .and_then(|mut f| {
                f.write_all(script.as_bytes())?;
                f.flush()?;
                Ok(f)
            })
            .map_err(|e| GatewayError::Internal(format!("scratch file: {e}")))?;

        let mut command = tokio::process::Command::new(&self.cfg.interpreter);
        command
            .arg(file.path())
            .env("ROBOGATE_SERVER_URL", &self.server_url)
            .env("ROBOGATE_LEASE_ID", lease_id)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command
            .spawn()
            .map_err(|e| GatewayError::Internal(format!("spawn {}: {e}", self.cfg.interpreter)))?;
        let pid = child
            .id()
            .ok_or_else(|| GatewayError::Internal("spawned child has no pid".to_string()))?;

        let started_at = Utc::now();
        inner.current = Some(RunningExec {
            execution_id: execution_id.clone(),
            pid,
            stop_requested: false,
        });
        drop(inner);

        info!(execution_id, pid, ?timeout, "code execution started");

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let monitor_inner = Arc::clone(&self.inner);
        let arm = Arc::clone(&self.arm);
        let base = Arc::clone(&self.base);
        let monitor_id = execution_id.clone();

        tokio::spawn(async move {
            // Keep the scratch file alive until the child exits.
            let _scratch = file;

            let stdout_task = tokio::spawn(read_all(stdout));
            let stderr_task = tokio::spawn(read_all(stderr));

            let (state, exit_code) =
                match tokio::time::timeout(timeout, child.wait()).await {
                    Ok(Ok(status)) => {
                        let code = status.code();
                        (
                            if code == Some(0) {
                                ExecutionState::Completed
                            } else {
                                ExecutionState::Failed
                            },
                            code,
                        )
                    },
                    Ok(Err(e)) => {
                        warn!(execution_id = monitor_id, error = %e, "child wait failed");
                        (ExecutionState::Failed, None)
                    },
                    Err(_) => {
                        signal_group(pid, Signal::SIGKILL);
                        let _ = child.wait().await;
                        (ExecutionState::Timeout, None)
                    },
                };

            let stdout = stdout_task.await.unwrap_or_default();
            let stderr = stderr_task.await.unwrap_or_default();

            // Safety floor: hold the arm, stop the base, regardless of how
            // the script ended.
            arm.hold_at_current().await;
            if let Err(e) = base.stop().await {
                warn!(error = %e, "base stop after execution failed");
            }

            let mut inner = monitor_inner.lock().await;
            let stop_requested = inner
                .current
                .as_ref()
                .is_some_and(|r| r.stop_requested);
            let state = match state {
                ExecutionState::Failed | ExecutionState::Completed if stop_requested => {
                    ExecutionState::Stopped
                },
                other => other,
            };
            let finished_at = Utc::now();
            let record = ExecutionRecord {
                execution_id: monitor_id.clone(),
                state,
                started_at,
                finished_at: Some(finished_at),
                exit_code,
                stdout,
                stderr,
                duration_s: (finished_at - started_at).num_milliseconds() as f64 / 1000.0,
                error: match state {
                    ExecutionState::Completed => None,
                    ExecutionState::Timeout => {
                        Some(format!("execution timed out after {timeout:?}"))
                    },
                    ExecutionState::Stopped => Some("execution stopped".to_string()),
                    _ => exit_code.map(|c| format!("process exited with code {c}")),
                },
            };
            info!(
                execution_id = monitor_id,
                state = %record.state,
                duration_s = record.duration_s,
                "code execution finished"
            );
            inner.current = None;
            inner.last = Some(record.clone());
            if inner.history.len() == HISTORY_LIMIT {
                inner.history.pop_front();
            }
            inner.history.push_back(record);
        });

        Ok(execution_id)
    }

    /// Stop the live execution, if any. SIGTERM first; SIGKILL after the
    /// grace window. Returns whether anything was running.
    pub async fn stop(&self) -> bool {
        let (pid, execution_id) = {
            let mut inner = self.inner.lock().await;
            let Some(running) = inner.current.as_mut() else {
                return false;
            };
            running.stop_requested = true;
            (running.pid, running.execution_id.clone())
        };

        info!(execution_id, "stopping code execution");
        signal_group(pid, Signal::SIGTERM);

        let grace = self.cfg.stop_grace;
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let still_running = inner
                .lock()
                .await
                .current
                .as_ref()
                .is_some_and(|r| r.execution_id == execution_id);
            if still_running {
                warn!(execution_id, "grace expired, sending SIGKILL");
                signal_group(pid, Signal::SIGKILL);
            }
        });
        true
    }
}

async fn read_all(pipe: Option<impl tokio::io::AsyncRead + Unpin>) -> String {
    let Some(mut pipe) = pipe else {
        return String::new();
    };
    let mut buf = Vec::new();
    let _ = pipe.read_to_end(&mut buf).await;
    String::from_utf8_lossy(&buf).into_owned()
}

fn signal_group(pid: u32, signal: Signal) {
    #[allow(clippy::cast_possible_wrap)]
    let pid = nix::unistd::Pid::from_raw(pid as i32);
    if let Err(e) = nix::sys::signal::killpg(pid, signal) {
        warn!(%pid, ?signal, error = %e, "killpg failed");
    }
}

/// SDK prelude prepended to every submitted script. Pure standard library:
/// each call is an HTTP request back into the gateway carrying the lease
/// token and a source marker, so scripted commands pass the same gates as
/// direct ones and their waypoints are attributed to the script.
const SDK_PRELUDE: &str = r#"
import json as _json
import os as _os
import urllib.error as _urlerror
import urllib.request as _urlrequest

_SERVER = _os.environ.get("ROBOGATE_SERVER_URL", "http://127.0.0.1:8080")
_LEASE = _os.environ.get("ROBOGATE_LEASE_ID", "")


class RobotError(Exception):
    pass


def _call(method, path, body=None):
    data = _json.dumps(body).encode() if body is not None else None
    req = _urlrequest.Request(_SERVER + path, data=data, method=method)
    req.add_header("Content-Type", "application/json")
    req.add_header("X-Command-Source", "script")
    if _LEASE:
        req.add_header("X-Lease-Id", _LEASE)
    try:
        with _urlrequest.urlopen(req, timeout=120) as resp:
            return _json.loads(resp.read().decode())
    except _urlerror.HTTPError as e:
        detail = e.read().decode()
        raise RobotError("{} {} failed ({}): {}".format(method, path, e.code, detail))
    except _urlerror.URLError as e:
        raise RobotError("{} {} unreachable: {}".format(method, path, e.reason))


class _Arm:
    def move_joints(self, q):
        return _call("POST", "/cmd/arm/move", {"mode": "joint_position", "values": list(q)})

    def move_to_pose(self, pose):
        return _call("POST", "/cmd/arm/move", {"mode": "cartesian_pose", "values": list(pose)})

    def joint_velocity(self, dq):
        return _call("POST", "/cmd/arm/move", {"mode": "joint_velocity", "values": list(dq)})

    def cartesian_velocity(self, twist):
        return _call("POST", "/cmd/arm/move", {"mode": "cartesian_velocity", "values": list(twist)})

    def stop(self):
        return _call("POST", "/cmd/arm/stop")


class _Base:
    def move_to(self, x, y, theta):
        return _call("POST", "/cmd/base/move", {"x": x, "y": y, "theta": theta})

    def velocity(self, vx, vy, wz, frame="global"):
        return _call("POST", "/cmd/base/move", {"vx": vx, "vy": vy, "wz": wz, "frame": frame})

    def stop(self):
        return _call("POST", "/cmd/base/stop")


class _Gripper:
    def activate(self):
        return _call("POST", "/cmd/gripper", {"action": "activate"})

    def calibrate(self):
        return _call("POST", "/cmd/gripper", {"action": "calibrate"})

    def move(self, width, speed=0.1):
        return _call("POST", "/cmd/gripper", {"action": "move", "width": width, "speed": speed})

    def open(self, speed=0.1):
        return _call("POST", "/cmd/gripper", {"action": "open", "speed": speed})

    def close(self, speed=0.1):
        return _call("POST", "/cmd/gripper", {"action": "close", "speed": speed})

    def grasp(self, width=0.04, speed=0.1, force=20.0):
        return _call(
            "POST",
            "/cmd/gripper",
            {"action": "grasp", "width": width, "speed": speed, "force": force},
        )

    def stop(self):
        return _call("POST", "/cmd/gripper", {"action": "stop"})


class _Sensors:
    def state(self):
        return _call("GET", "/state")

    def arm_joints(self):
        return self.state()["arm"]["state"]["q"]

    def base_pose(self):
        return self.state()["base"]["state"]["pose"]

    def gripper_width(self):
        return self.state()["gripper"]["state"]["width"]


class _Rewind:
    def steps(self, n, dry_run=False):
        return _call("POST", "/rewind/steps", {"steps": n, "dry_run": dry_run})

    def percentage(self, pct, dry_run=False):
        return _call("POST", "/rewind/percentage", {"percentage": pct, "dry_run": dry_run})

    def status(self):
        return _call("GET", "/rewind/status")


arm = _Arm()
base = _Base()
gripper = _Gripper()
sensors = _Sensors()
rewind = _Rewind()
"#;

#[cfg(test)]
mod tests {
    use robogate_core::config::{ArmBackendConfig, BaseBackendConfig};

    use super::*;

    /// Lifecycle tests run raw shell scripts through `spawn_script`, so
    /// they do not depend on a Python installation.
    fn shell_executor() -> CodeExecutor {
        let arm = Arc::new(ArmAdapter::new(ArmBackendConfig::default(), true));
        let base = Arc::new(BaseAdapter::new(BaseBackendConfig::default(), true));
        let cfg = ExecutorConfig {
            interpreter: "sh".to_string(),
            stop_grace: Duration::from_millis(200),
            ..ExecutorConfig::default()
        };
        CodeExecutor::new(cfg, "http://127.0.0.1:1".to_string(), arm, base)
    }

    async fn wait_finished(exec: &CodeExecutor) -> ExecutionRecord {
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        loop {
            if !exec.is_running().await {
                if let Some(record) = exec.last_result().await {
                    return record;
                }
            }
            assert!(
                std::time::Instant::now() < deadline,
                "execution never finished"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn test_completed_execution_captures_output() {
        let exec = shell_executor();
        let id = exec
            .spawn_script("echo out-marker; echo err-marker >&2\n", None, "lease")
            .await
            .unwrap();
        assert_eq!(id.len(), 8);

        let record = wait_finished(&exec).await;
        assert_eq!(record.state, ExecutionState::Completed);
        assert_eq!(record.exit_code, Some(0));
        assert!(record.stdout.contains("out-marker"));
        assert!(record.stderr.contains("err-marker"));
        assert!(record.error.is_none());
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_failed() {
        let exec = shell_executor();
        exec.spawn_script("exit 3\n", None, "lease").await.unwrap();
        let record = wait_finished(&exec).await;
        assert_eq!(record.state, ExecutionState::Failed);
        assert_eq!(record.exit_code, Some(3));
        assert!(record.error.is_some());
    }

    #[tokio::test]
    async fn test_busy_while_running() {
        let exec = shell_executor();
        exec.spawn_script("sleep 5\n", None, "lease").await.unwrap();
        assert!(exec.is_running().await);
        assert!(matches!(
            exec.spawn_script("exit 0\n", None, "lease").await,
            Err(GatewayError::Busy)
        ));

        assert!(exec.stop().await);
        let record = wait_finished(&exec).await;
        assert_eq!(record.state, ExecutionState::Stopped);
    }

    #[tokio::test]
    async fn test_timeout_kills_child() {
        let exec = shell_executor();
        exec.spawn_script("sleep 30\n", Some(Duration::from_millis(200)), "lease")
            .await
            .unwrap();
        let record = wait_finished(&exec).await;
        assert_eq!(record.state, ExecutionState::Timeout);
        assert!(record.error.as_deref().unwrap_or("").contains("timed out"));
    }

    #[tokio::test]
    async fn test_stop_without_child_is_noop() {
        let exec = shell_executor();
        assert!(!exec.stop().await);
    }
}
