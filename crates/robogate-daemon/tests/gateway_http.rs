//! End-to-end tests over the HTTP surface, against a dry-run gateway bound
//! to an ephemeral port.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use robogate_core::config::GatewayConfig;
use robogate_daemon::routes::build_router;
use robogate_daemon::Gateway;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

fn test_config() -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.server.dry_run = true;
    // Fast rewinds for test runs.
    config.rewind.chunk_duration = Duration::from_millis(100);
    config.rewind.settle_time = Duration::ZERO;
    config.services.pid_file = std::env::temp_dir().join(format!(
        "robogate-http-test-pids-{}.json",
        uuid::Uuid::new_v4()
    ));
    config
}

async fn spawn_gateway(mut config: GatewayConfig) -> (SocketAddr, Arc<Gateway>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    // Script shims call back into this server; point the executor at the
    // bound port before wiring the gateway.
    config.server.port = addr.port();

    let gateway = Gateway::dry_run(config).unwrap();
    gateway.connect_backends().await;
    gateway.start_background().await;
    let router = build_router(Arc::clone(&gateway));
    let cancel = gateway.cancel.clone();
    tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await
            .unwrap();
    });
    (addr, gateway)
}

/// Minimal HTTP/1.1 client: one request per connection.
async fn request(
    addr: SocketAddr,
    method: &str,
    path: &str,
    lease: Option<&str>,
    body: Option<&Value>,
) -> (u16, Value) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let payload = body.map(Value::to_string).unwrap_or_default();

    let mut req = format!("{method} {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n");
    if let Some(token) = lease {
        req.push_str(&format!("X-Lease-Id: {token}\r\n"));
    }
    if body.is_some() {
        req.push_str("Content-Type: application/json\r\n");
    }
    req.push_str(&format!("Content-Length: {}\r\n\r\n{payload}", payload.len()));

    stream.write_all(req.as_bytes()).await.unwrap();
    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.unwrap();
    let text = String::from_utf8_lossy(&raw);

    let status: u16 = text
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    let (head, body_text) = text.split_once("\r\n\r\n").unwrap_or(("", ""));
    let body_text = if head.to_ascii_lowercase().contains("transfer-encoding: chunked") {
        dechunk(body_text)
    } else {
        body_text.to_string()
    };
    let value = serde_json::from_str(&body_text).unwrap_or(Value::Null);
    (status, value)
}

fn dechunk(body: &str) -> String {
    let mut out = String::new();
    let mut rest = body;
    while let Some((size_line, tail)) = rest.split_once("\r\n") {
        let Ok(size) = usize::from_str_radix(size_line.trim(), 16) else { break };
        if size == 0 {
            break;
        }
        out.push_str(&tail[..size.min(tail.len())]);
        rest = tail.get(size + 2..).unwrap_or("");
    }
    out
}

async fn acquire(addr: SocketAddr, holder: &str) -> String {
    let (status, body) = request(
        addr,
        "POST",
        "/lease/acquire",
        None,
        Some(&json!({"holder": holder})),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "granted", "acquire response: {body}");
    body["lease_id"].as_str().unwrap().to_string()
}

fn joint_values(first: f64) -> Value {
    json!([first, -0.785, 0.0, -2.356, 0.0, 1.571, 0.785])
}

#[tokio::test]
async fn test_acquire_extend_release_cycle() {
    let (addr, _gateway) = spawn_gateway(test_config()).await;

    let lease_id = acquire(addr, "a").await;

    let (status, body) = request(
        addr,
        "POST",
        "/lease/extend",
        None,
        Some(&json!({"lease_id": lease_id})),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "extended");

    let (status, body) = request(
        addr,
        "POST",
        "/lease/release",
        None,
        Some(&json!({"lease_id": lease_id})),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "released");

    // The released token is dead.
    let (status, body) = request(
        addr,
        "POST",
        "/lease/extend",
        None,
        Some(&json!({"lease_id": lease_id})),
    )
    .await;
    assert_eq!(status, 403);
    assert_eq!(body["error"], "not_holder");
}

#[tokio::test]
async fn test_queue_promotion() {
    let (addr, _gateway) = spawn_gateway(test_config()).await;

    let lease_a = acquire(addr, "a").await;

    let (status, body) = request(
        addr,
        "POST",
        "/lease/acquire",
        None,
        Some(&json!({"holder": "b"})),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "queued");
    assert_eq!(body["position"], 1);

    request(
        addr,
        "POST",
        "/lease/release",
        None,
        Some(&json!({"lease_id": lease_a})),
    )
    .await;

    let (_, status_body) = request(addr, "GET", "/lease/status", None, None).await;
    assert_eq!(status_body["holder"], "b");
    assert_eq!(status_body["queue_length"], 0);

    // b recovers its token by re-acquiring.
    let lease_b = acquire(addr, "b").await;
    let (status, _) = request(
        addr,
        "POST",
        "/lease/extend",
        None,
        Some(&json!({"lease_id": lease_b})),
    )
    .await;
    assert_eq!(status, 200);
}

#[tokio::test]
async fn test_idle_revocation_frees_the_lease() {
    let mut config = test_config();
    config.lease.idle_timeout = Duration::from_millis(200);
    config.lease.warning_grace = Duration::from_millis(100);
    let (addr, _gateway) = spawn_gateway(config).await;

    acquire(addr, "a").await;

    // No activity past idle timeout + grace: the revoker fires and a new
    // holder acquires immediately.
    tokio::time::sleep(Duration::from_millis(700)).await;

    let (status, body) = request(
        addr,
        "POST",
        "/lease/acquire",
        None,
        Some(&json!({"holder": "b"})),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "granted", "lease not revoked: {body}");
}

#[tokio::test]
async fn test_lease_status_never_contains_token() {
    let (addr, _gateway) = spawn_gateway(test_config()).await;
    let lease_id = acquire(addr, "alice").await;

    let (status, body) = request(addr, "GET", "/lease/status", None, None).await;
    assert_eq!(status, 200);
    assert!(!body.to_string().contains(&lease_id));
    assert_eq!(body["holder"], "alice");
}

#[tokio::test]
async fn test_commands_require_lease() {
    let (addr, _gateway) = spawn_gateway(test_config()).await;

    let (status, body) = request(
        addr,
        "POST",
        "/cmd/arm/move",
        None,
        Some(&json!({"mode": "joint_position", "values": joint_values(0.0)})),
    )
    .await;
    assert_eq!(status, 403);
    assert_eq!(body["error"], "not_holder");

    let (status, _) = request(
        addr,
        "POST",
        "/cmd/base/move",
        Some("not-a-real-token"),
        Some(&json!({"x": 0.0, "y": 0.0, "theta": 0.0})),
    )
    .await;
    assert_eq!(status, 403);
}

#[tokio::test]
async fn test_safety_reject_makes_no_call_and_records_nothing() {
    let (addr, gateway) = spawn_gateway(test_config()).await;
    let lease_id = acquire(addr, "a").await;

    // Identity pose translated to z = 5.0, far above z_max.
    let mut pose = vec![0.0; 16];
    pose[0] = 1.0;
    pose[5] = 1.0;
    pose[10] = 1.0;
    pose[15] = 1.0;
    pose[14] = 5.0;

    let (status, body) = request(
        addr,
        "POST",
        "/cmd/arm/move",
        Some(&lease_id),
        Some(&json!({"mode": "cartesian_pose", "values": pose})),
    )
    .await;
    assert_eq!(status, 400);
    assert_eq!(body["error"], "safety_violation");
    assert_eq!(body["reason"], "safety:z_out_of_bounds");

    // No adapter call: the simulated arm still reports the default pose.
    let arm_state = gateway.arm.get_state().await.unwrap();
    assert!((arm_state.ee_pose[14]).abs() < 1e-9);

    // No waypoint recorded.
    let (_, trajectory) = request(addr, "GET", "/trajectory", None, None).await;
    assert_eq!(trajectory["count"], 0);
}

#[tokio::test]
async fn test_dry_run_rewind_visits_targets_in_reverse() {
    let (addr, _gateway) = spawn_gateway(test_config()).await;
    let lease_id = acquire(addr, "a").await;

    // Record q_0..q_3 in order.
    for i in 0..4 {
        let (status, body) = request(
            addr,
            "POST",
            "/cmd/arm/move",
            Some(&lease_id),
            Some(&json!({"mode": "joint_position", "values": joint_values(0.1 * f64::from(i))})),
        )
        .await;
        assert_eq!(status, 200, "move {i} failed: {body}");
    }

    let (status, result) = request(
        addr,
        "POST",
        "/rewind/steps",
        None,
        Some(&json!({"steps": 3, "dry_run": true})),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(result["success"], true);
    assert_eq!(result["steps_rewound"], 3);

    // The visited targets are exactly q_3, q_2, q_1.
    let visited: Vec<f64> = result["targets"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["payload"][0].as_f64().unwrap())
        .collect();
    assert_eq!(visited.len(), 3);
    assert!((visited[0] - 0.3).abs() < 1e-9);
    assert!((visited[1] - 0.2).abs() < 1e-9);
    assert!((visited[2] - 0.1).abs() < 1e-9);

    // Dry run leaves the trajectory untouched.
    let (_, trajectory) = request(addr, "GET", "/trajectory", None, None).await;
    assert_eq!(trajectory["count"], 4);
}

#[tokio::test]
async fn test_service_dependency_cascade() {
    let (addr, _gateway) = spawn_gateway(test_config()).await;

    // controller depends on base_server and franka_server.
    let (status, body) = request(addr, "POST", "/services/controller/start", None, None).await;
    assert_eq!(status, 409, "start without deps should conflict: {body}");
    assert_eq!(body["error"], "dependency_not_running");

    for key in ["base_server", "franka_server", "controller"] {
        let (status, body) =
            request(addr, "POST", &format!("/services/{key}/start"), None, None).await;
        assert_eq!(status, 200, "start {key}: {body}");
    }

    let (_, body) = request(addr, "POST", "/services/base_server/stop", None, None).await;
    assert_eq!(body["ok"], true);

    let (_, controller) = request(addr, "GET", "/services/controller", None, None).await;
    assert_eq!(controller["state"], "stopped");

    // franka_server does not depend on base_server and keeps running.
    let (_, franka) = request(addr, "GET", "/services/franka_server", None, None).await;
    assert_eq!(franka["state"], "running");
}

#[tokio::test]
async fn test_backend_independence_in_health_and_state() {
    let (addr, gateway) = spawn_gateway(test_config()).await;

    gateway.aggregator.poll_once().await;
    gateway.base.close().await;
    gateway.aggregator.publish_now();

    let (status, health) = request(addr, "GET", "/health", None, None).await;
    assert_eq!(status, 200);
    assert_eq!(health["backends"]["base"], false);
    assert_eq!(health["backends"]["arm"], true);

    let (status, state) = request(addr, "GET", "/state", None, None).await;
    assert_eq!(status, 200);
    assert_eq!(state["base"]["stale"], true);
    assert_eq!(state["arm"]["stale"], false);
}

#[tokio::test]
async fn test_code_endpoints_gate_on_lease() {
    let (addr, _gateway) = spawn_gateway(test_config()).await;

    let (status, body) = request(
        addr,
        "POST",
        "/code/execute",
        None,
        Some(&json!({"code": "print('hi')"})),
    )
    .await;
    assert_eq!(status, 403);
    assert_eq!(body["error"], "not_holder");

    let (status, body) = request(addr, "GET", "/code/status", None, None).await;
    assert_eq!(status, 200);
    assert_eq!(body["is_running"], false);

    let (status, body) = request(addr, "GET", "/code/result", None, None).await;
    assert_eq!(status, 200);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn test_script_commands_record_script_sourced_waypoints() {
    // The executor shim runs under the configured interpreter; skip when no
    // Python is installed.
    if tokio::process::Command::new("python3")
        .arg("--version")
        .output()
        .await
        .is_err()
    {
        eprintln!("python3 not available, skipping");
        return;
    }

    let (addr, _gateway) = spawn_gateway(test_config()).await;
    let lease_id = acquire(addr, "scripter").await;

    let code = "arm.move_joints([0.1, -0.785, 0.0, -2.356, 0.0, 1.571, 0.785])\n";
    let (status, body) = request(
        addr,
        "POST",
        "/code/execute",
        Some(&lease_id),
        Some(&json!({"code": code})),
    )
    .await;
    assert_eq!(status, 200, "execute failed: {body}");
    assert_eq!(body["success"], true);

    let deadline = std::time::Instant::now() + Duration::from_secs(30);
    loop {
        let (_, status_body) = request(addr, "GET", "/code/status", None, None).await;
        if status_body["is_running"].as_bool() == Some(false) {
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "execution never finished"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let (_, result) = request(addr, "GET", "/code/result", None, None).await;
    assert_eq!(
        result["result"]["state"], "completed",
        "script did not complete: {result}"
    );

    // The scripted move went through the same command gate and recorded a
    // waypoint attributed to the script.
    let (_, trajectory) = request(addr, "GET", "/trajectory", None, None).await;
    assert_eq!(trajectory["count"], 1);
    assert_eq!(trajectory["waypoints"][0]["kind"], "arm_joint");
    assert_eq!(trajectory["waypoints"][0]["source"], "script");
}

#[tokio::test]
async fn test_rewind_config_roundtrip() {
    let (addr, _gateway) = spawn_gateway(test_config()).await;

    let (status, config) = request(addr, "GET", "/rewind/config", None, None).await;
    assert_eq!(status, 200);
    assert_eq!(config["chunk_size"], 5);

    let (status, updated) = request(
        addr,
        "PUT",
        "/rewind/config",
        None,
        Some(&json!({"chunk_size": 200, "settle_time": 0.25, "auto_rewind_enabled": true})),
    )
    .await;
    assert_eq!(status, 200);
    // Out-of-range sizes are clamped.
    assert_eq!(updated["chunk_size"], 50);
    assert!((updated["settle_time"].as_f64().unwrap() - 0.25).abs() < 1e-9);
    assert_eq!(updated["auto_rewind_enabled"], true);
}

#[tokio::test]
async fn test_gripper_command_records_width_waypoint() {
    let (addr, _gateway) = spawn_gateway(test_config()).await;
    let lease_id = acquire(addr, "a").await;

    let (status, body) = request(
        addr,
        "POST",
        "/cmd/gripper",
        Some(&lease_id),
        Some(&json!({"action": "move", "width": 0.03})),
    )
    .await;
    assert_eq!(status, 200, "gripper move failed: {body}");

    let (_, trajectory) = request(addr, "GET", "/trajectory", None, None).await;
    assert_eq!(trajectory["count"], 1);
    assert_eq!(trajectory["waypoints"][0]["kind"], "gripper_width");
}
