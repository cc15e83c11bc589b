use chrono::{Duration as ChronoDuration, Utc};
use meetlog_protocol::{Method, Request, Response, PROTOCOL_VERSION};
use serde_json::{json, Value};
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};
use tempfile::TempDir;

struct DaemonGuard {
    child: Child,
}

impl Drop for DaemonGuard {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn spawn_daemon(home: &Path) -> Child {
    Command::new(env!("CARGO_BIN_EXE_meetlog-daemon"))
        .env("HOME", home)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("Failed to spawn meetlog-daemon")
}

fn socket_path(home: &Path) -> PathBuf {
    home.join(".meetlog").join("daemon.sock")
}

fn wait_for_socket(path: &Path, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if path.exists() {
            return;
        }
        sleep(Duration::from_millis(25));
    }
    panic!("Timed out waiting for daemon socket at {}", path.display());
}

fn send_request(socket: &Path, request: Request) -> Response {
    let mut stream = UnixStream::connect(socket).expect("Failed to connect to daemon socket");
    serde_json::to_writer(&mut stream, &request).expect("Failed to serialize request");
    stream.write_all(b"\n").expect("Failed to write request");
    stream.flush().ok();
    read_response(&mut stream)
}

fn read_response(stream: &mut UnixStream) -> Response {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        let n = stream.read(&mut chunk).expect("Failed to read response");
        if n == 0 {
            break;
        }
        buffer.extend_from_slice(&chunk[..n]);
        if chunk[..n].contains(&b'\n') {
            break;
        }
    }

    let newline_index = buffer.iter().position(|b| *b == b'\n');
    let response_bytes = match newline_index {
        Some(index) => &buffer[..index],
        None => buffer.as_slice(),
    };

    serde_json::from_slice(response_bytes).expect("Failed to parse response JSON")
}

fn call(socket: &Path, method: Method, id: &str, params: Option<Value>) -> Response {
    send_request(
        socket,
        Request {
            protocol_version: PROTOCOL_VERSION,
            method,
            id: Some(id.to_string()),
            params,
        },
    )
}

fn signal(socket: &Path, payload: Value) -> Response {
    let id = payload
        .get("signal_id")
        .and_then(|value| value.as_str())
        .unwrap_or("signal")
        .to_string();
    call(socket, Method::Signal, &id, Some(payload))
}

fn outcome_status(response: &Response) -> Option<String> {
    response
        .data
        .as_ref()
        .and_then(|data| data.get("outcome"))
        .and_then(|outcome| outcome.get("status"))
        .and_then(|status| status.as_str())
        .map(str::to_string)
}

#[test]
fn daemon_ipc_host_session_lifecycle_smoke() {
    let home = TempDir::new().expect("Failed to create temp HOME");
    let socket = socket_path(home.path());
    let child = spawn_daemon(home.path());
    let _guard = DaemonGuard { child };

    wait_for_socket(&socket, Duration::from_secs(2));

    let health = call(&socket, Method::GetHealth, "health-check", None);
    assert!(health.ok, "health response was not ok");
    let status = health
        .data
        .as_ref()
        .and_then(|data| data.get("status"))
        .and_then(|value| value.as_str())
        .unwrap_or("missing");
    assert_eq!(status, "ok");

    let now = Utc::now();
    let started = signal(
        &socket,
        json!({
            "signal_id": "sig-start",
            "signal_type": "session_start",
            "session_key": "conn-smoke-1",
            "user_id": "user-1",
            "meeting_id": "meeting-1",
            "role": "host",
            "name": "Meeting",
            "recorded_at": (now - ChronoDuration::seconds(150)).to_rfc3339(),
        }),
    );
    assert!(started.ok, "session_start response was not ok");
    assert_eq!(outcome_status(&started).as_deref(), Some("registered"));

    let renamed = signal(
        &socket,
        json!({
            "signal_id": "sig-rename",
            "signal_type": "name_changed",
            "session_key": "conn-smoke-1",
            "name": "Standup",
            "recorded_at": (now - ChronoDuration::seconds(140)).to_rfc3339(),
        }),
    );
    assert!(renamed.ok, "name_changed response was not ok");

    let active = call(&socket, Method::GetActiveSessions, "active-check", None);
    let active_value = active.data.expect("active sessions payload");
    let active_array = active_value.as_array().expect("active payload is array");
    assert_eq!(active_array.len(), 1);
    assert_eq!(
        active_array[0].get("display_name").and_then(|v| v.as_str()),
        Some("Standup")
    );

    let ended = signal(
        &socket,
        json!({
            "signal_id": "sig-end",
            "signal_type": "explicit_end",
            "session_key": "conn-smoke-1",
            "recorded_at": now.to_rfc3339(),
        }),
    );
    assert!(ended.ok, "explicit_end response was not ok");
    assert_eq!(outcome_status(&ended).as_deref(), Some("finalized"));

    let active_after = call(&socket, Method::GetActiveSessions, "active-after", None);
    let active_after_value = active_after.data.expect("active sessions payload");
    assert!(active_after_value
        .as_array()
        .expect("active payload is array")
        .is_empty());

    let activity = call(
        &socket,
        Method::GetActivity,
        "activity-check",
        Some(json!({ "user_id": "user-1", "limit": 5 })),
    );
    assert!(activity.ok, "activity response was not ok");
    let activity_value = activity.data.expect("activity payload");
    let records = activity_value.as_array().expect("activity payload is array");
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.get("state").and_then(|v| v.as_str()), Some("completed"));
    assert_eq!(record.get("duration_minutes").and_then(|v| v.as_i64()), Some(3));
    assert_eq!(
        record.get("final_display_name").and_then(|v| v.as_str()),
        Some("Standup")
    );
    assert_eq!(record.get("is_host").and_then(|v| v.as_bool()), Some(true));
    assert_eq!(
        record.get("trigger").and_then(|v| v.as_str()),
        Some("explicit_end")
    );

    let late_leave = signal(
        &socket,
        json!({
            "signal_id": "sig-late",
            "signal_type": "explicit_leave",
            "session_key": "conn-smoke-1",
            "duration_hint_minutes": 9,
        }),
    );
    assert!(late_leave.ok, "late leave response was not ok");
    assert_eq!(outcome_status(&late_leave).as_deref(), Some("ignored"));

    let notifications = call(
        &socket,
        Method::GetNotifications,
        "notifications-check",
        Some(json!({ "user_id": "user-1" })),
    );
    let notifications_value = notifications.data.expect("notifications payload");
    let queued = notifications_value
        .as_array()
        .expect("notifications payload is array");
    assert_eq!(queued.len(), 1);
    assert_eq!(
        queued[0].get("final_display_name").and_then(|v| v.as_str()),
        Some("Standup")
    );
    assert_eq!(queued[0].get("role").and_then(|v| v.as_str()), Some("host"));

    let drained = call(
        &socket,
        Method::GetNotifications,
        "notifications-after",
        Some(json!({ "user_id": "user-1" })),
    );
    let drained_value = drained.data.expect("notifications payload");
    assert!(drained_value
        .as_array()
        .expect("notifications payload is array")
        .is_empty());
}

#[test]
fn daemon_rejects_malformed_signal() {
    let home = TempDir::new().expect("Failed to create temp HOME");
    let socket = socket_path(home.path());
    let child = spawn_daemon(home.path());
    let _guard = DaemonGuard { child };

    wait_for_socket(&socket, Duration::from_secs(2));

    let missing_role = signal(
        &socket,
        json!({
            "signal_id": "sig-bad-1",
            "signal_type": "session_start",
            "session_key": "conn-bad",
            "user_id": "user-1",
            "meeting_id": "meeting-1",
            "recorded_at": Utc::now().to_rfc3339(),
        }),
    );
    assert!(!missing_role.ok);
    assert_eq!(
        missing_role.error.as_ref().map(|err| err.code.as_str()),
        Some("missing_field")
    );

    let unknown_type = signal(
        &socket,
        json!({
            "signal_id": "sig-bad-2",
            "signal_type": "teleport",
            "session_key": "conn-bad",
        }),
    );
    assert!(!unknown_type.ok);
    assert_eq!(
        unknown_type.error.as_ref().map(|err| err.code.as_str()),
        Some("invalid_params")
    );

    let active = call(&socket, Method::GetActiveSessions, "active-check", None);
    assert!(active
        .data
        .expect("active sessions payload")
        .as_array()
        .expect("active payload is array")
        .is_empty());
}
