//! meetlog daemon entrypoint.
//!
//! A small, single-writer service that turns meeting lifecycle signals into
//! activity records: a socket listener with strict request validation, an
//! in-memory session registry, a heartbeat monitor thread, and a SQLite store
//! holding the records and the per-user notification outbox.

use clap::Parser;
use fs_err as fs;
use std::env;
use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use meetlog_protocol::{
    parse_signal, ErrorInfo, Method, Request, Response, MAX_REQUEST_BYTES, PROTOCOL_VERSION,
};
use serde_json::Value;

mod backoff;
mod config;
mod db;
mod directory;
mod error;
mod ingest;
mod monitor;
mod names;
mod notify;
mod reconciler;
mod registry;
mod store;

use backoff::RetryPolicy;
use config::DaemonConfig;
use db::Db;
use directory::ConfigDirectory;
use ingest::EventIngest;
use monitor::HeartbeatMonitor;
use notify::OutboxNotifier;
use reconciler::Reconciler;
use registry::SessionRegistry;
use store::ActivityStore;

const SOCKET_NAME: &str = "daemon.sock";
const LOG_FILE_PREFIX: &str = "meetlog-daemon.log";
const READ_TIMEOUT_SECS: u64 = 2;
const READ_CHUNK_SIZE: usize = 4096;
const DEFAULT_ACTIVITY_LIMIT: usize = 100;
const MAX_ACTIVITY_LIMIT: usize = 1000;

#[derive(Parser)]
#[command(name = "meetlog-daemon")]
#[command(about = "Reconciles meeting session lifecycles into activity records")]
#[command(version)]
struct Cli {
    /// Config file (defaults to ~/.meetlog/daemon/config.toml)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Unix socket to listen on (defaults to ~/.meetlog/daemon.sock)
    #[arg(long, value_name = "PATH")]
    socket: Option<PathBuf>,

    /// SQLite database (defaults to ~/.meetlog/daemon/state.db)
    #[arg(long, value_name = "PATH")]
    db: Option<PathBuf>,

    /// Also write logs to a daily rolling file in this directory
    #[arg(long, value_name = "DIR")]
    log_dir: Option<PathBuf>,
}

/// Everything a connection handler needs.
struct Daemon {
    registry: Arc<SessionRegistry>,
    store: Arc<Db>,
    ingest: EventIngest,
    monitor: Arc<HeartbeatMonitor>,
    config: DaemonConfig,
}

fn main() {
    let cli = Cli::parse();
    let _log_guard = init_logging(cli.log_dir.as_deref());

    let config = match config::load_config(cli.config.clone()) {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "Failed to load daemon config");
            std::process::exit(1);
        }
    };

    let socket_path = match cli.socket.clone().map(Ok).unwrap_or_else(daemon_socket_path) {
        Ok(path) => path,
        Err(err) => {
            error!(error = %err, "Failed to resolve daemon socket path");
            std::process::exit(1);
        }
    };

    if let Err(err) = prepare_socket_dir(&socket_path) {
        error!(error = %err, "Failed to prepare daemon socket directory");
        std::process::exit(1);
    }

    if let Err(err) = remove_existing_socket(&socket_path) {
        error!(error = %err, path = %socket_path.display(), "Failed to remove existing socket");
        std::process::exit(1);
    }

    let listener = match UnixListener::bind(&socket_path) {
        Ok(listener) => listener,
        Err(err) => {
            error!(error = %err, path = %socket_path.display(), "Failed to bind daemon socket");
            std::process::exit(1);
        }
    };

    info!(path = %socket_path.display(), "meetlog daemon started");

    let db_path = match cli.db.clone().map(Ok).unwrap_or_else(daemon_db_path) {
        Ok(path) => path,
        Err(err) => {
            error!(error = %err, "Failed to resolve daemon database path");
            std::process::exit(1);
        }
    };

    let db = match Db::new(db_path) {
        Ok(db) => Arc::new(db),
        Err(err) => {
            error!(error = %err, "Failed to initialize daemon database");
            std::process::exit(1);
        }
    };

    let daemon = Arc::new(build_daemon(db, config));
    info!(
        sweep_interval_secs = daemon.config.monitor.sweep_interval_secs,
        stale_threshold_secs = daemon.config.monitor.stale_threshold_secs,
        hard_threshold_secs = daemon.config.monitor.hard_threshold_secs,
        directory_users = daemon.config.users.len(),
        "Daemon config loaded"
    );
    Arc::clone(&daemon.monitor).spawn();

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let daemon = Arc::clone(&daemon);
                thread::spawn(|| handle_connection(stream, daemon));
            }
            Err(err) => {
                warn!(error = %err, "Failed to accept daemon connection");
            }
        }
    }
}

fn build_daemon(db: Arc<Db>, config: DaemonConfig) -> Daemon {
    let registry = Arc::new(SessionRegistry::new());
    let store: Arc<dyn ActivityStore> = db.clone();
    let reconciler = Arc::new(Reconciler::new(
        Arc::clone(&registry),
        Arc::clone(&store),
        Arc::new(OutboxNotifier::new(Arc::clone(&db))),
        RetryPolicy::from_config(&config.reconciler),
        config.reconciler.tombstone_ttl(),
    ));
    let monitor = Arc::new(HeartbeatMonitor::new(
        Arc::clone(&registry),
        Arc::clone(&store),
        Arc::clone(&reconciler),
        config.monitor.clone(),
    ));
    let ingest = EventIngest::new(
        Arc::clone(&registry),
        store,
        reconciler,
        Arc::new(ConfigDirectory::from_entries(&config.users)),
    );

    Daemon {
        registry,
        store: db,
        ingest,
        monitor,
        config,
    }
}

fn init_logging(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let debug_enabled = env::var("MEETLOG_DEBUG_LOG")
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    let filter = if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let Some(log_dir) = log_dir else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
        return None;
    };

    let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false),
        )
        .init();
    Some(guard)
}

fn daemon_socket_path() -> Result<PathBuf, String> {
    let home = dirs::home_dir().ok_or_else(|| "Home directory not found".to_string())?;
    Ok(home.join(".meetlog").join(SOCKET_NAME))
}

fn daemon_db_path() -> Result<PathBuf, String> {
    let home = dirs::home_dir().ok_or_else(|| "Home directory not found".to_string())?;
    Ok(home.join(".meetlog").join("daemon").join("state.db"))
}

fn prepare_socket_dir(socket_path: &Path) -> Result<(), String> {
    let parent = socket_path
        .parent()
        .ok_or_else(|| "Socket path has no parent".to_string())?;
    fs::create_dir_all(parent).map_err(|err| format!("Failed to create socket directory: {}", err))
}

fn remove_existing_socket(socket_path: &Path) -> Result<(), String> {
    if socket_path.exists() {
        fs::remove_file(socket_path)
            .map_err(|err| format!("Failed to remove existing socket: {}", err))?;
    }
    Ok(())
}

fn handle_connection(mut stream: UnixStream, daemon: Arc<Daemon>) {
    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            warn!(code = %err.code, message = %err.message, "Failed to read request");
            let response = Response::error_with_info(None, err);
            let _ = write_response(&mut stream, response);
            return;
        }
    };

    tracing::debug!(method = ?request.method, id = ?request.id, "Daemon request received");
    let response = handle_request(request, &daemon);
    let _ = write_response(&mut stream, response);
}

fn read_request(stream: &mut UnixStream) -> Result<Request, ErrorInfo> {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(READ_TIMEOUT_SECS)));

    let mut buffer = Vec::new();
    let mut chunk = [0u8; READ_CHUNK_SIZE];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > MAX_REQUEST_BYTES {
                    return Err(ErrorInfo::new(
                        "request_too_large",
                        "request exceeded maximum size",
                    ));
                }
                if chunk[..n].contains(&b'\n') {
                    break;
                }
            }
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                return Err(ErrorInfo::new("read_timeout", "request timed out"));
            }
            Err(err) => {
                return Err(ErrorInfo::new(
                    "read_error",
                    format!("failed to read request: {}", err),
                ));
            }
        }
    }

    let request_bytes = match buffer.iter().position(|b| *b == b'\n') {
        Some(index) => &buffer[..index],
        None => buffer.as_slice(),
    };

    if request_bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(ErrorInfo::new("empty_request", "request body was empty"));
    }

    serde_json::from_slice(request_bytes).map_err(|err| {
        ErrorInfo::new(
            "invalid_json",
            format!("request was not valid JSON: {}", err),
        )
    })
}

fn handle_request(request: Request, daemon: &Daemon) -> Response {
    if request.protocol_version != PROTOCOL_VERSION {
        return Response::error(
            request.id,
            "protocol_mismatch",
            "unsupported protocol version",
        );
    }

    match request.method {
        Method::GetHealth => {
            let mut data = serde_json::json!({
                "status": "ok",
                "pid": std::process::id(),
                "version": env!("CARGO_PKG_VERSION"),
                "protocol_version": PROTOCOL_VERSION,
                "live_sessions": daemon.registry.len(),
                "sweep_interval_secs": daemon.config.monitor.sweep_interval_secs,
            });
            if let Some(report) = daemon.monitor.last_report() {
                if let Ok(value) = serde_json::to_value(report) {
                    data["last_sweep"] = value;
                }
            }
            Response::ok(request.id, data)
        }
        Method::Signal => handle_signal(request, daemon),
        Method::GetActiveSessions => {
            let sessions: Vec<_> = daemon
                .registry
                .snapshot()
                .iter()
                .map(|session| session.view())
                .collect();
            tracing::debug!(sessions = sessions.len(), "Active sessions snapshot");
            to_response(request.id, &sessions, "active sessions")
        }
        Method::GetActivity => {
            let (user_id, limit) = match parse_activity_params(request.params) {
                Ok(values) => values,
                Err(err) => return Response::error_with_info(request.id, err),
            };
            tracing::debug!(user_id = %user_id, limit, "Activity request");
            match daemon.store.list_for_user(&user_id, limit) {
                Ok(records) => to_response(request.id, &records, "activity"),
                Err(err) => Response::error(
                    request.id,
                    "activity_error",
                    format!("Failed to fetch activity: {}", err),
                ),
            }
        }
        Method::GetNotifications => {
            let user_id = match parse_user_id(request.params.as_ref()) {
                Ok(user_id) => user_id,
                Err(err) => return Response::error_with_info(request.id, err),
            };
            match daemon.store.drain_notifications(&user_id) {
                Ok(notifications) => {
                    tracing::debug!(
                        user_id = %user_id,
                        count = notifications.len(),
                        "Notifications drained"
                    );
                    Response::ok(request.id, Value::Array(notifications))
                }
                Err(err) => Response::error(
                    request.id,
                    "notification_error",
                    format!("Failed to drain notifications: {}", err),
                ),
            }
        }
    }
}

fn handle_signal(request: Request, daemon: &Daemon) -> Response {
    let params = match request.params {
        Some(params) => params,
        None => return Response::error(request.id, "invalid_params", "signal payload is required"),
    };

    let signal = match parse_signal(params) {
        Ok(signal) => signal,
        Err(err) => return Response::error_with_info(request.id, err),
    };

    info!(
        signal_type = ?signal.signal_type(),
        session_key = %signal.session_key(),
        "Received signal"
    );

    match daemon.ingest.handle(signal) {
        Ok(outcome) => match serde_json::to_value(&outcome) {
            Ok(value) => Response::ok(
                request.id,
                serde_json::json!({ "accepted": true, "outcome": value }),
            ),
            Err(err) => Response::error(
                request.id,
                "serialization_error",
                format!("Failed to serialize outcome: {}", err),
            ),
        },
        Err(err) => {
            warn!(error = %err, "Signal ingest failed");
            Response::error(request.id, "ingest_error", err.to_string())
        }
    }
}

fn to_response<T: serde::Serialize>(id: Option<String>, value: &T, what: &str) -> Response {
    match serde_json::to_value(value) {
        Ok(value) => Response::ok(id, value),
        Err(err) => Response::error(
            id,
            "serialization_error",
            format!("Failed to serialize {}: {}", what, err),
        ),
    }
}

fn parse_user_id(params: Option<&Value>) -> Result<String, ErrorInfo> {
    let params = params.ok_or_else(|| ErrorInfo::new("invalid_params", "user_id is required"))?;
    if !params.is_object() {
        return Err(ErrorInfo::new("invalid_params", "params must be an object"));
    }
    match params.get("user_id").and_then(|v| v.as_str()) {
        Some(value) if !value.trim().is_empty() => Ok(value.trim().to_string()),
        _ => Err(ErrorInfo::new("missing_field", "user_id is required")),
    }
}

fn parse_activity_params(params: Option<Value>) -> Result<(String, usize), ErrorInfo> {
    let user_id = parse_user_id(params.as_ref())?;
    let limit = params
        .as_ref()
        .and_then(|params| params.get("limit"))
        .and_then(|v| v.as_u64())
        .map(|value| (value as usize).min(MAX_ACTIVITY_LIMIT))
        .unwrap_or(DEFAULT_ACTIVITY_LIMIT);
    Ok((user_id, limit))
}

fn write_response(stream: &mut UnixStream, response: Response) -> std::io::Result<()> {
    serde_json::to_writer(&mut *stream, &response)?;
    stream.write_all(b"\n")?;
    stream.flush()?;
    Ok(())
}
