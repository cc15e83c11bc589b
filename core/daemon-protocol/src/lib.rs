//! IPC protocol types and validation for meetlog-daemon.
//!
//! This crate is shared by the daemon and its clients to prevent schema drift.
//! The daemon remains the authority on validation, but clients can reuse the
//! same types to construct valid requests.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_REQUEST_BYTES: usize = 1024 * 1024; // 1MB

const MAX_ID_LEN: usize = 128;
const MAX_NAME_LEN: usize = 512;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum Method {
    GetHealth,
    Signal,
    GetActiveSessions,
    GetActivity,
    GetNotifications,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Request {
    pub protocol_version: u32,
    pub method: Method,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl Response {
    pub fn ok(id: Option<String>, data: Value) -> Self {
        Self {
            ok: true,
            id,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(id: Option<String>, code: &str, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(ErrorInfo::new(code, message)),
        }
    }

    pub fn error_with_info(id: Option<String>, error: ErrorInfo) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Host,
    Participant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Host => "host",
            Role::Participant => "participant",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "host" => Some(Role::Host),
            "participant" => Some(Role::Participant),
            _ => None,
        }
    }

    pub fn is_host(&self) -> bool {
        matches!(self, Role::Host)
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SignalType {
    SessionStart,
    NameChanged,
    Heartbeat,
    ExplicitEnd,
    ExplicitLeave,
    TransportDisconnect,
}

/// Flat wire form of a lifecycle signal. Which fields are required depends on
/// `signal_type`; [`SignalEnvelope::into_signal`] enforces that.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SignalEnvelope {
    pub signal_id: String,
    pub signal_type: SignalType,
    #[serde(default)]
    pub session_key: Option<String>,
    #[serde(default)]
    pub recorded_at: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub meeting_id: Option<String>,
    #[serde(default)]
    pub role: Option<Role>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub final_name: Option<String>,
    #[serde(default)]
    pub duration_hint_minutes: Option<u32>,
}

/// A validated lifecycle signal, ready for ingest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleSignal {
    SessionStart {
        session_key: String,
        user_id: String,
        meeting_id: String,
        role: Role,
        name: Option<String>,
        at: DateTime<Utc>,
    },
    NameChanged {
        session_key: String,
        name: String,
        at: DateTime<Utc>,
    },
    Heartbeat {
        session_key: String,
        name: Option<String>,
        at: DateTime<Utc>,
    },
    ExplicitEnd {
        session_key: String,
        final_name: Option<String>,
        at: Option<DateTime<Utc>>,
    },
    ExplicitLeave {
        session_key: String,
        final_name: Option<String>,
        duration_hint_minutes: Option<u32>,
        at: Option<DateTime<Utc>>,
    },
    TransportDisconnect {
        session_key: String,
        at: Option<DateTime<Utc>>,
    },
}

impl LifecycleSignal {
    pub fn session_key(&self) -> &str {
        match self {
            LifecycleSignal::SessionStart { session_key, .. }
            | LifecycleSignal::NameChanged { session_key, .. }
            | LifecycleSignal::Heartbeat { session_key, .. }
            | LifecycleSignal::ExplicitEnd { session_key, .. }
            | LifecycleSignal::ExplicitLeave { session_key, .. }
            | LifecycleSignal::TransportDisconnect { session_key, .. } => session_key,
        }
    }

    pub fn signal_type(&self) -> SignalType {
        match self {
            LifecycleSignal::SessionStart { .. } => SignalType::SessionStart,
            LifecycleSignal::NameChanged { .. } => SignalType::NameChanged,
            LifecycleSignal::Heartbeat { .. } => SignalType::Heartbeat,
            LifecycleSignal::ExplicitEnd { .. } => SignalType::ExplicitEnd,
            LifecycleSignal::ExplicitLeave { .. } => SignalType::ExplicitLeave,
            LifecycleSignal::TransportDisconnect { .. } => SignalType::TransportDisconnect,
        }
    }
}

impl SignalEnvelope {
    pub fn into_signal(self) -> Result<LifecycleSignal, ErrorInfo> {
        if self.signal_id.trim().is_empty() {
            return Err(ErrorInfo::new("invalid_signal_id", "signal_id is required"));
        }
        if self.signal_id.len() > MAX_ID_LEN {
            return Err(ErrorInfo::new(
                "invalid_signal_id",
                "signal_id must be 128 characters or fewer",
            ));
        }

        let session_key = require_id(self.session_key, "session_key")?;
        let recorded_at = parse_optional_timestamp(self.recorded_at.as_deref())?;
        let name = optional_name(self.name, "name")?;
        let final_name = optional_name(self.final_name, "final_name")?;

        let signal = match self.signal_type {
            SignalType::SessionStart => LifecycleSignal::SessionStart {
                session_key,
                user_id: require_id(self.user_id, "user_id")?,
                meeting_id: require_id(self.meeting_id, "meeting_id")?,
                role: self
                    .role
                    .ok_or_else(|| ErrorInfo::new("missing_field", "role is required"))?,
                name,
                at: require_timestamp(recorded_at)?,
            },
            SignalType::NameChanged => LifecycleSignal::NameChanged {
                session_key,
                name: name.ok_or_else(|| ErrorInfo::new("missing_field", "name is required"))?,
                at: require_timestamp(recorded_at)?,
            },
            SignalType::Heartbeat => LifecycleSignal::Heartbeat {
                session_key,
                name,
                at: require_timestamp(recorded_at)?,
            },
            SignalType::ExplicitEnd => LifecycleSignal::ExplicitEnd {
                session_key,
                final_name,
                at: recorded_at,
            },
            SignalType::ExplicitLeave => LifecycleSignal::ExplicitLeave {
                session_key,
                final_name,
                duration_hint_minutes: self.duration_hint_minutes,
                at: recorded_at,
            },
            SignalType::TransportDisconnect => LifecycleSignal::TransportDisconnect {
                session_key,
                at: recorded_at,
            },
        };

        Ok(signal)
    }
}

pub fn parse_signal(params: Value) -> Result<LifecycleSignal, ErrorInfo> {
    let envelope: SignalEnvelope = serde_json::from_value(params).map_err(|err| {
        ErrorInfo::new(
            "invalid_params",
            format!("signal payload is invalid JSON: {}", err),
        )
    })?;
    envelope.into_signal()
}

fn require_id(value: Option<String>, field: &str) -> Result<String, ErrorInfo> {
    let candidate = match value {
        Some(candidate) if !candidate.trim().is_empty() => candidate,
        _ => {
            return Err(ErrorInfo::new(
                "missing_field",
                format!("{} is required", field),
            ))
        }
    };
    if candidate.len() > MAX_ID_LEN {
        return Err(ErrorInfo::new(
            "invalid_field",
            format!("{} must be 128 characters or fewer", field),
        ));
    }
    Ok(candidate)
}

/// Blank names are treated as absent; they never overwrite a display name.
fn optional_name(value: Option<String>, field: &str) -> Result<Option<String>, ErrorInfo> {
    match value {
        Some(name) if name.len() > MAX_NAME_LEN => Err(ErrorInfo::new(
            "invalid_field",
            format!("{} must be 512 bytes or fewer", field),
        )),
        Some(name) if !name.trim().is_empty() => Ok(Some(name.trim().to_string())),
        _ => Ok(None),
    }
}

fn parse_optional_timestamp(value: Option<&str>) -> Result<Option<DateTime<Utc>>, ErrorInfo> {
    match value {
        Some(raw) => DateTime::parse_from_rfc3339(raw)
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(|_| ErrorInfo::new("invalid_timestamp", "recorded_at must be RFC3339")),
        None => Ok(None),
    }
}

fn require_timestamp(value: Option<DateTime<Utc>>) -> Result<DateTime<Utc>, ErrorInfo> {
    value.ok_or_else(|| ErrorInfo::new("missing_field", "recorded_at is required"))
}
