use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default terminal width used when a caller does not supply one.
pub const DEFAULT_COLS: u16 = 80;

/// Default terminal height used when a caller does not supply one.
pub const DEFAULT_ROWS: u16 = 24;

// ---------------------------------------------------------------------------
// Workspace instances
// ---------------------------------------------------------------------------

/// Lifecycle state of a workspace instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    Creating,
    Running,
    /// Liveness failed; a single restart attempt is in flight.
    Degraded,
    Stopping,
    Terminated,
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Creating => write!(f, "creating"),
            Self::Running => write!(f, "running"),
            Self::Degraded => write!(f, "degraded"),
            Self::Stopping => write!(f, "stopping"),
            Self::Terminated => write!(f, "terminated"),
        }
    }
}

/// Per-instance resource ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceCeiling {
    pub memory_bytes: u64,
    pub cpu_shares: u64,
}

/// A container port published on the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBinding {
    pub container_port: u16,
    /// Host port; `None` lets the runtime pick an ephemeral one.
    #[serde(default)]
    pub host_port: Option<u16>,
}

/// Caller-facing view of a live workspace instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceInfo {
    pub project_id: String,
    pub owner_user_id: String,
    pub state: InstanceState,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub ceiling: ResourceCeiling,
    #[serde(default)]
    pub port_bindings: Vec<PortBinding>,
    /// Host path of the synchronized working directory.
    pub working_dir: String,
}

// ---------------------------------------------------------------------------
// Terminal sessions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Closed,
}

/// Events emitted on a terminal session's output stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    Output {
        session_id: String,
        /// Raw terminal bytes, base64-encoded on the wire.
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    Error {
        session_id: String,
        message: String,
    },
    Ended {
        session_id: String,
    },
}

impl SessionEvent {
    pub fn session_id(&self) -> &str {
        match self {
            Self::Output { session_id, .. }
            | Self::Error { session_id, .. }
            | Self::Ended { session_id } => session_id,
        }
    }
}

// ---------------------------------------------------------------------------
// File changes
// ---------------------------------------------------------------------------

/// Kind of a path-level change recorded in the change ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Create,
    Update,
    Delete,
}

impl std::fmt::Display for ChangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Update => write!(f, "update"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Closed set of error kinds reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Provisioning,
    ResourceExceeded,
    EnvironmentSetup,
    SessionNotFound,
    Liveness,
    Sync,
    Watcher,
    Timeout,
    InvalidRequest,
}

/// Structured error returned on the interactive path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub kind: ErrorKind,
    pub message: String,
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
