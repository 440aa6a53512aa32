use specta::Type;

/// Identifies one supervised run of a project's application.
///
/// A new id is minted for every start, so a watcher from an earlier run can
/// never be mistaken for the current one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize, Type)]
pub struct HandleId(pub String);

impl HandleId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for HandleId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for HandleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reference to a process owned by the supervisor. Sessions hold this, never the child.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
pub struct ProcessHandle {
    pub id: HandleId,
    pub pid: Option<u32>,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize, Type,
)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    NotPrepared,
    Preparing,
    Ready,
    Launching,
    Running,
    Stopping,
    Stopped,
    Error,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::NotPrepared => "not_prepared",
            SessionState::Preparing => "preparing",
            SessionState::Ready => "ready",
            SessionState::Launching => "launching",
            SessionState::Running => "running",
            SessionState::Stopping => "stopping",
            SessionState::Stopped => "stopped",
            SessionState::Error => "error",
        }
    }

    /// States in which a session may hold a port and a process handle.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            SessionState::Launching | SessionState::Running | SessionState::Stopping
        )
    }

    /// States from which a new prepare/launch attempt may begin.
    pub fn is_idle(self) -> bool {
        matches!(
            self,
            SessionState::NotPrepared
                | SessionState::Ready
                | SessionState::Stopped
                | SessionState::Error
        )
    }

    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        match self {
            NotPrepared => matches!(next, Preparing),
            Preparing => matches!(next, Ready | Error),
            Ready => matches!(next, Launching | NotPrepared),
            Launching => matches!(next, Running | Stopping | Error),
            Running => matches!(next, Stopping | Error),
            Stopping => matches!(next, Stopped | Error),
            // Neither is terminal for the product: a fresh cycle may start.
            Stopped | Error => matches!(next, Preparing | Launching | NotPrepared),
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize, Type,
)]
#[serde(rename_all = "snake_case")]
pub enum EnvStatus {
    NotPrepared,
    Preparing,
    Ready,
    Error,
}

impl EnvStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            EnvStatus::NotPrepared => "not_prepared",
            EnvStatus::Preparing => "preparing",
            EnvStatus::Ready => "ready",
            EnvStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for EnvStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
pub struct SessionSnapshot {
    pub project_id: String,
    pub state: SessionState,
    pub port: Option<u16>,
    pub handle: Option<ProcessHandle>,
    pub env_path: Option<String>,
    pub started_at_unix_ms: Option<u64>,
    pub updated_at_unix_ms: u64,
    pub last_error: Option<String>,
    pub demo_url: Option<String>,
}

// Wire shapes for the exposed operation set.

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, Type)]
pub struct PrepareResponse {
    pub status: EnvStatus,
    pub message: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, Type)]
pub struct LaunchResponse {
    pub status: SessionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub demo_url: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, Type)]
pub struct StatusResponse {
    pub status: SessionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub demo_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, Type)]
pub struct StopResponse {
    pub status: SessionState,
    pub message: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, Type)]
pub struct StopAllResponse {
    pub sessions_stopped: u32,
    pub ports_freed: u32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<String>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, Type)]
pub struct ListRunningResponse {
    pub sessions: Vec<SessionSnapshot>,
    pub used_ports: Vec<u16>,
    #[serde(default)]
    pub orphan_ports: Vec<u16>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, Type)]
pub struct StopPortResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, Type)]
pub struct LogsResponse {
    pub lines: Vec<String>,
    pub next_cursor: String,
}
