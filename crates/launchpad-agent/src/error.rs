use launchpad_session::SessionState;

/// Failure taxonomy surfaced by the orchestration core.
#[derive(Debug, thiserror::Error)]
pub enum DemoError {
    #[error("environment preparation failed: {0}")]
    PreparationFailed(String),

    #[error("no free port in {min}-{max}")]
    PortExhausted { min: u16, max: u16 },

    #[error("port {port} is already bound by another process")]
    BindFailed { port: u16 },

    #[error("application exited: {0}")]
    ProcessCrashed(String),

    #[error("port {port} did not accept connections within {waited_ms}ms")]
    ReadinessTimeout { port: u16, waited_ms: u64 },

    #[error("environment is still being prepared")]
    NotReady,

    #[error("unknown project: {0}")]
    NotFound(String),

    #[error("invalid project id: {0:?}")]
    InvalidProjectId(String),

    #[error("session for {project_id} is {actual}, expected {expected}")]
    Conflict {
        project_id: String,
        expected: String,
        actual: SessionState,
    },

    #[error("{0}")]
    Forbidden(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl DemoError {
    /// Stable machine-readable code used in API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            DemoError::PreparationFailed(_) => "preparation_failed",
            DemoError::PortExhausted { .. } => "port_exhausted",
            DemoError::BindFailed { .. } => "bind_failed",
            DemoError::ProcessCrashed(_) => "process_crashed",
            DemoError::ReadinessTimeout { .. } => "readiness_timeout",
            DemoError::NotReady => "not_ready",
            DemoError::NotFound(_) => "not_found",
            DemoError::InvalidProjectId(_) => "invalid_param",
            DemoError::Conflict { .. } => "conflict",
            DemoError::Forbidden(_) => "forbidden",
            DemoError::Internal(_) => "internal",
        }
    }

    pub fn hint(&self) -> Option<&'static str> {
        match self {
            DemoError::PreparationFailed(_) => {
                Some("Fix the dependency manifest, then call prepare or launch again.")
            }
            DemoError::PortExhausted { .. } => {
                Some("All demo ports are busy. Try again later or stop an idle demo.")
            }
            DemoError::NotReady => Some("Poll status until the environment is ready."),
            DemoError::ProcessCrashed(_) | DemoError::ReadinessTimeout { .. } => {
                Some("Check the demo logs; launch again once the app starts cleanly.")
            }
            _ => None,
        }
    }

    /// Capacity and caller errors are not recorded against the project.
    pub fn is_project_failure(&self) -> bool {
        !matches!(
            self,
            DemoError::NotFound(_)
                | DemoError::InvalidProjectId(_)
                | DemoError::NotReady
                | DemoError::Conflict { .. }
                | DemoError::Forbidden(_)
        )
    }
}

pub type DemoResult<T> = Result<T, DemoError>;

pub(crate) fn format_error_chain(err: &anyhow::Error) -> String {
    let mut parts = Vec::<String>::new();
    for cause in err.chain() {
        let s = cause.to_string();
        if s.is_empty() {
            continue;
        }
        if parts.last() == Some(&s) {
            continue;
        }
        parts.push(s);
    }
    if parts.is_empty() {
        "unknown error".to_string()
    } else {
        parts.join(": ")
    }
}
