use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{Arc, Mutex},
};

use launchpad_session::{HandleId, ProcessHandle, SessionSnapshot, SessionState};

use crate::{
    error::{DemoError, DemoResult},
    port_alloc::PortAllocator,
};

pub(crate) fn now_unix_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Why a supervised process went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitKind {
    /// The exit followed an explicit stop.
    Requested,
    /// The process died on its own; carries the diagnostic.
    Crashed(String),
}

#[derive(Debug, Clone)]
struct Session {
    state: SessionState,
    port: Option<u16>,
    handle: Option<ProcessHandle>,
    env_path: Option<PathBuf>,
    started_at_unix_ms: Option<u64>,
    updated_at_unix_ms: u64,
    last_error: Option<String>,
}

impl Session {
    fn new(state: SessionState, env_path: PathBuf) -> Self {
        Self {
            state,
            port: None,
            handle: None,
            env_path: Some(env_path),
            started_at_unix_ms: None,
            updated_at_unix_ms: now_unix_ms(),
            last_error: None,
        }
    }

    fn touch(&mut self) {
        self.updated_at_unix_ms = now_unix_ms();
    }
}

/// The only component that declares a session `running`.
///
/// Ports leave a session only through this registry, which hands them back to
/// the allocator in the same critical section, so each port is released once.
pub struct SessionRegistry {
    base_url: String,
    ports: Arc<PortAllocator>,
    sessions: Mutex<HashMap<String, Session>>,
}

impl SessionRegistry {
    pub fn new(base_url: impl Into<String>, ports: Arc<PortAllocator>) -> Self {
        Self {
            base_url: base_url.into(),
            ports,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Session>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn snapshot(&self, project_id: &str, s: &Session) -> SessionSnapshot {
        let demo_url = match (s.state, s.port) {
            (SessionState::Running, Some(port)) => Some(format!("{}:{}", self.base_url, port)),
            _ => None,
        };
        SessionSnapshot {
            project_id: project_id.to_string(),
            state: s.state,
            port: s.port,
            handle: s.handle.clone(),
            env_path: s.env_path.as_ref().map(|p| p.display().to_string()),
            started_at_unix_ms: s.started_at_unix_ms,
            updated_at_unix_ms: s.updated_at_unix_ms,
            last_error: s.last_error.clone(),
            demo_url,
        }
    }

    /// Drops the session's port and handle, returning the port to the pool.
    fn clear_runtime(&self, s: &mut Session) -> Option<u16> {
        s.handle = None;
        let port = s.port.take();
        if let Some(p) = port {
            self.ports.release(p);
        }
        port
    }

    pub fn get(&self, project_id: &str) -> Option<SessionSnapshot> {
        let sessions = self.lock();
        sessions.get(project_id).map(|s| self.snapshot(project_id, s))
    }

    pub fn get_or_create(
        &self,
        project_id: &str,
        initial: SessionState,
        env_path: PathBuf,
    ) -> SessionSnapshot {
        let mut sessions = self.lock();
        let s = sessions
            .entry(project_id.to_string())
            .or_insert_with(|| Session::new(initial, env_path));
        self.snapshot(project_id, s)
    }

    pub fn list(&self) -> Vec<SessionSnapshot> {
        let sessions = self.lock();
        let mut out: Vec<SessionSnapshot> = sessions
            .iter()
            .map(|(id, s)| self.snapshot(id, s))
            .collect();
        out.sort_by(|a, b| a.project_id.cmp(&b.project_id));
        out
    }

    /// Project currently holding `port`, if any.
    pub fn holder_of(&self, port: u16) -> Option<String> {
        let sessions = self.lock();
        sessions
            .iter()
            .find(|(_, s)| s.port == Some(port))
            .map(|(id, _)| id.clone())
    }

    /// Compare-and-swap on state.
    pub fn transition(
        &self,
        project_id: &str,
        expected: SessionState,
        next: SessionState,
    ) -> DemoResult<SessionSnapshot> {
        self.transition_from(project_id, &[expected], next)
    }

    /// Like [`Self::transition`], accepting any of `expected`.
    pub fn transition_from(
        &self,
        project_id: &str,
        expected: &[SessionState],
        next: SessionState,
    ) -> DemoResult<SessionSnapshot> {
        let mut sessions = self.lock();
        let s = sessions
            .get_mut(project_id)
            .ok_or_else(|| DemoError::NotFound(project_id.to_string()))?;

        if !expected.contains(&s.state) || !s.state.can_transition_to(next) {
            return Err(DemoError::Conflict {
                project_id: project_id.to_string(),
                expected: expected
                    .iter()
                    .map(|e| e.as_str())
                    .collect::<Vec<_>>()
                    .join("|"),
                actual: s.state,
            });
        }

        if next == SessionState::Running && (s.handle.is_none() || s.port.is_none()) {
            return Err(DemoError::Internal(anyhow::anyhow!(
                "refusing to mark {project_id} running without a process handle and port"
            )));
        }

        s.state = next;
        if !next.is_active() {
            self.clear_runtime(s);
        }
        match next {
            SessionState::Running | SessionState::Ready => s.last_error = None,
            SessionState::NotPrepared => {
                s.last_error = None;
                s.started_at_unix_ms = None;
            }
            _ => {}
        }
        s.touch();
        Ok(self.snapshot(project_id, s))
    }

    /// CAS into `error`, recording the diagnostic.
    pub fn fail(
        &self,
        project_id: &str,
        expected: &[SessionState],
        message: impl Into<String>,
    ) -> DemoResult<SessionSnapshot> {
        let message = message.into();
        let snap = self.transition_from(project_id, expected, SessionState::Error)?;
        Ok(self.set_error(project_id, message).unwrap_or(snap))
    }

    /// Records a failure without changing state (e.g. a launch refused for capacity).
    pub fn set_error(&self, project_id: &str, message: impl Into<String>) -> Option<SessionSnapshot> {
        let mut sessions = self.lock();
        let s = sessions.get_mut(project_id)?;
        s.last_error = Some(message.into());
        s.touch();
        Some(self.snapshot(project_id, s))
    }

    /// Gives a `launching` session its port. False if it is not launching or already has one.
    pub fn assign_port(&self, project_id: &str, port: u16) -> bool {
        let mut sessions = self.lock();
        let Some(s) = sessions.get_mut(project_id) else {
            return false;
        };
        if s.state != SessionState::Launching || s.port.is_some() {
            return false;
        }
        s.port = Some(port);
        s.touch();
        true
    }

    /// Attaches the spawned process to a `launching` session.
    pub fn attach_handle(&self, project_id: &str, handle: ProcessHandle) -> bool {
        let mut sessions = self.lock();
        let Some(s) = sessions.get_mut(project_id) else {
            return false;
        };
        if s.state != SessionState::Launching {
            return false;
        }
        s.handle = Some(handle);
        s.started_at_unix_ms = Some(now_unix_ms());
        s.touch();
        true
    }

    /// Detaches the handle of a failed start attempt, leaving the port in place.
    pub fn detach_handle(&self, project_id: &str, handle_id: &HandleId) {
        let mut sessions = self.lock();
        if let Some(s) = sessions.get_mut(project_id)
            && s.handle.as_ref().is_some_and(|h| &h.id == handle_id)
        {
            s.handle = None;
            s.started_at_unix_ms = None;
            s.touch();
        }
    }

    /// Removes the session's port and releases it. Only the caller that gets
    /// `Some` performed the release.
    pub fn take_port(&self, project_id: &str) -> Option<u16> {
        let mut sessions = self.lock();
        let s = sessions.get_mut(project_id)?;
        let port = s.port.take();
        if let Some(p) = port {
            self.ports.release(p);
            s.touch();
        }
        port
    }

    /// Exit bookkeeping for a supervised process: settles the state, drops the
    /// handle and releases the port in one step. Ignores exits of handles the
    /// session no longer references.
    pub fn record_exit(
        &self,
        project_id: &str,
        handle_id: &HandleId,
        kind: ExitKind,
    ) -> Option<(SessionSnapshot, Option<u16>)> {
        let mut sessions = self.lock();
        let s = sessions.get_mut(project_id)?;
        if !s.handle.as_ref().is_some_and(|h| &h.id == handle_id) {
            return None;
        }

        let requested = kind == ExitKind::Requested || s.state == SessionState::Stopping;
        if requested {
            s.state = SessionState::Stopped;
        } else {
            s.state = SessionState::Error;
            if let ExitKind::Crashed(msg) = kind {
                s.last_error = Some(msg);
            }
        }
        let port = self.clear_runtime(s);
        s.touch();
        Some((self.snapshot(project_id, s), port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(min: u16, max: u16) -> (Arc<PortAllocator>, SessionRegistry) {
        let ports = Arc::new(PortAllocator::new(min, max));
        let reg = SessionRegistry::new("http://localhost", ports.clone());
        (ports, reg)
    }

    fn launch_to_running(reg: &SessionRegistry, ports: &PortAllocator, id: &str) -> HandleId {
        reg.get_or_create(id, SessionState::Ready, PathBuf::from("/envs").join(id));
        reg.transition(id, SessionState::Ready, SessionState::Launching)
            .unwrap();
        let port = ports.acquire().unwrap();
        assert!(reg.assign_port(id, port));
        let handle = ProcessHandle {
            id: HandleId::new(),
            pid: Some(4242),
        };
        assert!(reg.attach_handle(id, handle.clone()));
        reg.transition(id, SessionState::Launching, SessionState::Running)
            .unwrap();
        handle.id
    }

    #[test]
    fn cas_rejects_unexpected_state() {
        let (_ports, reg) = registry(8501, 8502);
        reg.get_or_create("p1", SessionState::NotPrepared, PathBuf::from("/envs/p1"));

        let err = reg
            .transition("p1", SessionState::Ready, SessionState::Launching)
            .unwrap_err();
        assert!(matches!(
            err,
            DemoError::Conflict {
                actual: SessionState::NotPrepared,
                ..
            }
        ));
        assert!(reg
            .transition("p1", SessionState::NotPrepared, SessionState::Preparing)
            .is_ok());
        assert!(matches!(
            reg.transition("nope", SessionState::Ready, SessionState::Launching),
            Err(DemoError::NotFound(_))
        ));
    }

    #[test]
    fn running_requires_handle_and_port() {
        let (ports, reg) = registry(8501, 8502);
        reg.get_or_create("p1", SessionState::Ready, PathBuf::from("/envs/p1"));
        reg.transition("p1", SessionState::Ready, SessionState::Launching)
            .unwrap();
        assert!(reg
            .transition("p1", SessionState::Launching, SessionState::Running)
            .is_err());

        let port = ports.acquire().unwrap();
        assert!(reg.assign_port("p1", port));
        assert!(!reg.assign_port("p1", 8502));
        assert!(reg
            .transition("p1", SessionState::Launching, SessionState::Running)
            .is_err());
        assert_eq!(reg.get("p1").unwrap().state, SessionState::Launching);
    }

    #[test]
    fn running_snapshot_carries_demo_url() {
        let (ports, reg) = registry(8501, 8502);
        launch_to_running(&reg, &ports, "p1");
        let snap = reg.get("p1").unwrap();
        assert_eq!(snap.state, SessionState::Running);
        assert_eq!(snap.port, Some(8501));
        assert_eq!(snap.demo_url.as_deref(), Some("http://localhost:8501"));
        assert!(snap.started_at_unix_ms.is_some());
        assert_eq!(reg.holder_of(8501).as_deref(), Some("p1"));
    }

    #[test]
    fn leaving_active_states_releases_port_once() {
        let (ports, reg) = registry(8501, 8502);
        launch_to_running(&reg, &ports, "p1");
        reg.transition("p1", SessionState::Running, SessionState::Stopping)
            .unwrap();
        assert!(ports.is_used(8501));

        assert_eq!(reg.take_port("p1"), Some(8501));
        assert_eq!(reg.take_port("p1"), None);
        assert!(!ports.is_used(8501));

        let snap = reg
            .transition("p1", SessionState::Stopping, SessionState::Stopped)
            .unwrap();
        assert!(snap.port.is_none());
        assert!(snap.handle.is_none());
        assert!(snap.demo_url.is_none());
    }

    #[test]
    fn crash_exit_parks_session_in_error_and_frees_port() {
        let (ports, reg) = registry(8501, 8502);
        let handle = launch_to_running(&reg, &ports, "p1");

        let (snap, port) = reg
            .record_exit("p1", &handle, ExitKind::Crashed("segfault".into()))
            .unwrap();
        assert_eq!(snap.state, SessionState::Error);
        assert_eq!(snap.last_error.as_deref(), Some("segfault"));
        assert_eq!(port, Some(8501));
        assert_eq!(ports.available(), 2);

        // A second report for the same handle is stale.
        assert!(reg
            .record_exit("p1", &handle, ExitKind::Crashed("again".into()))
            .is_none());
    }

    #[test]
    fn exit_during_stop_lands_in_stopped() {
        let (ports, reg) = registry(8501, 8502);
        let handle = launch_to_running(&reg, &ports, "p1");
        reg.transition("p1", SessionState::Running, SessionState::Stopping)
            .unwrap();

        let (snap, _) = reg
            .record_exit("p1", &handle, ExitKind::Crashed("signal: 15".into()))
            .unwrap();
        assert_eq!(snap.state, SessionState::Stopped);
        assert!(snap.last_error.is_none());
        assert!(ports.list_used().is_empty());
    }

    #[test]
    fn stale_handle_exit_is_ignored() {
        let (ports, reg) = registry(8501, 8502);
        launch_to_running(&reg, &ports, "p1");
        assert!(reg
            .record_exit("p1", &HandleId::new(), ExitKind::Requested)
            .is_none());
        assert_eq!(reg.get("p1").unwrap().state, SessionState::Running);
    }

    #[test]
    fn fail_records_error_and_set_error_keeps_state() {
        let (ports, reg) = registry(8501, 8501);
        reg.get_or_create("p1", SessionState::Ready, PathBuf::from("/envs/p1"));
        let snap = reg.set_error("p1", "no free port").unwrap();
        assert_eq!(snap.state, SessionState::Ready);
        assert_eq!(snap.last_error.as_deref(), Some("no free port"));

        reg.transition("p1", SessionState::Ready, SessionState::Launching)
            .unwrap();
        let port = ports.acquire().unwrap();
        reg.assign_port("p1", port);
        let snap = reg
            .fail("p1", &[SessionState::Launching], "readiness timeout")
            .unwrap();
        assert_eq!(snap.state, SessionState::Error);
        assert_eq!(snap.last_error.as_deref(), Some("readiness timeout"));
        assert!(snap.port.is_none());
        assert_eq!(ports.available(), 1);
    }
}
