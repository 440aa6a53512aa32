use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use launchpad_session::{HandleId, ProcessHandle, SessionSnapshot};
use serde::{Deserialize, Serialize};
use tokio::{
    io::AsyncWriteExt,
    process::Command,
    sync::{Mutex, watch},
};

use crate::{
    error::{DemoError, DemoResult},
    logs::{LogSink, ProjectLogs},
    port_alloc::{BindProbe, probe_bind},
    registry::{ExitKind, SessionRegistry, now_unix_ms},
    sandbox::{self, SandboxLimits},
    templates::ResolvedCommand,
};

const RUN_FILE: &str = "run.json";
const DIAGNOSTIC_LINES: usize = 20;
const PIPE_DRAIN: Duration = Duration::from_millis(500);

/// Persisted next to the sandbox so a restarted agent can find processes it spawned.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunInfo {
    pub project_id: String,
    pub handle_id: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pgid: Option<i32>,
    pub started_at_unix_ms: u64,
    pub agent_version: String,
    pub exec: String,
    pub args: Vec<String>,
    pub cwd: String,
}

async fn write_run_json(dir: &Path, info: &RunInfo) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(dir)
        .await
        .context("create env dir")?;
    let path = dir.join(RUN_FILE);
    let tmp = dir.join("run.json.tmp");
    let data = serde_json::to_vec_pretty(info).context("serialize run.json")?;
    let mut f = tokio::fs::File::create(&tmp)
        .await
        .context("create run.json.tmp")?;
    f.write_all(&data).await.context("write run.json.tmp")?;
    f.flush().await.ok();
    tokio::fs::rename(&tmp, &path)
        .await
        .context("persist run.json")?;
    Ok(())
}

pub async fn read_run_json(dir: &Path) -> Option<RunInfo> {
    let raw = tokio::fs::read(dir.join(RUN_FILE)).await.ok()?;
    serde_json::from_slice(&raw).ok()
}

/// Removes `run.json` if it still describes `handle_id`.
pub async fn remove_run_json(dir: &Path, handle_id: &str) {
    if let Some(info) = read_run_json(dir).await
        && info.handle_id == handle_id
    {
        let _ = tokio::fs::remove_file(dir.join(RUN_FILE)).await;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitReport {
    pub code: Option<i32>,
    /// `exit status: 1`, `signal: 9 (SIGKILL)`, ...
    pub description: String,
    /// Tail of the application's own output.
    pub diagnostic: Option<String>,
    pub runtime_ms: u64,
}

impl ExitReport {
    pub fn crash_message(&self) -> String {
        match &self.diagnostic {
            Some(d) => format!("application exited ({}):\n{d}", self.description),
            None => format!("application exited ({})", self.description),
        }
    }

    fn reports_port_in_use(&self) -> bool {
        let Some(d) = &self.diagnostic else {
            return false;
        };
        let lower = d.to_ascii_lowercase();
        lower.contains("address already in use")
            || lower
                .lines()
                .any(|l| l.contains("port") && l.contains("is already in use"))
    }
}

#[derive(Debug, Clone)]
pub struct ExitNotice {
    pub project_id: String,
    pub handle_id: HandleId,
    pub report: ExitReport,
    /// Present when the supervisor settled the session itself.
    pub session: Option<SessionSnapshot>,
}

pub type ExitCallback = Box<dyn FnOnce(&ExitNotice) + Send>;

/// What to run and where.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub project_id: String,
    pub command: ResolvedCommand,
    pub port: u16,
    pub env_path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// The launch path owns the port and the session until readiness.
    Starting,
    /// Readiness confirmed; the watcher owns exit cleanup.
    Supervised,
    Exited,
}

struct RunEntry {
    project_id: String,
    port: u16,
    pid: Option<u32>,
    pgid: Option<i32>,
    phase: Phase,
    stop_requested: bool,
    exit_rx: watch::Receiver<Option<ExitReport>>,
    sink: LogSink,
    callbacks: Vec<ExitCallback>,
    notice: Option<ExitNotice>,
}

/// Sole owner of demo application processes.
#[derive(Clone)]
pub struct ProcessSupervisor {
    registry: Arc<SessionRegistry>,
    logs: ProjectLogs,
    sandbox: SandboxLimits,
    stop_grace: Duration,
    runs: Arc<Mutex<HashMap<HandleId, RunEntry>>>,
}

impl ProcessSupervisor {
    pub fn new(
        registry: Arc<SessionRegistry>,
        logs: ProjectLogs,
        sandbox: SandboxLimits,
        stop_grace: Duration,
    ) -> Self {
        Self {
            registry,
            logs,
            sandbox,
            stop_grace,
            runs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Spawns the application bound to `spec.port`. The returned handle stays in
    /// the starting phase until [`Self::await_ready`] promotes it.
    pub async fn start(&self, spec: LaunchSpec) -> DemoResult<ProcessHandle> {
        match probe_bind(spec.port) {
            BindProbe::Free => {}
            BindProbe::InUse => return Err(DemoError::BindFailed { port: spec.port }),
            BindProbe::Unavailable(e) => {
                return Err(DemoError::Internal(anyhow::anyhow!(
                    "cannot bind port {}: {e}",
                    spec.port
                )));
            }
        }

        {
            let mut runs = self.runs.lock().await;
            runs.retain(|_, e| !(e.project_id == spec.project_id && e.phase == Phase::Exited));
        }

        let handle_id = HandleId::new();
        let sink = self.logs.sink(&spec.project_id);
        let cursor = sink.buffer().lock().await.cursor();
        let cmd = &spec.command;

        sink.emit(format!(
            "[launchpad] exec: {} (cwd {}, port {})",
            cmd.display(),
            cmd.cwd.display(),
            spec.port
        ))
        .await;

        let mut c = Command::new(&cmd.program);
        c.args(&cmd.args)
            .current_dir(&cmd.cwd)
            .envs(&cmd.env)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());
        sandbox::confine(&mut c, &self.sandbox);

        let mut child = match c.spawn() {
            Ok(child) => child,
            Err(e) => {
                let msg = format!("failed to start {}: {e}", cmd.program);
                sink.emit(format!("[launchpad] {msg}")).await;
                return Err(DemoError::ProcessCrashed(msg));
            }
        };
        let started = tokio::time::Instant::now();
        let pid = child.id();
        let pgid = pid.map(|p| p as i32);

        let run = RunInfo {
            project_id: spec.project_id.clone(),
            handle_id: handle_id.0.clone(),
            port: spec.port,
            pid,
            pgid,
            started_at_unix_ms: now_unix_ms(),
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
            exec: cmd.program.clone(),
            args: cmd.args.clone(),
            cwd: cmd.cwd.display().to_string(),
        };
        if let Err(e) = write_run_json(&spec.env_path, &run).await {
            tracing::warn!(project_id = %spec.project_id, error = %e, "failed to write run.json");
        }

        let out = child.stdout.take().map(|r| sink.pipe("stdout", r));
        let err = child.stderr.take().map(|r| sink.pipe("stderr", r));

        let (exit_tx, exit_rx) = watch::channel(None);
        {
            let mut runs = self.runs.lock().await;
            runs.insert(
                handle_id.clone(),
                RunEntry {
                    project_id: spec.project_id.clone(),
                    port: spec.port,
                    pid,
                    pgid,
                    phase: Phase::Starting,
                    stop_requested: false,
                    exit_rx,
                    sink: sink.clone(),
                    callbacks: Vec::new(),
                    notice: None,
                },
            );
        }

        tracing::info!(
            project_id = %spec.project_id,
            port = spec.port,
            pid = pid.unwrap_or_default(),
            "demo process spawned"
        );

        let this = self.clone();
        let watch_id = handle_id.clone();
        let env_path = spec.env_path.clone();
        tokio::spawn(async move {
            let status = child.wait().await;
            let runtime = tokio::time::Instant::now().duration_since(started);

            // Let the pipes flush the last lines before building the diagnostic.
            let _ = tokio::time::timeout(PIPE_DRAIN, async {
                for h in [out, err].into_iter().flatten() {
                    let _ = h.await;
                }
            })
            .await;

            // Stragglers in the group would keep holding the port.
            if let Some(pgid) = pgid {
                #[cfg(unix)]
                {
                    sandbox::signal_group(pgid, libc::SIGKILL);
                }
                #[cfg(not(unix))]
                {
                    let _ = pgid;
                }
            }

            let (code, description) = match status {
                Ok(s) => (s.code(), s.to_string()),
                Err(e) => (None, format!("wait failed: {e}")),
            };
            let report = ExitReport {
                code,
                description,
                diagnostic: sink
                    .buffer()
                    .lock()
                    .await
                    .diagnostic_after(cursor, DIAGNOSTIC_LINES),
                runtime_ms: runtime.as_millis() as u64,
            };
            sink.emit(format!(
                "[launchpad] process exited: {} runtime_ms={}",
                report.description, report.runtime_ms
            ))
            .await;

            this.finish(&watch_id, exit_tx, report, &env_path).await;
        });

        Ok(ProcessHandle { id: handle_id, pid })
    }

    async fn finish(
        &self,
        handle_id: &HandleId,
        exit_tx: watch::Sender<Option<ExitReport>>,
        report: ExitReport,
        env_path: &Path,
    ) {
        let (project_id, phase, stop_requested) = {
            let mut runs = self.runs.lock().await;
            let Some(e) = runs.get_mut(handle_id) else {
                return;
            };
            let phase = e.phase;
            e.phase = Phase::Exited;
            (e.project_id.clone(), phase, e.stop_requested)
        };
        exit_tx.send_replace(Some(report.clone()));
        remove_run_json(env_path, &handle_id.0).await;

        let mut session = None;
        if phase == Phase::Supervised {
            let kind = if stop_requested {
                ExitKind::Requested
            } else {
                ExitKind::Crashed(report.crash_message())
            };
            if let Some((snap, port)) = self.registry.record_exit(&project_id, handle_id, kind) {
                if snap.state == launchpad_session::SessionState::Error {
                    tracing::warn!(
                        project_id = %project_id,
                        port = port.unwrap_or_default(),
                        exit = %report.description,
                        "demo process crashed"
                    );
                } else {
                    tracing::info!(project_id = %project_id, port = port.unwrap_or_default(), "demo process stopped");
                }
                session = Some(snap);
            }
        }

        let notice = ExitNotice {
            project_id,
            handle_id: handle_id.clone(),
            report,
            session,
        };
        let callbacks = {
            let mut runs = self.runs.lock().await;
            match runs.get_mut(handle_id) {
                Some(e) => {
                    e.notice = Some(notice.clone());
                    std::mem::take(&mut e.callbacks)
                }
                None => Vec::new(),
            }
        };
        for cb in callbacks {
            cb(&notice);
        }
    }

    /// Waits until the port accepts TCP connections, then hands exit cleanup to
    /// the watcher. Exits before that are classified as bind failures or crashes.
    pub async fn await_ready(
        &self,
        handle: &HandleId,
        timeout: Duration,
        interval: Duration,
    ) -> DemoResult<u16> {
        let (port, mut exit_rx, sink) = {
            let runs = self.runs.lock().await;
            let e = runs.get(handle).ok_or_else(|| {
                DemoError::Internal(anyhow::anyhow!("unknown process handle {handle}"))
            })?;
            (e.port, e.exit_rx.clone(), e.sink.clone())
        };

        let started = tokio::time::Instant::now();
        let deadline = started + timeout;
        loop {
            let exited = exit_rx.borrow_and_update().clone();
            if let Some(report) = exited {
                return Err(if report.reports_port_in_use() {
                    DemoError::BindFailed { port }
                } else {
                    DemoError::ProcessCrashed(report.crash_message())
                });
            }

            if let Ok(s) = tokio::net::TcpStream::connect(("127.0.0.1", port)).await {
                drop(s);
                let mut runs = self.runs.lock().await;
                if let Some(e) = runs.get_mut(handle) {
                    match e.phase {
                        Phase::Starting | Phase::Supervised => {
                            e.phase = Phase::Supervised;
                            drop(runs);
                            sink.emit(format!("[launchpad] ready on port {port}")).await;
                            return Ok(port);
                        }
                        // Exited between the probe and the lock; report it next round.
                        Phase::Exited => continue,
                    }
                }
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                sink.emit(format!(
                    "[launchpad] port {port} not ready after {}ms",
                    timeout.as_millis()
                ))
                .await;
                return Err(DemoError::ReadinessTimeout {
                    port,
                    waited_ms: now.duration_since(started).as_millis() as u64,
                });
            }

            tokio::select! {
                _ = tokio::time::sleep(interval.min(deadline - now)) => {}
                _ = exit_rx.changed() => {}
            }
        }
    }

    pub async fn is_alive(&self, handle: &HandleId) -> bool {
        let runs = self.runs.lock().await;
        match runs.get(handle) {
            Some(e) if e.phase != Phase::Exited => e.pid.is_some_and(sandbox::pid_alive),
            _ => false,
        }
    }

    /// Registers `cb` to run once the process exits. Runs it immediately if the
    /// exit already happened; returns false for an unknown handle.
    pub async fn on_exit(&self, handle: &HandleId, cb: ExitCallback) -> bool {
        let notice = {
            let mut runs = self.runs.lock().await;
            let Some(e) = runs.get_mut(handle) else {
                return false;
            };
            match &e.notice {
                Some(n) => n.clone(),
                None => {
                    e.callbacks.push(cb);
                    return true;
                }
            }
        };
        cb(&notice);
        true
    }

    /// Waits up to `timeout` for the process to exit.
    pub async fn wait_exit(&self, handle: &HandleId, timeout: Duration) -> Option<ExitReport> {
        let mut rx = {
            let runs = self.runs.lock().await;
            runs.get(handle)?.exit_rx.clone()
        };
        let waited = tokio::time::timeout(timeout, rx.wait_for(|r| r.is_some())).await;
        match waited {
            Ok(Ok(r)) => r.clone(),
            _ => None,
        }
    }

    /// SIGTERM to the process group, a bounded grace period, then SIGKILL.
    /// Stopping an exited or unknown handle is a no-op.
    pub async fn stop(&self, handle: &HandleId) -> DemoResult<()> {
        let (project_id, pgid, sink) = {
            let mut runs = self.runs.lock().await;
            let Some(e) = runs.get_mut(handle) else {
                return Ok(());
            };
            if e.phase == Phase::Exited {
                return Ok(());
            }
            e.stop_requested = true;
            (e.project_id.clone(), e.pgid, e.sink.clone())
        };

        sink.emit(format!(
            "[launchpad] stop requested (grace_ms={})",
            self.stop_grace.as_millis()
        ))
        .await;

        if let Some(pgid) = pgid {
            #[cfg(unix)]
            {
                sandbox::signal_group(pgid, libc::SIGTERM);
            }
            #[cfg(not(unix))]
            {
                let _ = pgid;
            }
        }
        if self.wait_exit(handle, self.stop_grace).await.is_some() {
            return Ok(());
        }

        if let Some(pgid) = pgid {
            #[cfg(unix)]
            {
                sandbox::signal_group(pgid, libc::SIGKILL);
            }
            #[cfg(not(unix))]
            {
                let _ = pgid;
            }
        }
        sink.emit("[launchpad] stop: sent SIGKILL (grace expired)")
            .await;
        tracing::warn!(project_id = %project_id, "demo process ignored SIGTERM; killed");

        if self.wait_exit(handle, self.stop_grace).await.is_some() {
            Ok(())
        } else {
            Err(DemoError::Internal(anyhow::anyhow!(
                "process for {project_id} did not exit after SIGKILL"
            )))
        }
    }
}
