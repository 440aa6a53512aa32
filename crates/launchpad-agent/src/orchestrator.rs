use std::{collections::BTreeSet, sync::Arc};

use launchpad_session::{
    EnvStatus, LaunchResponse, ListRunningResponse, LogsResponse, PrepareResponse,
    ProcessHandle, SessionSnapshot, SessionState, StatusResponse, StopAllResponse,
    StopPortResponse, StopResponse,
};

use crate::{
    catalog::{ProjectBundle, ProjectCatalog, validate_project_id},
    config::AgentConfig,
    environment::EnvironmentPreparer,
    error::{DemoError, DemoResult},
    logs::ProjectLogs,
    port_alloc::{BindProbe, PortAllocator, probe_bind},
    reconcile::{self, OrphanLedger, OrphanPort, ReconcileReport},
    registry::{SessionRegistry, now_unix_ms},
    supervisor::{ExitNotice, LaunchSpec, ProcessSupervisor},
    templates::{Placeholders, RuntimeTemplate, TemplateSet},
};

const MAX_LOG_LIMIT: usize = 1000;

/// Public entry point: every demo lifecycle operation goes through here.
#[derive(Clone)]
pub struct Orchestrator {
    config: Arc<AgentConfig>,
    catalog: Arc<dyn ProjectCatalog>,
    templates: Arc<TemplateSet>,
    ports: Arc<PortAllocator>,
    registry: Arc<SessionRegistry>,
    preparer: EnvironmentPreparer,
    supervisor: ProcessSupervisor,
    logs: ProjectLogs,
    orphans: Arc<OrphanLedger>,
}

impl Orchestrator {
    pub fn new(config: AgentConfig, catalog: Arc<dyn ProjectCatalog>) -> Self {
        Self::with_templates(config, catalog, TemplateSet::default())
    }

    pub fn with_templates(
        config: AgentConfig,
        catalog: Arc<dyn ProjectCatalog>,
        templates: TemplateSet,
    ) -> Self {
        let ports = Arc::new(PortAllocator::new(config.port_min, config.port_max));
        let registry = Arc::new(SessionRegistry::new(config.base_url.clone(), ports.clone()));
        let logs = ProjectLogs::from_config(&config);
        let preparer = EnvironmentPreparer::new(
            config.envs_root(),
            config.install_timeout,
            config.sandbox.clone(),
            logs.clone(),
        );
        let supervisor = ProcessSupervisor::new(
            registry.clone(),
            logs.clone(),
            config.sandbox.clone(),
            config.stop_grace,
        );
        Self {
            config: Arc::new(config),
            catalog,
            templates: Arc::new(templates),
            ports,
            registry,
            preparer,
            supervisor,
            logs,
            orphans: Arc::new(OrphanLedger::default()),
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn ports(&self) -> &PortAllocator {
        &self.ports
    }

    pub fn orphans(&self) -> &OrphanLedger {
        &self.orphans
    }

    fn bundle(&self, project_id: &str) -> DemoResult<ProjectBundle> {
        validate_project_id(project_id)?;
        self.catalog
            .lookup(project_id)?
            .ok_or_else(|| DemoError::NotFound(project_id.to_string()))
    }

    /// Owner-only operations: a project that declares an owner accepts only that caller.
    pub fn authorize(&self, project_id: &str, caller: Option<&str>) -> DemoResult<()> {
        let bundle = self.bundle(project_id)?;
        match (bundle.owner.as_deref(), caller) {
            (None, _) => Ok(()),
            (Some(owner), Some(c)) if owner == c => Ok(()),
            (Some(_), _) => Err(DemoError::Forbidden(format!(
                "only the owner of {project_id} may do this"
            ))),
        }
    }

    fn template_for(&self, bundle: &ProjectBundle) -> DemoResult<RuntimeTemplate> {
        let id = bundle
            .template_id
            .as_deref()
            .unwrap_or(&self.config.template_id);
        self.templates.find(id).cloned().ok_or_else(|| {
            DemoError::Internal(anyhow::anyhow!(
                "unknown runtime template {id:?} (known: {})",
                self.templates.ids().join(", ")
            ))
        })
    }

    fn session(&self, project_id: &str) -> SessionSnapshot {
        let initial = match self.preparer.status(project_id) {
            EnvStatus::Ready => SessionState::Ready,
            _ => SessionState::NotPrepared,
        };
        self.registry
            .get_or_create(project_id, initial, self.preparer.env_path(project_id))
    }

    fn record(&self, snap: &SessionSnapshot) {
        self.catalog.record(&snap.project_id, snap);
    }

    fn current(&self, project_id: &str) -> DemoResult<SessionSnapshot> {
        self.registry
            .get(project_id)
            .ok_or_else(|| DemoError::NotFound(project_id.to_string()))
    }

    /// Read-only view of a project's session.
    pub fn snapshot(&self, project_id: &str) -> DemoResult<SessionSnapshot> {
        self.bundle(project_id)?;
        if let Some(s) = self.registry.get(project_id) {
            return Ok(s);
        }
        let state = match self.preparer.status(project_id) {
            EnvStatus::Ready => SessionState::Ready,
            EnvStatus::Preparing => SessionState::Preparing,
            _ => SessionState::NotPrepared,
        };
        Ok(SessionSnapshot {
            project_id: project_id.to_string(),
            state,
            port: None,
            handle: None,
            env_path: Some(self.preparer.env_path(project_id).display().to_string()),
            started_at_unix_ms: None,
            updated_at_unix_ms: now_unix_ms(),
            last_error: None,
            demo_url: None,
        })
    }

    pub async fn ensure_prepared(&self, project_id: &str) -> DemoResult<PrepareResponse> {
        let bundle = self.bundle(project_id)?;
        self.session(project_id);

        let status = match self.preparer.status(project_id) {
            EnvStatus::Ready => EnvStatus::Ready,
            EnvStatus::Preparing => EnvStatus::Preparing,
            EnvStatus::NotPrepared | EnvStatus::Error => self.start_preparation(&bundle, false)?,
        };
        let message = match status {
            EnvStatus::Ready => "environment ready".to_string(),
            EnvStatus::Preparing => "installing dependencies".to_string(),
            _ => self
                .preparer
                .outcome(project_id)
                .message
                .unwrap_or_else(|| status.to_string()),
        };
        Ok(PrepareResponse { status, message })
    }

    /// Moves the session into `preparing`, kicks off the build and follows it to
    /// completion in the background. With `auto_launch` the demo starts as soon
    /// as the environment is ready.
    fn start_preparation(&self, bundle: &ProjectBundle, auto_launch: bool) -> DemoResult<EnvStatus> {
        let project_id = bundle.project_id.as_str();
        let template = self.template_for(bundle)?;

        let snap = match self.registry.transition_from(
            project_id,
            &[
                SessionState::NotPrepared,
                SessionState::Stopped,
                SessionState::Error,
            ],
            SessionState::Preparing,
        ) {
            Ok(s) => s,
            Err(DemoError::Conflict {
                actual: SessionState::Preparing,
                ..
            }) => return Ok(EnvStatus::Preparing),
            Err(DemoError::Conflict {
                actual: SessionState::Ready,
                ..
            }) => {
                // Session thinks it is ready but the sandbox is gone.
                self.registry.transition(
                    project_id,
                    SessionState::Ready,
                    SessionState::NotPrepared,
                )?;
                self.registry.transition(
                    project_id,
                    SessionState::NotPrepared,
                    SessionState::Preparing,
                )?
            }
            Err(e) => return Err(e),
        };
        self.record(&snap);

        let status = self.preparer.prepare(bundle, &template);
        let mut rx = self.preparer.subscribe(project_id);
        let this = self.clone();
        let bundle = bundle.clone();
        tokio::spawn(async move {
            let outcome = match rx.wait_for(|o| o.status != EnvStatus::Preparing).await {
                Ok(o) => o.clone(),
                Err(_) => return,
            };
            let id = bundle.project_id.as_str();
            match outcome.status {
                EnvStatus::Ready => {
                    match this
                        .registry
                        .transition(id, SessionState::Preparing, SessionState::Ready)
                    {
                        Ok(snap) => this.record(&snap),
                        Err(e) => {
                            tracing::debug!(project_id = %id, error = %e, "session moved on during preparation");
                            return;
                        }
                    }
                    if auto_launch {
                        match this.launch_ready(&bundle).await {
                            Ok(r) => {
                                tracing::info!(project_id = %id, status = %r.status, "deferred launch finished")
                            }
                            Err(e) => {
                                tracing::warn!(project_id = %id, error = %e, "deferred launch failed")
                            }
                        }
                    }
                }
                _ => {
                    let msg = outcome
                        .message
                        .unwrap_or_else(|| "environment preparation failed".to_string());
                    let err = DemoError::PreparationFailed(msg);
                    if let Ok(snap) =
                        this.registry
                            .fail(id, &[SessionState::Preparing], err.to_string())
                    {
                        this.record(&snap);
                    }
                }
            }
        });

        Ok(status)
    }

    pub async fn launch(&self, project_id: &str) -> DemoResult<LaunchResponse> {
        let bundle = self.bundle(project_id)?;
        let snap = self.session(project_id);

        match snap.state {
            SessionState::Launching | SessionState::Running => {
                return Ok(self.launch_response(&snap));
            }
            SessionState::Preparing => return Err(DemoError::NotReady),
            SessionState::Stopping => {
                return Err(DemoError::Conflict {
                    project_id: project_id.to_string(),
                    expected: "ready|stopped|error".to_string(),
                    actual: SessionState::Stopping,
                });
            }
            _ => {}
        }

        if self.ports.available() == 0 {
            let (min, max) = self.ports.range();
            let err = DemoError::PortExhausted { min, max };
            self.registry.set_error(project_id, err.to_string());
            return Err(err);
        }

        match self.preparer.status(project_id) {
            EnvStatus::Ready => self.launch_detached(bundle).await,
            EnvStatus::Preparing => Err(DemoError::NotReady),
            EnvStatus::NotPrepared | EnvStatus::Error => {
                let status = self.start_preparation(&bundle, true)?;
                let snap = self.current(project_id)?;
                Ok(LaunchResponse {
                    status: snap.state,
                    demo_url: None,
                    message: match status {
                        EnvStatus::Preparing => {
                            "installing dependencies; the demo starts when they are ready"
                                .to_string()
                        }
                        other => format!("environment {other}"),
                    },
                })
            }
        }
    }

    fn launch_response(&self, snap: &SessionSnapshot) -> LaunchResponse {
        let message = match snap.state {
            SessionState::Running => "demo running".to_string(),
            SessionState::Launching => "demo is starting".to_string(),
            SessionState::Preparing => "installing dependencies".to_string(),
            SessionState::Error => snap
                .last_error
                .clone()
                .unwrap_or_else(|| "launch failed".to_string()),
            other => format!("demo is {other}"),
        };
        LaunchResponse {
            status: snap.state,
            demo_url: snap.demo_url.clone(),
            message,
        }
    }

    /// Runs [`Self::launch_ready`] on its own task. Dropping the caller (an
    /// HTTP client hanging up mid-probe) must not cancel a launch halfway
    /// through, or the session would stay `launching` holding its port.
    async fn launch_detached(&self, bundle: ProjectBundle) -> DemoResult<LaunchResponse> {
        let this = self.clone();
        tokio::spawn(async move { this.launch_ready(&bundle).await })
            .await
            .map_err(|e| DemoError::Internal(anyhow::anyhow!("launch task failed: {e}")))?
    }

    /// Launch path for a project whose environment is ready.
    async fn launch_ready(&self, bundle: &ProjectBundle) -> DemoResult<LaunchResponse> {
        let project_id = bundle.project_id.as_str();
        let template = self.template_for(bundle)?;

        match self.registry.transition_from(
            project_id,
            &[SessionState::Ready, SessionState::Stopped, SessionState::Error],
            SessionState::Launching,
        ) {
            Ok(snap) => self.record(&snap),
            Err(DemoError::Conflict {
                actual: SessionState::Launching | SessionState::Running,
                ..
            }) => return Ok(self.launch_response(&self.current(project_id)?)),
            Err(e) => return Err(e),
        }

        let mut port = match self.ports.acquire() {
            Ok(p) => p,
            Err(e) => return self.fail_launch(project_id, e),
        };
        if !self.registry.assign_port(project_id, port) {
            self.ports.release(port);
            return Ok(self.launch_response(&self.current(project_id)?));
        }

        let mut retried = false;
        loop {
            match self.start_once(bundle, &template, port).await {
                Ok(handle) => {
                    return match self.registry.transition(
                        project_id,
                        SessionState::Launching,
                        SessionState::Running,
                    ) {
                        Ok(snap) => {
                            tracing::info!(project_id = %project_id, port, pid = handle.pid.unwrap_or_default(), "demo running");
                            self.record(&snap);
                            Ok(self.launch_response(&snap))
                        }
                        Err(DemoError::Conflict { actual, .. }) => {
                            let snap = self.current(project_id)?;
                            match actual {
                                // Crashed right after the probe; the watcher settled it.
                                SessionState::Error => Err(DemoError::ProcessCrashed(
                                    snap.last_error
                                        .unwrap_or_else(|| "application exited".to_string()),
                                )),
                                _ => Ok(self.launch_response(&snap)),
                            }
                        }
                        Err(e) => Err(e),
                    };
                }
                Err(DemoError::BindFailed { port: bad }) if !retried => {
                    retried = true;
                    tracing::warn!(project_id = %project_id, port = bad, "port taken by a foreign process; retrying on a fresh port");
                    // Take the fresh port before giving the bad one back, or acquire would hand it out again.
                    let fresh = match self.ports.acquire() {
                        Ok(p) => p,
                        Err(_) => {
                            // No spare port to retry on: the bind failure is the real cause.
                            self.registry.take_port(project_id);
                            self.fence_if_bound(bad);
                            return self.fail_launch(project_id, DemoError::BindFailed { port: bad });
                        }
                    };
                    self.registry.take_port(project_id);
                    self.fence_if_bound(bad);
                    if !self.registry.assign_port(project_id, fresh) {
                        self.ports.release(fresh);
                        return Ok(self.launch_response(&self.current(project_id)?));
                    }
                    port = fresh;
                }
                Err(e) => {
                    if let DemoError::BindFailed { port: bad } = e {
                        self.registry.take_port(project_id);
                        self.fence_if_bound(bad);
                    }
                    return self.fail_launch(project_id, e);
                }
            }
        }
    }

    /// Parks a launching session in `error`. If a concurrent stop already moved
    /// it on, reports that state instead.
    fn fail_launch(&self, project_id: &str, err: DemoError) -> DemoResult<LaunchResponse> {
        match self
            .registry
            .fail(project_id, &[SessionState::Launching], err.to_string())
        {
            Ok(snap) => {
                tracing::warn!(project_id = %project_id, error = %err, "launch failed");
                self.record(&snap);
                Err(err)
            }
            Err(DemoError::Conflict { .. }) => Ok(self.launch_response(&self.current(project_id)?)),
            Err(_) => Err(err),
        }
    }

    /// Keeps a port bound by someone else out of circulation until the sweeper sees it free.
    fn fence_if_bound(&self, port: u16) {
        if self.registry.holder_of(port).is_some() {
            return;
        }
        if probe_bind(port) == BindProbe::InUse && self.ports.claim(port) {
            self.orphans.insert(OrphanPort {
                port,
                pid: None,
                project_id: None,
            });
            tracing::info!(port, "fenced port bound by a foreign process");
        }
    }

    async fn start_once(
        &self,
        bundle: &ProjectBundle,
        template: &RuntimeTemplate,
        port: u16,
    ) -> DemoResult<ProcessHandle> {
        let project_id = bundle.project_id.as_str();
        let env_path = self.preparer.env_path(project_id);
        let vars = Placeholders {
            env: &env_path,
            files: &bundle.bundle_dir,
            entrypoint: &bundle.entrypoint,
            requirements: bundle.requirements.as_deref(),
            port: Some(port),
        };
        let command = template.launch.resolve(&vars).ok_or_else(|| {
            DemoError::Internal(anyhow::anyhow!(
                "launch command of template {} is not applicable to {project_id}",
                template.template_id
            ))
        })?;

        let handle = self
            .supervisor
            .start(LaunchSpec {
                project_id: project_id.to_string(),
                command,
                port,
                env_path,
            })
            .await?;

        if !self.registry.attach_handle(project_id, handle.clone()) {
            let _ = self.supervisor.stop(&handle.id).await;
            return Err(DemoError::Conflict {
                project_id: project_id.to_string(),
                expected: SessionState::Launching.to_string(),
                actual: self.current(project_id)?.state,
            });
        }

        let catalog = self.catalog.clone();
        self.supervisor
            .on_exit(
                &handle.id,
                Box::new(move |n: &ExitNotice| {
                    if let Some(s) = &n.session {
                        catalog.record(&s.project_id, s);
                    }
                }),
            )
            .await;

        match self
            .supervisor
            .await_ready(
                &handle.id,
                self.config.probe_timeout,
                self.config.probe_interval,
            )
            .await
        {
            Ok(_) => Ok(handle),
            Err(e) => {
                let _ = self.supervisor.stop(&handle.id).await;
                self.registry.detach_handle(project_id, &handle.id);
                Err(e)
            }
        }
    }

    pub fn status(&self, project_id: &str) -> DemoResult<StatusResponse> {
        let snap = self.snapshot(project_id)?;
        let message = match snap.state {
            SessionState::Running => snap.port.map(|p| format!("running on port {p}")),
            SessionState::Preparing => self
                .preparer
                .outcome(project_id)
                .message
                .or_else(|| Some("installing dependencies".to_string())),
            _ => snap.last_error.clone(),
        };
        Ok(StatusResponse {
            status: snap.state,
            demo_url: snap.demo_url.clone(),
            started_at: snap
                .started_at_unix_ms
                .filter(|_| snap.state.is_active())
                .and_then(|ms| chrono::DateTime::from_timestamp_millis(ms as i64))
                .map(|d| d.to_rfc3339()),
            port: snap.port,
            message,
        })
    }

    pub async fn stop(&self, project_id: &str) -> DemoResult<StopResponse> {
        validate_project_id(project_id)?;
        let snap = match self.registry.get(project_id) {
            Some(s) => s,
            None => {
                let snap = self.snapshot(project_id)?;
                return Ok(StopResponse {
                    status: snap.state,
                    message: "demo is not running".to_string(),
                });
            }
        };

        match snap.state {
            SessionState::Running | SessionState::Launching => {}
            SessionState::Stopping => {
                return Ok(StopResponse {
                    status: SessionState::Stopping,
                    message: "stop already in progress".to_string(),
                });
            }
            other => {
                return Ok(StopResponse {
                    status: other,
                    message: "demo is not running".to_string(),
                });
            }
        }

        let snap = match self.registry.transition_from(
            project_id,
            &[SessionState::Running, SessionState::Launching],
            SessionState::Stopping,
        ) {
            Ok(s) => s,
            Err(DemoError::Conflict { actual, .. }) => {
                return Ok(StopResponse {
                    status: actual,
                    message: "demo is not running".to_string(),
                });
            }
            Err(e) => return Err(e),
        };
        self.record(&snap);
        tracing::info!(project_id = %project_id, port = snap.port.unwrap_or_default(), "stopping demo");

        if let Some(h) = &snap.handle
            && let Err(e) = self.supervisor.stop(&h.id).await
        {
            if let Ok(s) = self
                .registry
                .fail(project_id, &[SessionState::Stopping], e.to_string())
            {
                self.record(&s);
            }
            return Err(e);
        }

        self.registry.take_port(project_id);
        let fin = match self.registry.transition(
            project_id,
            SessionState::Stopping,
            SessionState::Stopped,
        ) {
            Ok(s) => {
                self.record(&s);
                s
            }
            // The exit watcher got there first.
            Err(DemoError::Conflict { .. }) => self.current(project_id)?,
            Err(e) => return Err(e),
        };

        Ok(StopResponse {
            status: fin.state,
            message: "demo stopped".to_string(),
        })
    }

    /// Stops every session holding a port and reclaims orphaned ports. Best-effort.
    pub async fn stop_all(&self) -> StopAllResponse {
        let targets: Vec<SessionSnapshot> = self
            .registry
            .list()
            .into_iter()
            .filter(|s| {
                s.port.is_some()
                    || matches!(s.state, SessionState::Running | SessionState::Launching)
            })
            .collect();

        let mut tasks = Vec::new();
        for s in targets {
            let this = self.clone();
            tasks.push(tokio::spawn(async move {
                let res = this.stop(&s.project_id).await;
                (s, res)
            }));
        }

        let mut sessions_stopped = 0u32;
        let mut ports_freed = 0u32;
        let mut failures = Vec::new();
        for t in tasks {
            match t.await {
                Ok((s, Ok(r))) if !r.status.is_active() => {
                    sessions_stopped += 1;
                    if s.port.is_some() {
                        ports_freed += 1;
                    }
                }
                Ok((s, Ok(r))) => {
                    failures.push(format!("{}: still {}", s.project_id, r.status));
                }
                Ok((s, Err(e))) => failures.push(format!("{}: {e}", s.project_id)),
                Err(e) => failures.push(format!("stop task failed: {e}")),
            }
        }

        for orphan in self.orphans.list() {
            reconcile::terminate_orphan(&orphan, self.config.stop_grace).await;
            self.orphans.remove(orphan.port);
            if self.ports.release(orphan.port) {
                ports_freed += 1;
            }
        }

        tracing::info!(sessions_stopped, ports_freed, failures = failures.len(), "stop-all finished");
        StopAllResponse {
            sessions_stopped,
            ports_freed,
            message: format!("stopped {sessions_stopped} demo(s), freed {ports_freed} port(s)"),
            failures,
        }
    }

    pub fn list_running(&self) -> ListRunningResponse {
        ListRunningResponse {
            sessions: self
                .registry
                .list()
                .into_iter()
                .filter(|s| s.state == SessionState::Running)
                .collect(),
            used_ports: self.ports.list_used().into_iter().collect(),
            orphan_ports: self.orphans.ports(),
        }
    }

    /// Force-stops whatever holds `port`.
    pub async fn release_port(&self, port: u16) -> DemoResult<StopPortResponse> {
        if !self.ports.contains(port) {
            let (min, max) = self.ports.range();
            return Ok(StopPortResponse {
                success: false,
                message: format!("port {port} is outside the demo range {min}-{max}"),
            });
        }

        if let Some(project_id) = self.registry.holder_of(port) {
            let r = self.stop(&project_id).await?;
            return Ok(StopPortResponse {
                success: !r.status.is_active(),
                message: format!("stopped {project_id} on port {port}"),
            });
        }

        if let Some(orphan) = self.orphans.remove(port) {
            let killed = reconcile::terminate_orphan(&orphan, self.config.stop_grace).await;
            self.ports.release(port);
            tracing::info!(port, killed, "released orphaned port");
            return Ok(StopPortResponse {
                success: true,
                message: match orphan.pid {
                    Some(pid) => format!("terminated orphaned process {pid} on port {port}"),
                    None => format!("released port {port}"),
                },
            });
        }

        if self.ports.release(port) {
            Ok(StopPortResponse {
                success: true,
                message: format!("released port {port}"),
            })
        } else {
            Ok(StopPortResponse {
                success: false,
                message: format!("port {port} was not in use"),
            })
        }
    }

    /// Stops the demo if needed, deletes the sandbox and resets the session.
    pub async fn cleanup(&self, project_id: &str) -> DemoResult<StopResponse> {
        self.bundle(project_id)?;
        let snap = self.session(project_id);
        if snap.state.is_active() {
            self.stop(project_id).await?;
        }
        if self.preparer.status(project_id) == EnvStatus::Preparing {
            return Err(DemoError::NotReady);
        }

        self.preparer.remove(project_id).await?;
        self.logs.forget(project_id);

        let snap = match self.registry.transition_from(
            project_id,
            &[SessionState::Ready, SessionState::Stopped, SessionState::Error],
            SessionState::NotPrepared,
        ) {
            Ok(s) => s,
            Err(DemoError::Conflict {
                actual: SessionState::NotPrepared,
                ..
            }) => self.current(project_id)?,
            Err(e) => return Err(e),
        };
        self.record(&snap);
        tracing::info!(project_id = %project_id, "demo cleaned up");

        Ok(StopResponse {
            status: snap.state,
            message: "environment removed".to_string(),
        })
    }

    pub async fn logs(
        &self,
        project_id: &str,
        cursor: u64,
        limit: usize,
    ) -> DemoResult<LogsResponse> {
        self.bundle(project_id)?;
        let limit = limit.clamp(1, MAX_LOG_LIMIT);
        let Some(sink) = self.logs.get(project_id) else {
            return Ok(LogsResponse {
                lines: Vec::new(),
                next_cursor: cursor.to_string(),
            });
        };
        let (lines, next) = sink.buffer().lock().await.tail_after(cursor, limit);
        Ok(LogsResponse {
            lines,
            next_cursor: next.to_string(),
        })
    }

    /// Startup pass that fences ports still held by processes from a previous agent.
    pub async fn reconcile(&self) -> ReconcileReport {
        let report = reconcile::reconcile(
            &self.config.envs_root(),
            &self.ports,
            &self.registry,
            &self.orphans,
        )
        .await;
        tracing::info!(
            adopted = report.adopted.len(),
            fenced = report.fenced.len(),
            stale_run_files = report.stale_run_files,
            "reconciled demo ports"
        );
        report
    }

    /// Returns orphaned ports whose holder is gone to the pool.
    pub fn sweep_orphans(&self) -> BTreeSet<u16> {
        reconcile::sweep(&self.ports, &self.orphans)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::{catalog::MemoryCatalog, templates::CommandSpec};
    use std::{
        path::PathBuf,
        sync::atomic::{AtomicU64, Ordering},
        time::Duration,
    };

    fn temp_dir_for(test_name: &str) -> PathBuf {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        let ts = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        std::env::temp_dir().join(format!(
            "launchpad-orch-{test_name}-{}-{n}-{ts}",
            std::process::id()
        ))
    }

    fn orchestrator(test_name: &str, prepare: &[&str]) -> (PathBuf, Arc<MemoryCatalog>, Orchestrator) {
        let root = temp_dir_for(test_name);
        let catalog = Arc::new(MemoryCatalog::new());
        let bundle_dir = root.join("projects").join("p1");
        std::fs::create_dir_all(&bundle_dir).unwrap();
        catalog.insert(ProjectBundle {
            project_id: "p1".to_string(),
            bundle_dir,
            entrypoint: "app.py".to_string(),
            requirements: None,
            owner: None,
            template_id: Some("test".to_string()),
        });

        let template = RuntimeTemplate {
            template_id: "test".to_string(),
            display_name: "test".to_string(),
            prepare: prepare
                .iter()
                .map(|s| CommandSpec::new("step", "sh", &["-c", s]))
                .collect(),
            // Never binds, so launches fail fast with a crash.
            launch: CommandSpec::new("run", "sh", &["-c", "echo boom >&2; exit 2"]),
        };
        let config = AgentConfig {
            data_root: root.clone(),
            port_min: 41_901,
            port_max: 41_902,
            probe_timeout: Duration::from_secs(5),
            probe_interval: Duration::from_millis(50),
            stop_grace: Duration::from_millis(500),
            ..AgentConfig::default()
        };
        let orch = Orchestrator::with_templates(
            config,
            catalog.clone(),
            TemplateSet::default().with(template),
        );
        (root, catalog, orch)
    }

    async fn wait_state(orch: &Orchestrator, id: &str, want: SessionState) -> SessionSnapshot {
        for _ in 0..200 {
            let s = orch.snapshot(id).unwrap();
            if s.state == want {
                return s;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("{id} never reached {want}: {:?}", orch.snapshot(id).unwrap());
    }

    #[tokio::test]
    async fn unknown_and_invalid_projects_are_rejected() {
        let (root, _catalog, orch) = orchestrator("unknown", &[]);
        assert!(matches!(orch.launch("nope").await, Err(DemoError::NotFound(_))));
        assert!(matches!(
            orch.status("../etc"),
            Err(DemoError::InvalidProjectId(_))
        ));
        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn status_is_side_effect_free() {
        let (root, _catalog, orch) = orchestrator("status", &[]);
        let s = orch.status("p1").unwrap();
        assert_eq!(s.status, SessionState::NotPrepared);
        assert!(orch.registry.get("p1").is_none());
        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn launch_while_preparing_is_not_ready() {
        let (root, catalog, orch) = orchestrator("notready", &["sleep 1"]);
        let p = orch.ensure_prepared("p1").await.unwrap();
        assert_eq!(p.status, EnvStatus::Preparing);
        assert_eq!(
            orch.ensure_prepared("p1").await.unwrap().status,
            EnvStatus::Preparing
        );
        assert!(matches!(orch.launch("p1").await, Err(DemoError::NotReady)));

        wait_state(&orch, "p1", SessionState::Ready).await;
        assert_eq!(
            catalog.history("p1"),
            vec![SessionState::Preparing, SessionState::Ready]
        );
        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn preparation_failure_parks_session_in_error() {
        let (root, _catalog, orch) = orchestrator("prepfail", &["echo 'bad wheel' >&2; exit 1"]);
        orch.ensure_prepared("p1").await.unwrap();
        let s = wait_state(&orch, "p1", SessionState::Error).await;
        assert!(s.last_error.unwrap().contains("bad wheel"));
        assert!(orch.ports().list_used().is_empty());
        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn crashing_app_releases_its_port() {
        let (root, _catalog, orch) = orchestrator("crash", &[]);
        orch.ensure_prepared("p1").await.unwrap();
        wait_state(&orch, "p1", SessionState::Ready).await;

        let err = orch.launch("p1").await.unwrap_err();
        assert!(matches!(err, DemoError::ProcessCrashed(ref m) if m.contains("boom")), "{err}");
        let s = orch.snapshot("p1").unwrap();
        assert_eq!(s.state, SessionState::Error);
        assert!(s.port.is_none());
        assert!(orch.ports().list_used().is_empty());

        let logs = orch.logs("p1", 0, 100).await.unwrap();
        assert!(logs.lines.iter().any(|l| l.contains("boom")));
        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn stop_of_idle_project_is_a_no_op() {
        let (root, _catalog, orch) = orchestrator("idle-stop", &[]);
        let r = orch.stop("p1").await.unwrap();
        assert_eq!(r.status, SessionState::NotPrepared);
        let r = orch.stop("p1").await.unwrap();
        assert_eq!(r.status, SessionState::NotPrepared);
        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn release_port_outside_range_is_refused() {
        let (root, _catalog, orch) = orchestrator("range", &[]);
        let r = orch.release_port(80).await.unwrap();
        assert!(!r.success);
        let r = orch.release_port(41_901).await.unwrap();
        assert!(!r.success);
        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn cleanup_resets_to_not_prepared() {
        let (root, _catalog, orch) = orchestrator("cleanup", &["touch {env}/marker"]);
        orch.ensure_prepared("p1").await.unwrap();
        wait_state(&orch, "p1", SessionState::Ready).await;

        let r = orch.cleanup("p1").await.unwrap();
        assert_eq!(r.status, SessionState::NotPrepared);
        assert!(!root.join("envs").join("p1").exists());
        assert_eq!(
            orch.ensure_prepared("p1").await.unwrap().status,
            EnvStatus::Preparing
        );
        let _ = std::fs::remove_dir_all(&root);
    }
}
