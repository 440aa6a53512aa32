use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::Context;
use launchpad_session::EnvStatus;
use tokio::{process::Command, sync::watch};

use crate::{
    catalog::ProjectBundle,
    logs::{LogSink, ProjectLogs},
    sandbox::{self, SandboxLimits},
    templates::{Placeholders, ResolvedCommand, RuntimeTemplate},
};

const READY_MARKER: &str = ".ready";
const DIAGNOSTIC_LINES: usize = 20;
/// Kept across rebuilds; everything else in the env dir belongs to the sandbox.
const PRESERVED: &[&str] = &["logs", "run.json"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvOutcome {
    pub status: EnvStatus,
    pub message: Option<String>,
}

impl EnvOutcome {
    fn new(status: EnvStatus, message: Option<String>) -> Self {
        Self { status, message }
    }
}

struct EnvEntry {
    tx: watch::Sender<EnvOutcome>,
}

/// Builds one isolated dependency sandbox per project under `<envs_root>/<project_id>/`.
#[derive(Clone)]
pub struct EnvironmentPreparer {
    envs_root: PathBuf,
    install_timeout: Duration,
    sandbox: SandboxLimits,
    logs: ProjectLogs,
    inner: Arc<Mutex<HashMap<String, EnvEntry>>>,
}

impl EnvironmentPreparer {
    pub fn new(
        envs_root: impl Into<PathBuf>,
        install_timeout: Duration,
        sandbox: SandboxLimits,
        logs: ProjectLogs,
    ) -> Self {
        Self {
            envs_root: envs_root.into(),
            install_timeout,
            sandbox,
            logs,
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn env_path(&self, project_id: &str) -> PathBuf {
        self.envs_root.join(project_id)
    }

    pub fn envs_root(&self) -> &Path {
        &self.envs_root
    }

    fn on_disk(&self, project_id: &str) -> EnvOutcome {
        if self.env_path(project_id).join(READY_MARKER).is_file() {
            EnvOutcome::new(EnvStatus::Ready, None)
        } else {
            EnvOutcome::new(EnvStatus::NotPrepared, None)
        }
    }

    pub fn outcome(&self, project_id: &str) -> EnvOutcome {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.get(project_id) {
            Some(e) => e.tx.borrow().clone(),
            None => self.on_disk(project_id),
        }
    }

    pub fn status(&self, project_id: &str) -> EnvStatus {
        self.outcome(project_id).status
    }

    /// Receiver that observes every status change for the project.
    pub fn subscribe(&self, project_id: &str) -> watch::Receiver<EnvOutcome> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .entry(project_id.to_string())
            .or_insert_with(|| EnvEntry {
                tx: watch::channel(self.on_disk(project_id)).0,
            })
            .tx
            .subscribe()
    }

    fn publish(&self, project_id: &str, outcome: EnvOutcome) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.get(project_id) {
            Some(e) => {
                e.tx.send_replace(outcome);
            }
            None => {
                inner.insert(
                    project_id.to_string(),
                    EnvEntry {
                        tx: watch::channel(outcome).0,
                    },
                );
            }
        }
    }

    /// Starts building the sandbox in the background and returns immediately.
    /// A project that is already `ready` or `preparing` is left alone.
    pub fn prepare(&self, bundle: &ProjectBundle, template: &RuntimeTemplate) -> EnvStatus {
        let project_id = bundle.project_id.clone();
        {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            let current = match inner.get(&project_id) {
                Some(e) => e.tx.borrow().status,
                None => self.on_disk(&project_id).status,
            };
            if matches!(current, EnvStatus::Ready | EnvStatus::Preparing) {
                return current;
            }

            let outcome = EnvOutcome::new(
                EnvStatus::Preparing,
                Some("installing dependencies".to_string()),
            );
            match inner.get(&project_id) {
                Some(e) => {
                    e.tx.send_replace(outcome);
                }
                None => {
                    inner.insert(
                        project_id.clone(),
                        EnvEntry {
                            tx: watch::channel(outcome).0,
                        },
                    );
                }
            }
        }

        tracing::info!(project_id = %project_id, template_id = %template.template_id, "preparing environment");

        let this = self.clone();
        let bundle = bundle.clone();
        let template = template.clone();
        tokio::spawn(async move {
            let outcome = this.build(&bundle, &template).await;
            match outcome.status {
                EnvStatus::Ready => {
                    tracing::info!(project_id = %bundle.project_id, "environment ready");
                }
                _ => {
                    tracing::warn!(
                        project_id = %bundle.project_id,
                        error = outcome.message.as_deref().unwrap_or_default(),
                        "environment preparation failed"
                    );
                }
            }
            this.publish(&bundle.project_id, outcome);
        });

        EnvStatus::Preparing
    }

    async fn build(&self, bundle: &ProjectBundle, template: &RuntimeTemplate) -> EnvOutcome {
        let env_dir = self.env_path(&bundle.project_id);
        let sink = self.logs.sink(&bundle.project_id);

        let result = match tokio::time::timeout(
            self.install_timeout,
            self.run_steps(&env_dir, bundle, template, &sink),
        )
        .await
        {
            Ok(r) => r,
            Err(_) => Err(anyhow::anyhow!(
                "dependency installation timed out after {}s",
                self.install_timeout.as_secs()
            )),
        };

        match result {
            Ok(()) => {
                sink.emit("[launchpad] environment ready").await;
                EnvOutcome::new(EnvStatus::Ready, None)
            }
            Err(err) => {
                let msg = crate::error::format_error_chain(&err);
                sink.emit(format!("[launchpad] preparation failed: {msg}")).await;
                if let Err(e) = clear_sandbox(&env_dir).await {
                    tracing::warn!(path = %env_dir.display(), error = %e, "failed to remove half-built sandbox");
                }
                EnvOutcome::new(EnvStatus::Error, Some(msg))
            }
        }
    }

    async fn run_steps(
        &self,
        env_dir: &Path,
        bundle: &ProjectBundle,
        template: &RuntimeTemplate,
        sink: &LogSink,
    ) -> anyhow::Result<()> {
        // Re-preparing always starts from an empty sandbox.
        clear_sandbox(env_dir).await.context("reset sandbox")?;
        tokio::fs::create_dir_all(env_dir)
            .await
            .with_context(|| format!("create {}", env_dir.display()))?;

        let vars = Placeholders {
            env: env_dir,
            files: &bundle.bundle_dir,
            entrypoint: &bundle.entrypoint,
            requirements: bundle.requirements.as_deref(),
            port: None,
        };

        for step in &template.prepare {
            match step.resolve(&vars) {
                Some(cmd) => self.run_step(cmd, sink).await?,
                None => {
                    sink.emit(format!("[launchpad] skip: {}", step.label)).await;
                }
            }
        }

        let marker = env_dir.join(READY_MARKER);
        tokio::fs::write(&marker, format!("{}\n", template.template_id))
            .await
            .with_context(|| format!("write {}", marker.display()))?;
        Ok(())
    }

    async fn run_step(&self, cmd: ResolvedCommand, sink: &LogSink) -> anyhow::Result<()> {
        sink.emit(format!("[launchpad] {}: {}", cmd.label, cmd.display()))
            .await;
        let cursor = sink.buffer().lock().await.cursor();

        let mut c = Command::new(&cmd.program);
        c.args(&cmd.args)
            .current_dir(&cmd.cwd)
            .envs(&cmd.env)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        sandbox::confine(&mut c, &self.sandbox);

        let mut child = c
            .spawn()
            .with_context(|| format!("{}: spawn {}", cmd.label, cmd.program))?;
        let mut guard = GroupGuard(child.id().map(|p| p as i32));

        let out = child.stdout.take().map(|r| sink.pipe("stdout", r));
        let err = child.stderr.take().map(|r| sink.pipe("stderr", r));

        let status = child
            .wait()
            .await
            .with_context(|| format!("{}: wait", cmd.label))?;
        guard.disarm();
        for h in [out, err].into_iter().flatten() {
            let _ = h.await;
        }

        if status.success() {
            return Ok(());
        }

        let diagnostic = sink
            .buffer()
            .lock()
            .await
            .diagnostic_after(cursor, DIAGNOSTIC_LINES);
        match diagnostic {
            Some(d) => anyhow::bail!("{} failed ({status}):\n{d}", cmd.label),
            None => anyhow::bail!("{} failed ({status})", cmd.label),
        }
    }

    /// Deletes the project's sandbox. Refused while preparation is running.
    pub async fn remove(&self, project_id: &str) -> anyhow::Result<()> {
        if self.status(project_id) == EnvStatus::Preparing {
            anyhow::bail!("environment for {project_id} is still being prepared");
        }
        let dir = self.env_path(project_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).with_context(|| format!("remove {}", dir.display()));
            }
        }
        self.publish(project_id, EnvOutcome::new(EnvStatus::NotPrepared, None));
        tracing::info!(project_id = %project_id, "environment removed");
        Ok(())
    }
}

/// Kills the step's whole process group if the step future is dropped (install timeout).
struct GroupGuard(Option<i32>);

impl GroupGuard {
    fn disarm(&mut self) {
        self.0 = None;
    }
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        if let Some(pgid) = self.0.take() {
            #[cfg(unix)]
            {
                sandbox::signal_group(pgid, libc::SIGKILL);
            }
            #[cfg(not(unix))]
            {
                let _ = pgid;
            }
        }
    }
}

async fn clear_sandbox(env_dir: &Path) -> std::io::Result<()> {
    let mut rd = match tokio::fs::read_dir(env_dir).await {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    while let Some(entry) = rd.next_entry().await? {
        let name = entry.file_name();
        if PRESERVED.iter().any(|p| name == *p) {
            continue;
        }
        let path = entry.path();
        if entry.file_type().await?.is_dir() {
            tokio::fs::remove_dir_all(&path).await?;
        } else {
            tokio::fs::remove_file(&path).await?;
        }
    }
    Ok(())
}
