//! Port bookkeeping for processes the registry does not own.
//!
//! After an agent restart the in-memory registry is empty, but demos spawned by
//! the previous agent may still be serving. Their `run.json` files and the OS
//! view of the pool are used to fence those ports so they are never handed out
//! twice; the sweeper returns them once the holder is gone.

use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
    sync::Mutex,
    time::Duration,
};

use serde::Serialize;

use crate::{
    orchestrator::Orchestrator,
    port_alloc::{BindProbe, PortAllocator, probe_bind},
    registry::SessionRegistry,
    sandbox,
    supervisor::{RunInfo, read_run_json},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrphanPort {
    pub port: u16,
    /// Known when adopted from a `run.json`; absent for foreign listeners.
    pub pid: Option<u32>,
    pub project_id: Option<String>,
}

#[derive(Debug, Default)]
pub struct OrphanLedger {
    ports: Mutex<BTreeMap<u16, OrphanPort>>,
}

impl OrphanLedger {
    pub fn insert(&self, orphan: OrphanPort) {
        let mut ports = self.ports.lock().unwrap_or_else(|e| e.into_inner());
        ports.insert(orphan.port, orphan);
    }

    pub fn remove(&self, port: u16) -> Option<OrphanPort> {
        let mut ports = self.ports.lock().unwrap_or_else(|e| e.into_inner());
        ports.remove(&port)
    }

    pub fn get(&self, port: u16) -> Option<OrphanPort> {
        let ports = self.ports.lock().unwrap_or_else(|e| e.into_inner());
        ports.get(&port).cloned()
    }

    pub fn list(&self) -> Vec<OrphanPort> {
        let ports = self.ports.lock().unwrap_or_else(|e| e.into_inner());
        ports.values().cloned().collect()
    }

    pub fn ports(&self) -> Vec<u16> {
        let ports = self.ports.lock().unwrap_or_else(|e| e.into_inner());
        ports.keys().copied().collect()
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Ports held by live processes found through `run.json`.
    pub adopted: Vec<u16>,
    /// Ports bound by processes nothing on disk accounts for.
    pub fenced: Vec<u16>,
    pub stale_run_files: usize,
}

async fn scan_run_files(envs_root: &Path) -> Vec<(PathBuf, RunInfo)> {
    let mut out = Vec::new();
    let Ok(mut rd) = tokio::fs::read_dir(envs_root).await else {
        return out;
    };
    while let Ok(Some(entry)) = rd.next_entry().await {
        let dir = entry.path();
        if let Some(info) = read_run_json(&dir).await {
            out.push((dir, info));
        }
    }
    out
}

pub async fn reconcile(
    envs_root: &Path,
    ports: &PortAllocator,
    registry: &SessionRegistry,
    orphans: &OrphanLedger,
) -> ReconcileReport {
    let mut report = ReconcileReport::default();

    for (dir, info) in scan_run_files(envs_root).await {
        let live = info.pid.is_some_and(sandbox::pid_alive);
        let owned = registry.holder_of(info.port).is_some();
        if live && !owned && ports.contains(info.port) {
            if ports.claim(info.port) {
                orphans.insert(OrphanPort {
                    port: info.port,
                    pid: info.pid,
                    project_id: Some(info.project_id.clone()),
                });
                report.adopted.push(info.port);
                tracing::info!(
                    project_id = %info.project_id,
                    port = info.port,
                    pid = info.pid.unwrap_or_default(),
                    "adopted demo process from a previous agent"
                );
            }
        } else if !live {
            let _ = tokio::fs::remove_file(dir.join("run.json")).await;
            report.stale_run_files += 1;
        }
    }

    let (min, max) = ports.range();
    for port in min..=max {
        if ports.is_used(port) {
            continue;
        }
        if probe_bind(port) == BindProbe::InUse && ports.claim(port) {
            orphans.insert(OrphanPort {
                port,
                pid: None,
                project_id: None,
            });
            report.fenced.push(port);
            tracing::warn!(port, "demo port bound by an unknown process; fenced");
        }
    }

    report
}

/// Releases orphaned ports whose holder has exited and that nothing binds anymore.
pub fn sweep(ports: &PortAllocator, orphans: &OrphanLedger) -> BTreeSet<u16> {
    let mut freed = BTreeSet::new();
    for o in orphans.list() {
        let alive = o.pid.is_some_and(sandbox::pid_alive);
        if alive || probe_bind(o.port) != BindProbe::Free {
            continue;
        }
        orphans.remove(o.port);
        if ports.release(o.port) {
            tracing::info!(port = o.port, "orphaned port returned to the pool");
        }
        freed.insert(o.port);
    }
    freed
}

/// SIGTERM, bounded wait, SIGKILL. Only adopted orphans carry a pid to signal.
pub async fn terminate_orphan(orphan: &OrphanPort, grace: Duration) -> bool {
    let Some(pid) = orphan.pid else {
        return false;
    };
    if !sandbox::pid_alive(pid) {
        return true;
    }

    #[cfg(unix)]
    {
        // Agent-spawned demos lead their own process group.
        if !sandbox::signal_group(pid as i32, libc::SIGTERM) {
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
        }
    }

    let deadline = tokio::time::Instant::now() + grace;
    while tokio::time::Instant::now() < deadline {
        if !sandbox::pid_alive(pid) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    #[cfg(unix)]
    {
        if !sandbox::signal_group(pid as i32, libc::SIGKILL) {
            unsafe {
                libc::kill(pid as i32, libc::SIGKILL);
            }
        }
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    !sandbox::pid_alive(pid)
}

/// Periodically returns orphaned ports to the pool.
#[derive(Clone)]
pub struct OrphanSweeper {
    orchestrator: Orchestrator,
    interval: Duration,
}

impl OrphanSweeper {
    pub fn new(orchestrator: Orchestrator, interval: Duration) -> Self {
        Self {
            orchestrator,
            interval,
        }
    }

    pub fn spawn(self) {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(self.interval).await;
                self.tick();
            }
        });
    }

    fn tick(&self) {
        if self.orchestrator.orphans().list().is_empty() {
            return;
        }
        let freed = self.orchestrator.sweep_orphans();
        if !freed.is_empty() {
            tracing::debug!(ports = ?freed, "orphan sweep");
        }
    }
}
