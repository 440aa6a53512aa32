#![allow(dead_code)]

use std::{
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use launchpad_agent::{
    Orchestrator,
    catalog::{MemoryCatalog, ProjectBundle},
    config::AgentConfig,
    templates::{CommandSpec, RuntimeTemplate, TemplateSet},
};
use launchpad_session::{SessionSnapshot, SessionState};

pub const SAMPLE_BIN: &str = env!("CARGO_BIN_EXE_launchpad-sample");

pub fn temp_dir_for(test_name: &str) -> PathBuf {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    let ts = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    std::env::temp_dir().join(format!(
        "launchpad-it-{test_name}-{}-{n}-{ts}",
        std::process::id()
    ))
}

pub struct Harness {
    pub root: PathBuf,
    pub catalog: Arc<MemoryCatalog>,
    pub orch: Orchestrator,
}

impl Drop for Harness {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.root);
    }
}

pub struct HarnessBuilder {
    name: String,
    ports: (u16, u16),
    prepare: Vec<String>,
    install_timeout: Duration,
    probe_timeout: Duration,
    launch: Option<String>,
    projects: Vec<(String, Option<String>)>,
}

pub fn harness(name: &str, min: u16, max: u16) -> HarnessBuilder {
    HarnessBuilder {
        name: name.to_string(),
        ports: (min, max),
        prepare: vec!["echo installing".to_string()],
        install_timeout: Duration::from_secs(30),
        probe_timeout: Duration::from_secs(10),
        launch: None,
        projects: Vec::new(),
    }
}

impl HarnessBuilder {
    pub fn prepare(mut self, steps: &[&str]) -> Self {
        self.prepare = steps.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn install_timeout(mut self, t: Duration) -> Self {
        self.install_timeout = t;
        self
    }

    pub fn probe_timeout(mut self, t: Duration) -> Self {
        self.probe_timeout = t;
        self
    }

    /// Replaces the sample app with an `sh -c` script (placeholders expanded).
    pub fn launch_script(mut self, script: &str) -> Self {
        self.launch = Some(script.to_string());
        self
    }

    pub fn project(mut self, id: &str) -> Self {
        self.projects.push((id.to_string(), None));
        self
    }

    pub fn owned_project(mut self, id: &str, owner: &str) -> Self {
        self.projects.push((id.to_string(), Some(owner.to_string())));
        self
    }

    pub fn build(self) -> Harness {
        let root = temp_dir_for(&self.name);
        let catalog = Arc::new(MemoryCatalog::new());
        for (id, owner) in &self.projects {
            let bundle_dir = root.join("projects").join(id);
            std::fs::create_dir_all(&bundle_dir).unwrap();
            std::fs::write(bundle_dir.join("app.py"), "print('hi')\n").unwrap();
            catalog.insert(ProjectBundle {
                project_id: id.clone(),
                bundle_dir,
                entrypoint: "app.py".to_string(),
                requirements: None,
                owner: owner.clone(),
                template_id: Some("sample".to_string()),
            });
        }

        let steps: Vec<&str> = self.prepare.iter().map(String::as_str).collect();
        let template = RuntimeTemplate {
            template_id: "sample".to_string(),
            display_name: "sample http app".to_string(),
            prepare: steps
                .iter()
                .map(|s| CommandSpec::new("step", "sh", &["-c", s]))
                .collect(),
            launch: match &self.launch {
                Some(script) => CommandSpec::new("serve", "sh", &["-c", script]),
                None => CommandSpec::new("serve", SAMPLE_BIN, &["--port", "{port}"]),
            },
        };

        let config = AgentConfig {
            data_root: root.clone(),
            projects_root: root.join("projects"),
            port_min: self.ports.0,
            port_max: self.ports.1,
            install_timeout: self.install_timeout,
            probe_timeout: self.probe_timeout,
            probe_interval: Duration::from_millis(50),
            stop_grace: Duration::from_secs(2),
            ..AgentConfig::default()
        };
        let orch = Orchestrator::with_templates(
            config,
            catalog.clone(),
            TemplateSet::default().with(template),
        );
        Harness {
            root,
            catalog,
            orch,
        }
    }
}

pub async fn wait_state(orch: &Orchestrator, id: &str, want: SessionState) -> SessionSnapshot {
    for _ in 0..400 {
        let s = orch.snapshot(id).unwrap();
        if s.state == want {
            return s;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("{id} never reached {want}: {:?}", orch.snapshot(id).unwrap());
}

pub async fn prepared(orch: &Orchestrator, id: &str) {
    orch.ensure_prepared(id).await.unwrap();
    wait_state(orch, id, SessionState::Ready).await;
}
