//! Project metadata seam.
//!
//! The core never owns project records: it reads the entrypoint and dependency
//! manifest through [`ProjectCatalog`] and reports lifecycle changes back via
//! [`ProjectCatalog::record`]. Bundles are expected to be on local disk already.

use std::{
    collections::HashMap,
    path::{Component, Path, PathBuf},
    sync::{Mutex, RwLock},
};

use anyhow::Context;
use launchpad_session::{SessionSnapshot, SessionState};

use crate::error::{DemoError, DemoResult};

const DEFAULT_ENTRYPOINT: &str = "app.py";
const DEFAULT_REQUIREMENTS: &str = "requirements.txt";
const MANIFEST_FILE: &str = "project.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectBundle {
    pub project_id: String,
    /// Directory holding the uploaded files.
    pub bundle_dir: PathBuf,
    /// Entrypoint path relative to `bundle_dir`.
    pub entrypoint: String,
    /// Dependency manifest; may point at a file that does not exist.
    pub requirements: Option<PathBuf>,
    pub owner: Option<String>,
    pub template_id: Option<String>,
}

pub trait ProjectCatalog: Send + Sync {
    fn lookup(&self, project_id: &str) -> anyhow::Result<Option<ProjectBundle>>;

    fn record(&self, _project_id: &str, _snapshot: &SessionSnapshot) {}
}

pub fn validate_project_id(project_id: &str) -> DemoResult<()> {
    let ok = !project_id.is_empty()
        && project_id.len() <= 128
        && project_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(DemoError::InvalidProjectId(project_id.to_string()))
    }
}

fn is_contained_relative(path: &str) -> bool {
    let p = Path::new(path);
    !path.is_empty()
        && p.components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

#[derive(Debug, Default, serde::Deserialize)]
struct ProjectManifest {
    entrypoint: Option<String>,
    requirements: Option<String>,
    owner: Option<String>,
    template: Option<String>,
}

/// Reads bundles from `<root>/<project_id>/`, described by an optional `project.toml`.
#[derive(Debug, Clone)]
pub struct DirectoryCatalog {
    root: PathBuf,
}

impl DirectoryCatalog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl ProjectCatalog for DirectoryCatalog {
    fn lookup(&self, project_id: &str) -> anyhow::Result<Option<ProjectBundle>> {
        if validate_project_id(project_id).is_err() {
            return Ok(None);
        }
        let dir = self.root.join(project_id);
        if !dir.is_dir() {
            return Ok(None);
        }

        let manifest_path = dir.join(MANIFEST_FILE);
        let manifest = if manifest_path.exists() {
            let raw = std::fs::read_to_string(&manifest_path)
                .with_context(|| format!("read {}", manifest_path.display()))?;
            toml::from_str::<ProjectManifest>(&raw)
                .with_context(|| format!("parse {}", manifest_path.display()))?
        } else if dir.join(DEFAULT_ENTRYPOINT).exists() {
            ProjectManifest::default()
        } else {
            return Ok(None);
        };

        let entrypoint = manifest
            .entrypoint
            .unwrap_or_else(|| DEFAULT_ENTRYPOINT.to_string());
        if !is_contained_relative(&entrypoint) {
            anyhow::bail!("entrypoint must be a relative path inside the bundle: {entrypoint:?}");
        }
        let requirements = manifest
            .requirements
            .unwrap_or_else(|| DEFAULT_REQUIREMENTS.to_string());
        if !is_contained_relative(&requirements) {
            anyhow::bail!(
                "requirements must be a relative path inside the bundle: {requirements:?}"
            );
        }

        Ok(Some(ProjectBundle {
            project_id: project_id.to_string(),
            requirements: Some(dir.join(requirements)),
            bundle_dir: dir,
            entrypoint,
            owner: manifest.owner.filter(|o| !o.trim().is_empty()),
            template_id: manifest.template.filter(|t| !t.trim().is_empty()),
        }))
    }
}

/// In-process catalog for embedding the core in another service.
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    projects: RwLock<HashMap<String, ProjectBundle>>,
    history: Mutex<Vec<(String, SessionState)>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, bundle: ProjectBundle) {
        let mut map = self.projects.write().unwrap_or_else(|e| e.into_inner());
        map.insert(bundle.project_id.clone(), bundle);
    }

    /// States reported through [`ProjectCatalog::record`], oldest first.
    pub fn history(&self, project_id: &str) -> Vec<SessionState> {
        let h = self.history.lock().unwrap_or_else(|e| e.into_inner());
        h.iter()
            .filter(|(id, _)| id == project_id)
            .map(|(_, s)| *s)
            .collect()
    }
}

impl ProjectCatalog for MemoryCatalog {
    fn lookup(&self, project_id: &str) -> anyhow::Result<Option<ProjectBundle>> {
        let map = self.projects.read().unwrap_or_else(|e| e.into_inner());
        Ok(map.get(project_id).cloned())
    }

    fn record(&self, project_id: &str, snapshot: &SessionSnapshot) {
        let mut h = self.history.lock().unwrap_or_else(|e| e.into_inner());
        h.push((project_id.to_string(), snapshot.state));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::atomic::{AtomicU64, Ordering},
        time::{SystemTime, UNIX_EPOCH},
    };

    fn temp_dir_for(test_name: &str) -> PathBuf {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let mut dir = std::env::temp_dir();
        dir.push(format!(
            "launchpad-catalog-{test_name}-{}-{n}-{ts}",
            std::process::id()
        ));
        dir
    }

    #[test]
    fn project_ids_are_restricted() {
        assert!(validate_project_id("65a1f0c2e4b0a1b2c3d4e5f6").is_ok());
        assert!(validate_project_id("demo_1-a").is_ok());
        assert!(validate_project_id("").is_err());
        assert!(validate_project_id("../etc").is_err());
        assert!(validate_project_id("a/b").is_err());
        assert!(validate_project_id(&"x".repeat(129)).is_err());
    }

    #[test]
    fn directory_without_manifest_uses_defaults() {
        let root = temp_dir_for("defaults");
        std::fs::create_dir_all(root.join("p1")).unwrap();
        std::fs::write(root.join("p1").join("app.py"), "print('hi')\n").unwrap();

        let cat = DirectoryCatalog::new(&root);
        let b = cat.lookup("p1").unwrap().unwrap();
        assert_eq!(b.entrypoint, "app.py");
        assert_eq!(
            b.requirements,
            Some(root.join("p1").join("requirements.txt"))
        );
        assert!(b.owner.is_none());

        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn manifest_overrides_defaults() {
        let root = temp_dir_for("manifest");
        let dir = root.join("p2");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("project.toml"),
            "entrypoint = \"src/main.py\"\nrequirements = \"deps.txt\"\nowner = \"u-7\"\n",
        )
        .unwrap();

        let b = DirectoryCatalog::new(&root).lookup("p2").unwrap().unwrap();
        assert_eq!(b.entrypoint, "src/main.py");
        assert_eq!(b.requirements, Some(dir.join("deps.txt")));
        assert_eq!(b.owner.as_deref(), Some("u-7"));

        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn manifest_rejects_escaping_entrypoint() {
        let root = temp_dir_for("escape");
        let dir = root.join("p3");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("project.toml"), "entrypoint = \"../../bin/sh\"\n").unwrap();

        let err = DirectoryCatalog::new(&root).lookup("p3").unwrap_err();
        assert!(err.to_string().contains("entrypoint"));

        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn unknown_or_empty_directories_are_not_projects() {
        let root = temp_dir_for("unknown");
        std::fs::create_dir_all(root.join("empty")).unwrap();
        let cat = DirectoryCatalog::new(&root);
        assert!(cat.lookup("missing").unwrap().is_none());
        assert!(cat.lookup("empty").unwrap().is_none());
        assert!(cat.lookup("../x").unwrap().is_none());

        let _ = std::fs::remove_dir_all(&root);
    }
}
