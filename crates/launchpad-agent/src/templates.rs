use std::{
    collections::{BTreeMap, HashMap},
    path::{Path, PathBuf},
};

/// One command line with `{placeholder}` slots, expanded per project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub label: String,
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<String>,
    pub env: BTreeMap<String, String>,
    /// Skip this step unless the expanded path exists.
    pub when_exists: Option<String>,
}

impl CommandSpec {
    pub fn new(label: &str, program: &str, args: &[&str]) -> Self {
        Self {
            label: label.to_string(),
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            cwd: None,
            env: BTreeMap::new(),
            when_exists: None,
        }
    }

    pub fn in_dir(mut self, cwd: &str) -> Self {
        self.cwd = Some(cwd.to_string());
        self
    }

    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }

    pub fn when_exists(mut self, path: &str) -> Self {
        self.when_exists = Some(path.to_string());
        self
    }

    /// Returns `None` when the step's `when_exists` condition is not met.
    pub fn resolve(&self, vars: &Placeholders<'_>) -> Option<ResolvedCommand> {
        if let Some(cond) = &self.when_exists {
            let path = vars.expand(cond);
            if path.is_empty() || !Path::new(&path).exists() {
                return None;
            }
        }

        let cwd = self
            .cwd
            .as_deref()
            .map(|c| PathBuf::from(vars.expand(c)))
            .unwrap_or_else(|| vars.env.to_path_buf());

        Some(ResolvedCommand {
            label: self.label.clone(),
            program: vars.expand(&self.program),
            args: self.args.iter().map(|a| vars.expand(a)).collect(),
            cwd,
            env: self
                .env
                .iter()
                .map(|(k, v)| (k.clone(), vars.expand(v)))
                .collect(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCommand {
    pub label: String,
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: BTreeMap<String, String>,
}

impl ResolvedCommand {
    pub fn display(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

pub struct Placeholders<'a> {
    pub env: &'a Path,
    pub files: &'a Path,
    pub entrypoint: &'a str,
    pub requirements: Option<&'a Path>,
    pub port: Option<u16>,
}

impl Placeholders<'_> {
    pub fn expand(&self, raw: &str) -> String {
        let requirements = self
            .requirements
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        let port = self.port.map(|p| p.to_string()).unwrap_or_default();
        raw.replace("{env}", &self.env.display().to_string())
            .replace("{files}", &self.files.display().to_string())
            .replace("{entrypoint}", self.entrypoint)
            .replace("{requirements}", &requirements)
            .replace("{port}", &port)
    }
}

/// How a project is installed and started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeTemplate {
    pub template_id: String,
    pub display_name: String,
    pub prepare: Vec<CommandSpec>,
    pub launch: CommandSpec,
}

fn venv_steps() -> Vec<CommandSpec> {
    vec![
        CommandSpec::new("create venv", "python3", &["-m", "venv", "{env}/venv"]),
        CommandSpec::new(
            "install requirements",
            "{env}/venv/bin/pip",
            &["install", "--no-input", "-r", "{requirements}"],
        )
        .when_exists("{requirements}"),
    ]
}

pub fn builtin_templates() -> Vec<RuntimeTemplate> {
    let mut streamlit_prepare = venv_steps();
    streamlit_prepare.push(CommandSpec::new(
        "install streamlit",
        "{env}/venv/bin/pip",
        &["install", "--no-input", "streamlit"],
    ));

    vec![
        RuntimeTemplate {
            template_id: "streamlit".to_string(),
            display_name: "Streamlit app".to_string(),
            prepare: streamlit_prepare,
            launch: CommandSpec::new(
                "streamlit",
                "{env}/venv/bin/streamlit",
                &[
                    "run",
                    "{files}/{entrypoint}",
                    "--server.port",
                    "{port}",
                    "--server.address",
                    "0.0.0.0",
                    "--server.headless",
                    "true",
                    "--browser.gatherUsageStats",
                    "false",
                ],
            )
            .in_dir("{files}")
            .with_env("VIRTUAL_ENV", "{env}/venv"),
        },
        RuntimeTemplate {
            template_id: "python".to_string(),
            display_name: "Python script reading $PORT".to_string(),
            prepare: venv_steps(),
            launch: CommandSpec::new("python", "{env}/venv/bin/python", &["{files}/{entrypoint}"])
                .in_dir("{files}")
                .with_env("VIRTUAL_ENV", "{env}/venv")
                .with_env("PORT", "{port}"),
        },
        RuntimeTemplate {
            template_id: "exec".to_string(),
            display_name: "Prebuilt executable".to_string(),
            prepare: Vec::new(),
            launch: CommandSpec::new("exec", "{files}/{entrypoint}", &["--port", "{port}"])
                .in_dir("{files}")
                .with_env("PORT", "{port}"),
        },
    ]
}

/// Template lookup table: the builtins plus any registered by the embedder.
#[derive(Debug, Clone)]
pub struct TemplateSet {
    by_id: HashMap<String, RuntimeTemplate>,
}

impl Default for TemplateSet {
    fn default() -> Self {
        let mut set = Self {
            by_id: HashMap::new(),
        };
        for t in builtin_templates() {
            set.insert(t);
        }
        set
    }
}

impl TemplateSet {
    pub fn insert(&mut self, template: RuntimeTemplate) {
        self.by_id.insert(template.template_id.clone(), template);
    }

    pub fn with(mut self, template: RuntimeTemplate) -> Self {
        self.insert(template);
        self
    }

    pub fn find(&self, template_id: &str) -> Option<&RuntimeTemplate> {
        self.by_id.get(template_id)
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.by_id.keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars<'a>(env: &'a Path, files: &'a Path, req: Option<&'a Path>) -> Placeholders<'a> {
        Placeholders {
            env,
            files,
            entrypoint: "app.py",
            requirements: req,
            port: Some(8501),
        }
    }

    #[test]
    fn builtins_are_registered() {
        let set = TemplateSet::default();
        assert_eq!(set.ids(), vec!["exec", "python", "streamlit"]);
    }

    #[test]
    fn streamlit_launch_binds_port_headless() {
        let set = TemplateSet::default();
        let t = set.find("streamlit").unwrap();
        let env = Path::new("/envs/p1");
        let files = Path::new("/projects/p1");
        let cmd = t.launch.resolve(&vars(env, files, None)).unwrap();
        assert_eq!(cmd.program, "/envs/p1/venv/bin/streamlit");
        assert_eq!(cmd.args[1], "/projects/p1/app.py");
        assert!(cmd.display().contains("--server.port 8501"));
        assert!(cmd.display().contains("--server.headless true"));
        assert_eq!(cmd.cwd, PathBuf::from("/projects/p1"));
        assert_eq!(cmd.env.get("VIRTUAL_ENV").unwrap(), "/envs/p1/venv");
    }

    #[test]
    fn requirements_step_is_skipped_without_manifest() {
        let set = TemplateSet::default();
        let t = set.find("streamlit").unwrap();
        let env = Path::new("/envs/p1");
        let files = Path::new("/projects/p1");
        let missing = Path::new("/definitely/not/here/requirements.txt");

        let steps: Vec<_> = t
            .prepare
            .iter()
            .filter_map(|s| s.resolve(&vars(env, files, Some(missing))))
            .collect();
        let labels: Vec<_> = steps.iter().map(|s| s.label.as_str()).collect();
        assert_eq!(labels, vec!["create venv", "install streamlit"]);

        let none: Vec<_> = t
            .prepare
            .iter()
            .filter_map(|s| s.resolve(&vars(env, files, None)))
            .collect();
        assert_eq!(none.len(), 2);
    }

    #[test]
    fn default_cwd_is_env_dir() {
        let spec = CommandSpec::new("noop", "true", &[]);
        let cmd = spec
            .resolve(&vars(Path::new("/e"), Path::new("/f"), None))
            .unwrap();
        assert_eq!(cmd.cwd, PathBuf::from("/e"));
        assert_eq!(cmd.display(), "true");
    }

    #[test]
    fn custom_templates_override_builtins() {
        let custom = RuntimeTemplate {
            template_id: "exec".to_string(),
            display_name: "custom".to_string(),
            prepare: vec![CommandSpec::new("warm", "sh", &["-c", "true"])],
            launch: CommandSpec::new("run", "{files}/{entrypoint}", &[]),
        };
        let set = TemplateSet::default().with(custom);
        assert_eq!(set.find("exec").unwrap().display_name, "custom");
    }
}
