use std::{net::SocketAddr, path::PathBuf, time::Duration};

use crate::sandbox::SandboxLimits;

const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8000";
const DEFAULT_PORT_MIN: u16 = 8501;
const DEFAULT_PORT_MAX: u16 = 8600;
const DEFAULT_BASE_URL: &str = "http://localhost";
const DEFAULT_TEMPLATE: &str = "streamlit";

const DEFAULT_LOG_MAX_LINES: usize = 1000;
const DEFAULT_LOG_FILE_MAX_BYTES: u64 = 10 * 1024 * 1024; // 10 MiB
const DEFAULT_LOG_FILE_MAX_FILES: usize = 3;

pub(crate) fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub(crate) fn env_usize(name: &str) -> Option<usize> {
    env_string(name).and_then(|v| v.parse::<usize>().ok())
}

pub(crate) fn env_u64(name: &str) -> Option<u64> {
    env_string(name).and_then(|v| v.parse::<u64>().ok())
}

fn env_port(name: &str) -> Option<u16> {
    env_u64(name).map(|v| v.clamp(1, u16::MAX as u64) as u16)
}

/// Runtime configuration for the agent. Every knob has a clamped default so a
/// bare `launchpad-agent` starts with the same behavior as the hosted service.
#[derive(Clone, Debug)]
pub struct AgentConfig {
    pub listen_addr: SocketAddr,
    pub port_min: u16,
    pub port_max: u16,
    /// Scheme and host that visitors use to reach demos; the port is appended.
    pub base_url: String,
    pub data_root: PathBuf,
    pub projects_root: PathBuf,
    pub template_id: String,
    pub install_timeout: Duration,
    pub probe_timeout: Duration,
    pub probe_interval: Duration,
    pub stop_grace: Duration,
    pub sweep_interval: Duration,
    pub log_max_lines: usize,
    pub log_file_max_bytes: u64,
    pub log_file_max_files: usize,
    /// Daily-rolling agent log directory; stderr only when unset.
    pub log_dir: Option<PathBuf>,
    pub sandbox: SandboxLimits,
}

impl Default for AgentConfig {
    fn default() -> Self {
        let data_root = std::env::temp_dir().join("launchpad");
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR
                .parse()
                .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 8000))),
            port_min: DEFAULT_PORT_MIN,
            port_max: DEFAULT_PORT_MAX,
            base_url: DEFAULT_BASE_URL.to_string(),
            projects_root: data_root.join("projects"),
            data_root,
            template_id: DEFAULT_TEMPLATE.to_string(),
            install_timeout: Duration::from_secs(300),
            probe_timeout: Duration::from_secs(30),
            probe_interval: Duration::from_millis(250),
            stop_grace: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(5),
            log_max_lines: DEFAULT_LOG_MAX_LINES,
            log_file_max_bytes: DEFAULT_LOG_FILE_MAX_BYTES,
            log_file_max_files: DEFAULT_LOG_FILE_MAX_FILES,
            log_dir: None,
            sandbox: SandboxLimits::default(),
        }
    }
}

impl AgentConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        let listen_addr = match env_string("LAUNCHPAD_LISTEN_ADDR") {
            Some(raw) => raw
                .parse::<SocketAddr>()
                .map_err(|e| anyhow::anyhow!("invalid LAUNCHPAD_LISTEN_ADDR={raw:?}: {e}"))?,
            None => defaults.listen_addr,
        };

        let port_min = env_port("LAUNCHPAD_PORT_MIN").unwrap_or(defaults.port_min);
        let port_max = env_port("LAUNCHPAD_PORT_MAX").unwrap_or(defaults.port_max);
        if port_min > port_max {
            anyhow::bail!(
                "invalid port range: LAUNCHPAD_PORT_MIN={port_min} > LAUNCHPAD_PORT_MAX={port_max}"
            );
        }

        let data_root = env_string("LAUNCHPAD_DATA_ROOT")
            .map(PathBuf::from)
            .unwrap_or(defaults.data_root);
        let projects_root = env_string("LAUNCHPAD_PROJECTS_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_root.join("projects"));

        let base_url = env_string("LAUNCHPAD_BASE_URL")
            .map(|v| v.trim_end_matches('/').to_string())
            .unwrap_or(defaults.base_url);

        Ok(Self {
            listen_addr,
            port_min,
            port_max,
            base_url,
            data_root,
            projects_root,
            template_id: env_string("LAUNCHPAD_TEMPLATE").unwrap_or(defaults.template_id),
            install_timeout: Duration::from_secs(
                env_u64("LAUNCHPAD_INSTALL_TIMEOUT_SEC")
                    .map(|v| v.clamp(10, 60 * 60))
                    .unwrap_or(300),
            ),
            probe_timeout: Duration::from_millis(
                env_u64("LAUNCHPAD_PROBE_TIMEOUT_MS")
                    .map(|v| v.clamp(1000, 10 * 60 * 1000))
                    .unwrap_or(30_000),
            ),
            probe_interval: Duration::from_millis(
                env_u64("LAUNCHPAD_PROBE_INTERVAL_MS")
                    .map(|v| v.clamp(50, 5000))
                    .unwrap_or(250),
            ),
            stop_grace: Duration::from_secs(
                env_u64("LAUNCHPAD_STOP_GRACE_SEC")
                    .map(|v| v.clamp(1, 60))
                    .unwrap_or(5),
            ),
            sweep_interval: Duration::from_millis(
                env_u64("LAUNCHPAD_SWEEP_INTERVAL_MS")
                    .map(|v| v.clamp(250, 10 * 60 * 1000))
                    .unwrap_or(5000),
            ),
            log_max_lines: env_usize("LAUNCHPAD_LOG_MAX_LINES")
                .map(|v| v.clamp(100, 50_000))
                .unwrap_or(DEFAULT_LOG_MAX_LINES),
            log_file_max_bytes: env_u64("LAUNCHPAD_LOG_FILE_MAX_BYTES")
                .map(|v| v.clamp(256 * 1024, 1024 * 1024 * 1024))
                .unwrap_or(DEFAULT_LOG_FILE_MAX_BYTES),
            log_file_max_files: env_usize("LAUNCHPAD_LOG_FILE_MAX_FILES")
                .map(|v| v.clamp(1, 20))
                .unwrap_or(DEFAULT_LOG_FILE_MAX_FILES),
            log_dir: env_string("LAUNCHPAD_LOG_DIR").map(PathBuf::from),
            sandbox: SandboxLimits::from_env(),
        })
    }

    /// Root under which every project's sandbox lives, one directory per project.
    pub fn envs_root(&self) -> PathBuf {
        self.data_root.join("envs")
    }

    pub fn pool_size(&self) -> usize {
        (self.port_max as usize) - (self.port_min as usize) + 1
    }

    pub fn demo_url(&self, port: u16) -> String {
        format!("{}:{}", self.base_url, port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_hosted_service() {
        let cfg = AgentConfig::default();
        assert_eq!(cfg.port_min, 8501);
        assert_eq!(cfg.port_max, 8600);
        assert_eq!(cfg.pool_size(), 100);
        assert_eq!(cfg.stop_grace, Duration::from_secs(5));
        assert_eq!(cfg.install_timeout, Duration::from_secs(300));
    }

    #[test]
    fn demo_url_appends_port() {
        let cfg = AgentConfig {
            base_url: "http://demo.example".to_string(),
            ..AgentConfig::default()
        };
        assert_eq!(cfg.demo_url(8502), "http://demo.example:8502");
    }

    #[test]
    fn envs_root_is_under_data_root() {
        let cfg = AgentConfig {
            data_root: PathBuf::from("/srv/launchpad"),
            ..AgentConfig::default()
        };
        assert_eq!(cfg.envs_root(), PathBuf::from("/srv/launchpad/envs"));
    }
}
