use std::io;

use crate::config::env_u64;

/// Per-process resource limits applied to every demo application and install step.
///
/// Zero means "leave the inherited limit alone".
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SandboxLimits {
    pub memory_bytes: u64,
    pub pids_limit: u64,
    pub nofile_limit: u64,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            memory_bytes: 0,
            pids_limit: 0,
            nofile_limit: 8192,
        }
    }
}

impl SandboxLimits {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let memory_mb = env_u64("LAUNCHPAD_SANDBOX_MEMORY_MB")
            .map(|v| if v == 0 { 0 } else { v.clamp(256, 131_072) })
            .unwrap_or(0);
        Self {
            memory_bytes: memory_mb.saturating_mul(1024 * 1024),
            pids_limit: env_u64("LAUNCHPAD_SANDBOX_PIDS_LIMIT")
                .map(|v| if v == 0 { 0 } else { v.clamp(32, 32_768) })
                .unwrap_or(defaults.pids_limit),
            nofile_limit: env_u64("LAUNCHPAD_SANDBOX_NOFILE_LIMIT")
                .map(|v| if v == 0 { 0 } else { v.clamp(256, 1_048_576) })
                .unwrap_or(defaults.nofile_limit),
        }
    }

    pub fn summary(&self) -> String {
        let mem_mb = if self.memory_bytes == 0 {
            "unlimited".to_string()
        } else {
            format!("{}MiB", self.memory_bytes / (1024 * 1024))
        };
        let pids = if self.pids_limit == 0 {
            "unlimited".to_string()
        } else {
            self.pids_limit.to_string()
        };
        let nofile = if self.nofile_limit == 0 {
            "inherited".to_string()
        } else {
            self.nofile_limit.to_string()
        };

        format!("mem={mem_mb} pids={pids} nofile={nofile}")
    }

    /// Runs in the forked child before exec. Only async-signal-safe calls here.
    pub fn apply_pre_exec(&self) -> io::Result<()> {
        #[cfg(target_os = "linux")]
        {
            // Never raise a hard limit: an unprivileged agent cannot, and the spawn would fail.
            fn lower_rlimit(resource: libc::__rlimit_resource_t, limit: u64) -> io::Result<()> {
                let mut cur = libc::rlimit {
                    rlim_cur: 0,
                    rlim_max: 0,
                };
                if unsafe { libc::getrlimit(resource, &mut cur) } == -1 {
                    return Err(io::Error::last_os_error());
                }
                let want = (limit as libc::rlim_t).min(cur.rlim_max);
                let lim = libc::rlimit {
                    rlim_cur: want,
                    rlim_max: want,
                };
                let rc = unsafe { libc::setrlimit(resource, &lim) };
                if rc == -1 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            }

            lower_rlimit(libc::RLIMIT_CORE, 0)?;

            // Uploaded code must not gain privileges through setuid binaries.
            let rc = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
            if rc == -1 {
                return Err(io::Error::last_os_error());
            }

            if self.memory_bytes > 0 {
                lower_rlimit(libc::RLIMIT_AS, self.memory_bytes)?;
            }
            if self.pids_limit > 0 {
                lower_rlimit(libc::RLIMIT_NPROC, self.pids_limit)?;
            }
            if self.nofile_limit > 0 {
                lower_rlimit(libc::RLIMIT_NOFILE, self.nofile_limit)?;
            }
        }

        Ok(())
    }
}

#[cfg(target_os = "linux")]
fn set_parent_death_signal() -> io::Result<()> {
    // If the agent dies (crash/kill), the child gets SIGTERM instead of leaking its port.
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn set_parent_death_signal() -> io::Result<()> {
    Ok(())
}

/// Puts the child in its own session/process group (so the whole tree can be
/// signalled with `kill(-pgid)`) and applies `limits` before exec.
pub fn confine(cmd: &mut tokio::process::Command, limits: &SandboxLimits) {
    #[cfg(unix)]
    {
        let limits = limits.clone();
        unsafe {
            cmd.pre_exec(move || {
                set_parent_death_signal()?;
                if libc::setsid() == -1 {
                    return Err(io::Error::last_os_error());
                }
                limits.apply_pre_exec()
            });
        }
    }
    #[cfg(not(unix))]
    {
        let _ = (cmd, limits);
    }
}

/// Sends `signal` to the process group led by `pgid`. Returns false if the group is gone.
#[cfg(unix)]
pub fn signal_group(pgid: i32, signal: i32) -> bool {
    if pgid <= 0 {
        return false;
    }
    unsafe { libc::kill(-pgid, signal) == 0 }
}

#[cfg(not(unix))]
pub fn signal_group(_pgid: i32, _signal: i32) -> bool {
    false
}

#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    let rc = unsafe { libc::kill(pid as i32, 0) };
    if rc == 0 {
        return true;
    }
    // EPERM: exists but owned by someone else.
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn pid_alive(_pid: u32) -> bool {
    false
}
