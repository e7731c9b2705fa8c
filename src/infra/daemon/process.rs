// src/infra/daemon/process.rs — PID file guarding a single daemon instance

use std::path::PathBuf;

fn pid_path() -> PathBuf {
    crate::infra::paths::data_dir().join("spendguard.pid")
}

/// Removes the PID file when dropped.
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn create() -> anyhow::Result<Self> {
        let path = pid_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, std::process::id().to_string())?;
        Ok(Self { path })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// True if the PID file names a live process other than this one.
pub fn is_daemon_running() -> bool {
    let Ok(content) = std::fs::read_to_string(pid_path()) else {
        return false;
    };
    let Ok(pid) = content.trim().parse::<u32>() else {
        return false;
    };
    if pid == std::process::id() {
        return false;
    }

    #[cfg(unix)]
    {
        std::process::Command::new("kill")
            .args(["-0", &pid.to_string()])
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        true
    }
}
