// src/infra/paths.rs — Config and data path management
//
// All paths respect the SPENDGUARD_HOME environment variable for isolation.
// When SPENDGUARD_HOME is set, config and data live under that directory.
// When unset, config uses ~/.spendguard/ and data uses XDG_DATA_HOME/spendguard.

use directories::{BaseDirs, ProjectDirs};
use std::path::PathBuf;

fn spendguard_home() -> Option<PathBuf> {
    std::env::var_os("SPENDGUARD_HOME").map(PathBuf::from)
}

fn home_dir() -> PathBuf {
    BaseDirs::new()
        .map(|b| b.home_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Configuration directory: $SPENDGUARD_HOME/ or ~/.spendguard/
pub fn config_dir() -> PathBuf {
    if let Some(home) = spendguard_home() {
        return home;
    }
    home_dir().join(".spendguard")
}

/// Data directory: $SPENDGUARD_HOME/data/ or the platform data dir.
pub fn data_dir() -> PathBuf {
    if let Some(home) = spendguard_home() {
        return home.join("data");
    }
    ProjectDirs::from("", "", "spendguard")
        .map(|p| p.data_local_dir().to_path_buf())
        .unwrap_or_else(|| config_dir().join("data"))
}

pub fn config_file_path() -> PathBuf {
    config_dir().join("config.toml")
}

pub fn db_path() -> PathBuf {
    data_dir().join("spendguard.db")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_file_under_config_dir() {
        let path = config_file_path();
        assert!(path.starts_with(config_dir()));
        assert!(path.ends_with("config.toml"));
    }

    #[test]
    fn test_db_under_data_dir() {
        assert!(db_path().ends_with("spendguard.db"));
    }
}
