//! Initialize the configuration directory: create ~/.relay, a default config and the state directory.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::config;

/// Default config written by `relay init`: every section at its defaults, channels off.
const DEFAULT_CONFIG: &str = r#"{
  "gateway": { "port": 15151, "bind": "127.0.0.1" },
  "dispatch": { "queueCapacity": 1000, "workersPerChannel": 4 },
  "pipeline": {},
  "channels": { "webhook": { "enabled": false } }
}
"#;

/// Create the config directory and default files if they do not exist.
/// - Creates the config directory (parent of config file path).
/// - Writes `config.json` with the defaults if missing.
/// - Creates the `state` subdirectory used by persisted adapter data.
pub fn init_config_dir(config_path: &Path) -> Result<PathBuf> {
    let config_dir = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(config_dir)
        .with_context(|| format!("creating config directory {}", config_dir.display()))?;

    if !config_path.exists() {
        std::fs::write(config_path, DEFAULT_CONFIG)
            .with_context(|| format!("writing default config to {}", config_path.display()))?;
        log::info!("created default config at {}", config_path.display());
    } else {
        log::debug!("config already exists at {}, skipping", config_path.display());
    }

    let state_dir = config::resolve_state_dir(config_path);
    if !state_dir.exists() {
        std::fs::create_dir_all(&state_dir)
            .with_context(|| format!("creating state directory {}", state_dir.display()))?;
        log::info!("created state directory at {}", state_dir.display());
    }

    Ok(config_dir.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_config_and_state_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay").join("config.json");
        let created = init_config_dir(&path).unwrap();
        assert_eq!(created, dir.path().join("relay"));
        assert!(dir.path().join("relay").join("state").is_dir());

        let (config, _) = config::load_config(Some(path)).unwrap();
        assert_eq!(config.gateway.port, 15151);
        assert!(!config.channels.webhook.enabled);
    }

    #[test]
    fn existing_config_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"gateway":{"port":1}}"#).unwrap();
        init_config_dir(&path).unwrap();
        let (config, _) = config::load_config(Some(path)).unwrap();
        assert_eq!(config.gateway.port, 1);
    }
}
