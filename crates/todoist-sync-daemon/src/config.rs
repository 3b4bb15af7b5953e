use std::path::{Path, PathBuf};
use todoist_sync_core::SyncSettings;
use tracing::info;

/// Default data directory, relative to the vault root.
pub const DEFAULT_DATA_DIR: &str = ".obsidian/plugins/todoist-sync";

pub const SETTINGS_FILE: &str = "settings.json";

/// Daemon configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Path to the Obsidian vault root directory
    pub vault_path: PathBuf,
    /// Todoist API token
    pub api_token: String,
    /// Where the journal, its backups and settings.json live
    pub data_dir: PathBuf,
}

impl DaemonConfig {
    /// Load configuration from environment variables.
    ///
    /// Required environment variables:
    /// - `OBSIDIAN_VAULT_PATH`: Path to the Obsidian vault root (supports ~ for home directory)
    /// - `TODOIST_API_TOKEN`: Todoist API token
    ///
    /// Optional:
    /// - `TODOIST_SYNC_DATA_DIR`: Data directory (default `<vault>/.obsidian/plugins/todoist-sync`)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env), reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let vault_path_str = lookup("OBSIDIAN_VAULT_PATH")
            .filter(|v| !v.trim().is_empty())
            .ok_or(ConfigError::MissingVaultPath)?;
        let vault_path = expand_tilde(&vault_path_str);

        let api_token = lookup("TODOIST_API_TOKEN")
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .ok_or(ConfigError::MissingApiToken)?;

        let data_dir = lookup("TODOIST_SYNC_DATA_DIR")
            .filter(|v| !v.trim().is_empty())
            .map(|dir| expand_tilde(&dir))
            .unwrap_or_else(|| vault_path.join(DEFAULT_DATA_DIR));

        Ok(Self {
            vault_path,
            api_token,
            data_dir,
        })
    }

    pub fn settings_path(&self) -> PathBuf {
        self.data_dir.join(SETTINGS_FILE)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.vault_path.is_dir() {
            return Err(ConfigError::VaultNotFound(self.vault_path.clone()));
        }
        Ok(())
    }

    /// Load `settings.json` from the data directory. A missing file yields
    /// the defaults; missing fields take their default values.
    pub fn load_settings(&self) -> Result<SyncSettings, ConfigError> {
        load_settings(&self.settings_path())
    }
}

pub fn load_settings(path: &Path) -> Result<SyncSettings, ConfigError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!("No settings file at {:?}, using defaults", path);
            return Ok(SyncSettings::default());
        }
        Err(e) => return Err(ConfigError::SettingsIo(path.to_path_buf(), e)),
    };
    serde_json::from_str(&contents).map_err(|e| ConfigError::InvalidSettings(path.to_path_buf(), e))
}

/// Expand ~ or ~/ prefix to the user's home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    if path == "~" {
        dirs::home_dir().unwrap_or_else(|| PathBuf::from("~"))
    } else if let Some(rest) = path.strip_prefix("~/") {
        dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| PathBuf::from(path))
    } else {
        PathBuf::from(path)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("OBSIDIAN_VAULT_PATH environment variable not set")]
    MissingVaultPath,

    #[error("TODOIST_API_TOKEN environment variable not set")]
    MissingApiToken,

    #[error("Vault directory {0:?} does not exist")]
    VaultNotFound(PathBuf),

    #[error("Failed to read settings {0:?}: {1}")]
    SettingsIo(PathBuf, #[source] std::io::Error),

    #[error("Invalid settings in {0:?}: {1}")]
    InvalidSettings(PathBuf, #[source] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_missing_token_is_an_error() {
        let result = DaemonConfig::from_lookup(lookup(&[("OBSIDIAN_VAULT_PATH", "/vault")]));
        assert!(matches!(result, Err(ConfigError::MissingApiToken)));

        let result = DaemonConfig::from_lookup(lookup(&[
            ("OBSIDIAN_VAULT_PATH", "/vault"),
            ("TODOIST_API_TOKEN", "  "),
        ]));
        assert!(matches!(result, Err(ConfigError::MissingApiToken)));
    }

    #[test]
    fn test_missing_vault_is_an_error() {
        let result = DaemonConfig::from_lookup(lookup(&[("TODOIST_API_TOKEN", "abc")]));
        assert!(matches!(result, Err(ConfigError::MissingVaultPath)));
    }

    #[test]
    fn test_default_data_dir_is_inside_vault() {
        let config = DaemonConfig::from_lookup(lookup(&[
            ("OBSIDIAN_VAULT_PATH", "/vault"),
            ("TODOIST_API_TOKEN", "abc"),
        ]))
        .unwrap();
        assert_eq!(
            config.data_dir,
            PathBuf::from("/vault/.obsidian/plugins/todoist-sync")
        );
        assert_eq!(
            config.settings_path(),
            PathBuf::from("/vault/.obsidian/plugins/todoist-sync/settings.json")
        );
    }

    #[test]
    fn test_explicit_data_dir_is_kept() {
        let config = DaemonConfig::from_lookup(lookup(&[
            ("OBSIDIAN_VAULT_PATH", "/vault"),
            ("TODOIST_API_TOKEN", "abc"),
            ("TODOIST_SYNC_DATA_DIR", "/var/lib/todoist-sync"),
        ]))
        .unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/todoist-sync"));
    }

    #[test]
    fn test_expand_tilde() {
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_tilde("~"), home);
            assert_eq!(expand_tilde("~/Notes"), home.join("Notes"));
        }
        assert_eq!(expand_tilde("/abs/path"), PathBuf::from("/abs/path"));
    }

    #[test]
    fn test_load_settings() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(SETTINGS_FILE);
        assert_eq!(load_settings(&path).unwrap(), SyncSettings::default());

        std::fs::write(&path, r#"{ "sync_interval_secs": 120 }"#).unwrap();
        let settings = load_settings(&path).unwrap();
        assert_eq!(settings.sync_interval_secs, 120);
        assert!(settings.add_completion_timestamp);

        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(
            load_settings(&path),
            Err(ConfigError::InvalidSettings(..))
        ));
    }
}
