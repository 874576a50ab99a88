//! Configuration loading and management.

use std::fmt;
use std::path::{Path, PathBuf};

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

/// Application configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct Config {
    /// Path to the local database file.
    pub database_path: PathBuf,

    /// Relay connection settings used by `punch sync`; command-line flags
    /// take precedence over these.
    #[serde(default)]
    pub relay: RelaySettings,
}

/// Relay credentials as stored in the config file.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct RelaySettings {
    pub login: Option<String>,
    pub password: Option<String>,
    pub hostname: Option<String>,
    pub port: Option<u16>,
    pub database_name: Option<String>,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("database_path", &self.database_path)
            .field("relay", &self.relay)
            .finish()
    }
}

impl fmt::Debug for RelaySettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelaySettings")
            .field("login", &self.login)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("hostname", &self.hostname)
            .field("port", &self.port)
            .field("database_name", &self.database_name)
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            database_path: home.join(".punch.db"),
            relay: RelaySettings::default(),
        }
    }
}

impl Config {
    /// Loads configuration, optionally from a specific file. Later layers
    /// override earlier ones: defaults, the default config file, the given
    /// file, then `PUNCH_`-prefixed environment variables.
    #[allow(clippy::result_large_err)]
    pub fn load_from(config_path: Option<&Path>) -> Result<Self, figment::Error> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        if let Some(config_dir) = dirs_config_path() {
            figment = figment.merge(Toml::file(config_dir.join("config.toml")));
        }

        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }

        figment = figment.merge(Env::prefixed("PUNCH_"));

        figment.extract()
    }
}

/// Returns the platform-specific config directory for punch.
fn dirs_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("punch"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn explicit_config_file_overrides_defaults() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("config.toml");
        fs::write(
            &path,
            r#"
                database_path = "/tmp/elsewhere.db"

                [relay]
                login = "tracker"
                hostname = "relay.example.net"
                port = 5432
                database_name = "punch"
            "#,
        )
        .unwrap();

        let config = Config::load_from(Some(&path)).unwrap();
        assert_eq!(config.database_path, PathBuf::from("/tmp/elsewhere.db"));
        assert_eq!(config.relay.login.as_deref(), Some("tracker"));
        assert_eq!(config.relay.port, Some(5432));
        assert!(config.relay.password.is_none());
    }

    #[test]
    fn missing_config_file_keeps_defaults() {
        let temp = tempfile::tempdir().unwrap();
        let config = Config::load_from(Some(&temp.path().join("absent.toml"))).unwrap();
        assert!(config.database_path.ends_with(".punch.db"));
    }

    #[test]
    fn debug_output_redacts_the_relay_password() {
        let mut config = Config::default();
        config.relay.password = Some("hunter2".to_string());
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }
}
