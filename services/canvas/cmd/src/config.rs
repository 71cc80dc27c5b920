//! Configuration handling for the canvas server.
//!
//! Settings come from an optional YAML file and are then overridden by
//! environment variables. A missing or unreadable file falls back to the
//! defaults so the server can always start.

use anyhow::Result;
use canvas_session::ServerSettings;
use canvas_wire::DEFAULT_MAX_FRAME_SIZE;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Canvas server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanvasConfig {
    /// TCP port clients connect to
    pub port: u16,
    /// Seconds of silence before a connection is closed
    pub idle_timeout_secs: u64,
    /// Seconds between connected-session reports
    pub status_interval_secs: u64,
    /// Largest accepted frame payload in bytes
    pub max_frame_size: usize,
    /// User name to password
    pub auth: HashMap<String, String>,
}

impl Default for CanvasConfig {
    fn default() -> Self {
        Self {
            port: 12345,
            idle_timeout_secs: 120,
            status_interval_secs: 30,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            auth: HashMap::new(),
        }
    }
}

/// Root configuration structure (matches the YAML structure)
#[derive(Debug, Deserialize)]
struct RootConfig {
    server: Option<ServerSection>,
    auth: Option<HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
struct ServerSection {
    port: Option<u16>,
    idle_timeout_secs: Option<u64>,
    status_interval_secs: Option<u64>,
    max_frame_size: Option<usize>,
}

impl CanvasConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let mut config = Self::default();

        match std::fs::read_to_string(&config_path) {
            Ok(content) => match serde_yaml::from_str::<RootConfig>(&content) {
                Ok(root_config) => {
                    config.apply_root_config(root_config);
                    info!("Loaded configuration from {:?}", config_path.as_ref());
                }
                Err(e) => warn!(
                    "Failed to parse config file {:?}: {}; using defaults",
                    config_path.as_ref(),
                    e
                ),
            },
            Err(_) => warn!("Config file {:?} not found, using defaults", config_path.as_ref()),
        }

        config.apply_environment_overrides();

        info!(
            "Final canvas configuration: port={}, idle_timeout={}s, status_interval={}s, users={}",
            config.port,
            config.idle_timeout_secs,
            config.status_interval_secs,
            config.auth.len()
        );

        Ok(config)
    }

    /// Idle timeout as a duration
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Status report interval as a duration
    pub fn status_interval(&self) -> Duration {
        Duration::from_secs(self.status_interval_secs)
    }

    /// Settings snapshot handed to sessions
    pub fn server_settings(&self) -> ServerSettings {
        ServerSettings::with_credentials(self.auth.clone())
    }

    fn apply_root_config(&mut self, root_config: RootConfig) {
        if let Some(server) = root_config.server {
            if let Some(port) = server.port {
                self.port = port;
            }
            if let Some(secs) = server.idle_timeout_secs {
                self.idle_timeout_secs = secs;
            }
            if let Some(secs) = server.status_interval_secs {
                self.status_interval_secs = secs;
            }
            if let Some(size) = server.max_frame_size {
                self.max_frame_size = size;
            }
        }

        if let Some(auth) = root_config.auth {
            self.auth = auth;
        }
    }

    fn apply_environment_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("CANVAS_PORT") {
            match value.parse::<u16>() {
                Ok(port) => {
                    self.port = port;
                    info!("Port overridden by environment: {}", port);
                }
                Err(_) => warn!("Ignoring invalid CANVAS_PORT={:?}", value),
            }
        }

        if let Some(value) = lookup("CANVAS_IDLE_TIMEOUT_SECS") {
            match value.parse::<u64>() {
                Ok(secs) => {
                    self.idle_timeout_secs = secs;
                    info!("Idle timeout overridden by environment: {}s", secs);
                }
                Err(_) => warn!("Ignoring invalid CANVAS_IDLE_TIMEOUT_SECS={:?}", value),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = CanvasConfig::default();
        assert_eq!(config.port, 12345);
        assert_eq!(config.idle_timeout(), Duration::from_secs(120));
        assert_eq!(config.max_frame_size, DEFAULT_MAX_FRAME_SIZE);
        assert!(config.auth.is_empty());
    }

    #[test]
    fn test_load_from_file() {
        let yaml_content = r#"
server:
  port: 23456
  status_interval_secs: 5

auth:
  alice: secret
  bob: hunter2
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(yaml_content.as_bytes()).unwrap();

        let config = CanvasConfig::load_from_file(temp_file.path()).unwrap();

        assert_eq!(config.port, 23456);
        assert_eq!(config.status_interval(), Duration::from_secs(5));
        assert_eq!(config.idle_timeout_secs, 120);
        assert!(config.server_settings().check_credentials("bob", "hunter2"));
        assert!(!config.server_settings().check_credentials("bob", "secret"));
    }

    #[test]
    fn test_invalid_file_falls_back_to_defaults() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"server: [not, a, map").unwrap();

        let config = CanvasConfig::load_from_file(temp_file.path()).unwrap();
        assert_eq!(config.port, CanvasConfig::default().port);
    }

    #[test]
    fn test_environment_overrides() {
        let env = HashMap::from([
            ("CANVAS_PORT", "4000"),
            ("CANVAS_IDLE_TIMEOUT_SECS", "not-a-number"),
        ]);

        let mut config = CanvasConfig::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.port, 4000);
        assert_eq!(config.idle_timeout_secs, 120);
    }
}
