//! Service configuration
//!
//! Confgate itself is configured with a small TOML file; the configuration
//! documents submitted over the control API are a separate concern (see
//! `document`). The file is optional: every setting has a default.

use serde::Deserialize;
use std::path::Path;

/// Global configuration for the control plane
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address for the control API (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Port for the control API (default: 6543)
    #[serde(default = "default_control_port")]
    pub control_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            control_port: default_control_port(),
        }
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_control_port() -> u16 {
    6543
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            anyhow::anyhow!(
                "Failed to read config file {}: {}",
                path.as_ref().display(),
                e
            )
        })?;
        let config: Config = toml::from_str(&contents)
            .map_err(|e| anyhow::anyhow!("Failed to parse config: {}", e))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.bind, "0.0.0.0");
        assert_eq!(config.server.control_port, 6543);
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
[server]
bind = "127.0.0.1"
control_port = 7000
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.bind, "127.0.0.1");
        assert_eq!(config.server.control_port, 7000);
    }

    #[test]
    fn test_parse_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.control_port, 6543);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server]\ncontrol_port = 9100").unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.server.control_port, 9100);
        assert_eq!(config.server.bind, "0.0.0.0");
    }

    #[test]
    fn test_load_missing_file_errors() {
        assert!(Config::load("/nonexistent/confgate.toml").is_err());
    }
}
