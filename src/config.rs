//! Configuration types for the clamd client.

use crate::clamd::Endpoint;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Global settings.
    #[serde(default)]
    pub settings: Settings,

    /// ClamAV daemon configuration.
    #[serde(default)]
    pub clamd: ClamdConfig,

    /// Messages reported for rejected scans.
    #[serde(default)]
    pub messages: Messages,
}

/// Global settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Settings {
    /// Log malware detections.
    #[serde(default = "default_true")]
    pub log_detections: bool,

    /// Log clean scans.
    #[serde(default)]
    pub log_clean: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_detections: true,
            log_clean: false,
        }
    }
}

/// ClamAV daemon configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClamdConfig {
    /// Host running clamd.
    #[serde(default = "default_host")]
    pub host: String,

    /// TCP port clamd listens on (`TCPSocket` in clamd.conf).
    #[serde(default = "default_port")]
    pub port: u16,

    /// Path to the clamd Unix socket. Takes precedence over host/port.
    #[serde(default)]
    pub socket_path: Option<PathBuf>,

    /// Read timeout in milliseconds. Zero disables the timeout.
    #[serde(default = "default_timeout")]
    pub timeout_ms: i64,

    /// Maximum chunk size streamed to clamd.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

impl Default for ClamdConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            socket_path: None,
            timeout_ms: default_timeout(),
            chunk_size: default_chunk_size(),
        }
    }
}

impl ClamdConfig {
    /// Where to connect.
    pub fn endpoint(&self) -> Endpoint {
        #[cfg(unix)]
        {
            if let Some(path) = &self.socket_path {
                return Endpoint::Unix(path.clone());
            }
        }
        Endpoint::Tcp {
            host: self.host.clone(),
            port: self.port,
        }
    }

    /// Configured timeout, `None` when disabled.
    ///
    /// A negative value is invalid and also yields `None`; use
    /// [`ClamdConfig::validate`] to reject it.
    pub fn timeout(&self) -> Option<Duration> {
        match u64::try_from(self.timeout_ms) {
            Ok(0) | Err(_) => None,
            Ok(ms) => Some(Duration::from_millis(ms)),
        }
    }

    /// Check the connection parameters.
    pub fn validate(&self) -> Result<(), String> {
        if self.timeout_ms < 0 {
            return Err(format!(
                "clamd.timeout_ms must not be negative (got {})",
                self.timeout_ms
            ));
        }

        if self.chunk_size == 0 {
            return Err("clamd.chunk_size must be greater than 0".to_string());
        }

        if u32::try_from(self.chunk_size).is_err() {
            return Err(format!(
                "clamd.chunk_size must fit in 32 bits (got {})",
                self.chunk_size
            ));
        }

        if self.socket_path.is_none() && self.host.trim().is_empty() {
            return Err("clamd.host must not be empty".to_string());
        }

        #[cfg(not(unix))]
        {
            if self.socket_path.is_some() {
                return Err("clamd.socket_path is only supported on Unix".to_string());
            }
        }

        Ok(())
    }
}

/// Messages reported when a scan is rejected.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Messages {
    /// The scan could not be completed.
    #[serde(default = "default_failed_message")]
    pub failed: String,

    /// The data is suspected to contain a virus.
    #[serde(default = "default_virus_message")]
    pub virus: String,
}

impl Default for Messages {
    fn default() -> Self {
        Self {
            failed: default_failed_message(),
            virus: default_virus_message(),
        }
    }
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    3310
}

fn default_timeout() -> i64 {
    30000 // 30 seconds
}

fn default_chunk_size() -> usize {
    65536 // 64KB
}

fn default_failed_message() -> String {
    "Failed to scan the file".to_string()
}

fn default_virus_message() -> String {
    "Suspected file, the file may contain a virus".to_string()
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let expanded = expand_env_vars(&content)?;
        let config: Config = serde_yaml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.clamd.validate().map_err(anyhow::Error::msg)?;

        if self.messages.failed.is_empty() {
            anyhow::bail!("messages.failed must not be empty");
        }

        if self.messages.virus.is_empty() {
            anyhow::bail!("messages.virus must not be empty");
        }

        Ok(())
    }

    /// Generate example configuration YAML.
    pub fn example() -> String {
        r#"# clamd client configuration

settings:
  log_detections: true
  log_clean: false

# ClamAV daemon connection
clamd:
  host: "localhost"
  port: 3310
  # socket_path: "/var/run/clamav/clamd.ctl"   # use a Unix socket instead of TCP
  timeout_ms: 30000            # 0 disables the timeout
  chunk_size: 65536            # must stay below clamd's StreamMaxLength

# Messages reported for rejected scans
messages:
  failed: "Failed to scan the file"
  virus: "Suspected file, the file may contain a virus"
"#
        .to_string()
    }
}

/// Expand environment variables in the format ${VAR_NAME}.
fn expand_env_vars(content: &str) -> anyhow::Result<String> {
    let re = regex::Regex::new(r"\$\{([^}]+)\}")?;
    let expanded = re.replace_all(content, |cap: &regex::Captures<'_>| {
        std::env::var(&cap[1]).unwrap_or_default()
    });
    Ok(expanded.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert!(settings.log_detections);
        assert!(!settings.log_clean);
    }

    #[test]
    fn test_default_clamd_config() {
        let clamd = ClamdConfig::default();
        assert_eq!(clamd.host, "localhost");
        assert_eq!(clamd.port, 3310);
        assert!(clamd.socket_path.is_none());
        assert_eq!(clamd.timeout_ms, 30000);
        assert_eq!(clamd.chunk_size, 65536);
        assert_eq!(clamd.timeout(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_zero_timeout_disables_timeout() {
        let clamd = ClamdConfig {
            timeout_ms: 0,
            ..ClamdConfig::default()
        };
        assert_eq!(clamd.timeout(), None);
        assert!(clamd.validate().is_ok());
    }

    #[test]
    fn test_validate_negative_timeout() {
        let clamd = ClamdConfig {
            timeout_ms: -1,
            ..ClamdConfig::default()
        };
        let err = clamd.validate().unwrap_err();
        assert!(err.contains("timeout_ms"));
    }

    #[test]
    fn test_validate_zero_chunk_size() {
        let config = Config {
            clamd: ClamdConfig {
                chunk_size: 0,
                ..ClamdConfig::default()
            },
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_empty_host() {
        let clamd = ClamdConfig {
            host: "  ".to_string(),
            ..ClamdConfig::default()
        };
        assert!(clamd.validate().is_err());
    }

    #[test]
    fn test_endpoint_tcp() {
        let clamd = ClamdConfig {
            host: "clamav".to_string(),
            port: 3311,
            ..ClamdConfig::default()
        };
        assert_eq!(
            clamd.endpoint(),
            Endpoint::Tcp {
                host: "clamav".to_string(),
                port: 3311
            }
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_endpoint_unix_takes_precedence() {
        let clamd = ClamdConfig {
            socket_path: Some(PathBuf::from("/var/run/clamav/clamd.ctl")),
            ..ClamdConfig::default()
        };
        assert_eq!(
            clamd.endpoint(),
            Endpoint::Unix(PathBuf::from("/var/run/clamav/clamd.ctl"))
        );
    }

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("CLAMD_CLIENT_TEST_HOST", "clamav.internal");
        let input = "host: \"${CLAMD_CLIENT_TEST_HOST}\"";
        let result = expand_env_vars(input).unwrap();
        assert_eq!(result, "host: \"clamav.internal\"");
        std::env::remove_var("CLAMD_CLIENT_TEST_HOST");
    }

    #[test]
    fn test_expand_missing_env_var_is_empty() {
        let result = expand_env_vars("port: ${CLAMD_CLIENT_TEST_UNSET_VAR}").unwrap();
        assert_eq!(result, "port: ");
    }

    #[test]
    fn test_parse_config_yaml() {
        let yaml = r#"
settings:
  log_clean: true

clamd:
  host: "10.0.0.5"
  port: 3311
  timeout_ms: 10000
  chunk_size: 2048

messages:
  virus: "Rejected"
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.settings.log_clean);
        assert!(config.settings.log_detections);
        assert_eq!(config.clamd.host, "10.0.0.5");
        assert_eq!(config.clamd.port, 3311);
        assert_eq!(config.clamd.timeout_ms, 10000);
        assert_eq!(config.clamd.chunk_size, 2048);
        assert_eq!(config.messages.virus, "Rejected");
        assert_eq!(config.messages.failed, default_failed_message());
    }

    #[test]
    fn test_example_config_parses_and_validates() {
        let config: Config = serde_yaml::from_str(&Config::example()).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.clamd.port, 3310);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "clamd:\n  port: 4000\n  timeout_ms: 0\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.clamd.port, 4000);
        assert_eq!(config.clamd.timeout(), None);
    }

    #[test]
    fn test_load_rejects_negative_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "clamd:\n  timeout_ms: -5\n").unwrap();

        assert!(Config::load(&path).is_err());
    }
}
