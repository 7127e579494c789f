use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Deserialize)]
pub struct ConfigFile {
    pub server: ServerConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub web: WebConfig,
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Deserialize)]
pub struct RelayConfig {
    /// Upper bound for one forward to a tracking server
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub user_agent: Option<String>,
}

impl RelayConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            user_agent: None,
        }
    }
}

fn default_timeout_secs() -> u64 {
    beacon_core::relay::DEFAULT_RELAY_TIMEOUT.as_secs()
}

#[derive(Debug, Default, Deserialize)]
pub struct WebConfig {
    /// Directory with index.html, app.js, sw.js and pkg/
    #[serde(default)]
    pub static_dir: Option<String>,
}

impl ConfigFile {
    pub fn load(path: &str) -> Result<Self> {
        let content =
            fs::read_to_string(path).context(format!("Failed to read config file: {}", path))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse config file")
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.host.trim().is_empty() {
            anyhow::bail!("[server] host must not be empty");
        }
        if self.relay.timeout_secs == 0 {
            anyhow::bail!("[relay] timeout_secs must be at least 1");
        }
        if let Some(dir) = &self.web.static_dir {
            if !Path::new(dir).is_dir() {
                anyhow::bail!("[web] static_dir '{}' is not a directory", dir);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = ConfigFile::parse(
            r#"
[server]
host = "127.0.0.1"
port = 3000
"#,
        )
        .unwrap();

        config.validate().unwrap();
        assert_eq!(config.server.bind_addr(), "127.0.0.1:3000");
        assert_eq!(config.relay.timeout(), Duration::from_secs(30));
        assert!(config.relay.user_agent.is_none());
        assert!(config.web.static_dir.is_none());
    }

    #[test]
    fn test_full_config() {
        let config = ConfigFile::parse(
            r#"
[server]
host = "0.0.0.0"
port = 8080

[relay]
timeout_secs = 5
user_agent = "beacon-test"

[web]
static_dir = "."
"#,
        )
        .unwrap();

        config.validate().unwrap();
        assert_eq!(config.relay.timeout_secs, 5);
        assert_eq!(config.relay.user_agent.as_deref(), Some("beacon-test"));
    }

    #[test]
    fn test_validation_errors() {
        let zero_timeout = ConfigFile::parse(
            r#"
[server]
host = "0.0.0.0"
port = 3000

[relay]
timeout_secs = 0
"#,
        )
        .unwrap();
        assert!(zero_timeout.validate().is_err());

        let missing_dir = ConfigFile::parse(
            r#"
[server]
host = "0.0.0.0"
port = 3000

[web]
static_dir = "/definitely/not/here"
"#,
        )
        .unwrap();
        assert!(missing_dir.validate().is_err());

        assert!(ConfigFile::parse("[relay]\ntimeout_secs = 3\n").is_err());
    }
}
