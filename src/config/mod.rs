//! Configuration management

use crate::proxy::Address;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Tor's SOCKS port
pub const TOR_PROXY: &str = "127.0.0.1:9050";

/// Tor Browser's SOCKS port
pub const TOR_BROWSER_PROXY: &str = "127.0.0.1:9150";

/// Control endpoint of the tunnel service
pub const DEFAULT_REMOTE: &str = "tunnel.ngrok.com:443";

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Tunnel configuration
    #[serde(default)]
    pub tunnel: TunnelConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> crate::Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("Failed to write config: {}", e)))
    }

    /// Check addresses before anything is dialed
    pub fn validate(&self) -> crate::Result<()> {
        if self.tunnel.proxies.is_empty() {
            return Err(crate::Error::Config("No proxy candidates configured".to_string()));
        }
        for proxy in &self.tunnel.proxies {
            Address::parse(proxy)
                .map_err(|e| crate::Error::Config(format!("Bad proxy address: {}", e)))?;
        }
        self.tunnel.remote_address()?;
        if self.tunnel.sni()?.is_empty() {
            return Err(crate::Error::Config("Empty TLS server name".to_string()));
        }
        Ok(())
    }
}

/// Tunnel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// SOCKS5 proxies, tried in order
    pub proxies: Vec<String>,
    /// Remote control endpoint (host:port)
    pub remote: String,
    /// TLS server name (defaults to the remote host)
    pub sni: Option<String>,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            proxies: vec![TOR_PROXY.to_string(), TOR_BROWSER_PROXY.to_string()],
            remote: DEFAULT_REMOTE.to_string(),
            sni: None,
        }
    }
}

impl TunnelConfig {
    /// Parsed remote endpoint
    pub fn remote_address(&self) -> crate::Result<Address> {
        Address::parse(&self.remote)
            .map_err(|e| crate::Error::Config(format!("Bad remote address: {}", e)))
    }

    /// Server name for TLS and the auth request
    pub fn sni(&self) -> crate::Result<String> {
        match &self.sni {
            Some(sni) => Ok(sni.clone()),
            None => Ok(self.remote_address()?.host()),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error) or a filter directive
    pub level: String,
    /// Log format (pretty, json, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

/// Generate example configuration
pub fn generate_example_config() -> Config {
    Config {
        tunnel: TunnelConfig {
            sni: Some("tunnel.ngrok.com".to_string()),
            ..TunnelConfig::default()
        },
        logging: LoggingConfig::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.tunnel.proxies, vec![TOR_PROXY, TOR_BROWSER_PROXY]);
        assert_eq!(config.tunnel.remote, DEFAULT_REMOTE);
        assert_eq!(config.tunnel.sni().unwrap(), "tunnel.ngrok.com");
        assert_eq!(config.logging.level, "info");
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_file() {
        let config: Config = toml::from_str(
            r#"
            [tunnel]
            proxies = ["10.0.0.1:1080"]
            remote = "example.com:4443"
            "#,
        )
        .unwrap();

        assert_eq!(config.tunnel.proxies, vec!["10.0.0.1:1080"]);
        assert_eq!(config.tunnel.sni().unwrap(), "example.com");
        assert_eq!(config.logging.format, "pretty");
    }

    #[test]
    fn test_validate_rejects() {
        let mut config = Config::default();
        config.tunnel.proxies.clear();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.tunnel.proxies = vec!["localhost".to_string()];
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.tunnel.remote = "tunnel.ngrok.com".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ngtor.toml");

        let config = generate_example_config();
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.tunnel.proxies, config.tunnel.proxies);
        assert_eq!(loaded.tunnel.sni, Some("tunnel.ngrok.com".to_string()));
    }

    #[test]
    fn test_load_missing_file() {
        let result = Config::load("/nonexistent/ngtor.toml");
        assert!(matches!(result, Err(crate::Error::Config(_))));
    }
}
