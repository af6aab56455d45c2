//! The on-disk security record.

use std::net::IpAddr;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// How strictly requests are admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AccessMode {
    /// Localhost only, no key required.
    #[default]
    Lax,
    /// A valid api key admits any origin.
    Relaxed,
    /// A valid api key and an allowlisted source address are both required.
    Strict,
}

/// Immutable security configuration consumed at HTTP admission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    #[serde(default)]
    pub mode: AccessMode,
    #[serde(default)]
    pub api_keys: Vec<String>,
    #[serde(default)]
    pub allowed_ips: Vec<IpAddr>,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Settings for the code-indexing subsystem; opaque to admission.
    #[serde(default)]
    pub index: serde_json::Value,
}

fn default_port() -> u16 {
    8642
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            mode: AccessMode::default(),
            api_keys: Vec::new(),
            allowed_ips: Vec::new(),
            port: default_port(),
            index: serde_json::Value::Null,
        }
    }
}

/// Load the security record written by the setup wizard.
pub fn load_security_config(path: &Path) -> std::io::Result<SecurityConfig> {
    let bytes = std::fs::read(path)?;
    serde_json::from_slice(&bytes)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SecurityConfig::default();
        assert_eq!(config.mode, AccessMode::Lax);
        assert_eq!(config.port, 8642);
        assert!(config.api_keys.is_empty());
    }

    #[test]
    fn test_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("security.json");
        std::fs::write(
            &path,
            r#"{"mode":"strict","api_keys":["k1"],"allowed_ips":["10.0.0.7"],"port":9000}"#,
        )
        .unwrap();
        let config = load_security_config(&path).unwrap();
        assert_eq!(config.mode, AccessMode::Strict);
        assert_eq!(config.api_keys, ["k1"]);
        assert_eq!(config.allowed_ips, ["10.0.0.7".parse::<IpAddr>().unwrap()]);
        assert_eq!(config.port, 9000);
    }

    #[test]
    fn test_load_rejects_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("security.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(load_security_config(&path).is_err());
    }
}
