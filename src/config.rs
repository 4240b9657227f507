//! Relay configuration
//!
//! The process front end hands `serve` a [`RelayConfig`]; everything else
//! (key material, certificates, the descriptor) is derived from it plus the
//! data directory contents.

use crate::error::{RelayError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Longest nickname the directory spec permits.
const MAX_NICKNAME_LEN: usize = 19;

/// Relay configuration.
///
/// Unknown fields are rejected at deserialization time so a typo in the
/// front end's config file fails loudly instead of being ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RelayConfig {
    /// Relay nickname (1-19 alphanumeric characters)
    pub nickname: String,

    /// OR port to listen on
    pub or_port: u16,

    /// Contact line published in the descriptor
    #[serde(default)]
    pub contact: Option<String>,

    /// Platform string published in the descriptor
    #[serde(default = "default_platform")]
    pub platform: String,

    /// Directory holding long-term keys
    pub data_dir: PathBuf,
}

fn default_platform() -> String {
    format!("tor-relay {} on {}", env!("CARGO_PKG_VERSION"), std::env::consts::OS)
}

impl RelayConfig {
    /// Parse a configuration from its JSON representation.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: RelayConfig =
            serde_json::from_str(json).map_err(|e| RelayError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the field constraints the wire formats assume.
    pub fn validate(&self) -> Result<()> {
        if self.nickname.is_empty() || self.nickname.len() > MAX_NICKNAME_LEN {
            return Err(RelayError::Config(format!(
                "nickname must be 1-{} characters, got {}",
                MAX_NICKNAME_LEN,
                self.nickname.len()
            )));
        }
        if !self.nickname.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(RelayError::Config(format!(
                "nickname {:?} contains non-alphanumeric characters",
                self.nickname
            )));
        }
        if self.or_port == 0 {
            return Err(RelayError::Config("or_port must be nonzero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_json() -> String {
        r#"{"nickname": "testrelay", "or_port": 9111, "data_dir": "/tmp/relay"}"#.to_string()
    }

    #[test]
    fn test_parse_minimal_config() {
        let config = RelayConfig::from_json(&base_json()).unwrap();
        assert_eq!(config.nickname, "testrelay");
        assert_eq!(config.or_port, 9111);
        assert!(config.contact.is_none());
        assert!(config.platform.starts_with("tor-relay"));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let json = r#"{"nickname": "n", "or_port": 1, "data_dir": "/tmp", "dir_port": 9030}"#;
        let err = RelayConfig::from_json(json).unwrap_err();
        assert!(matches!(err, RelayError::Config(_)));
    }

    #[test]
    fn test_bad_nickname_rejected() {
        let json = r#"{"nickname": "has spaces", "or_port": 1, "data_dir": "/tmp"}"#;
        assert!(RelayConfig::from_json(json).is_err());

        let json = r#"{"nickname": "", "or_port": 1, "data_dir": "/tmp"}"#;
        assert!(RelayConfig::from_json(json).is_err());

        let json =
            r#"{"nickname": "abcdefghijklmnopqrstu", "or_port": 1, "data_dir": "/tmp"}"#;
        assert!(RelayConfig::from_json(json).is_err());
    }

    #[test]
    fn test_zero_port_rejected() {
        let json = r#"{"nickname": "ok", "or_port": 0, "data_dir": "/tmp"}"#;
        assert!(RelayConfig::from_json(json).is_err());
    }
}
