//! Client configuration.
//!
//! Raw values (from the command line or a JSON file) are collected into
//! [`ClientConfig`] / [`DirectDialConfig`] and validated into the typed
//! configs the runtime uses. Validation happens before any socket is opened.

use fear_core::crypto::{KeyError, SessionKey};
use fear_core::protocol::{DEFAULT_PORT, MAX_NAME_LEN, MAX_ROOM_LEN};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::calls::DirectDial;
use crate::media::AudioTransportConfig;

pub const DEFAULT_DOWNLOAD_DIR: &str = "downloads";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid key: {0}")]
    Key(#[from] KeyError),
    #[error("{0} must not be empty")]
    Empty(&'static str),
    #[error("{field} is too long ({len} bytes, max {max})")]
    TooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },
    #[error("{0} port must not be 0")]
    ZeroPort(&'static str),
    #[error("could not read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not parse config file: {0}")]
    Json(#[from] serde_json::Error),
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

/// Unvalidated connection settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub room: String,
    pub name: String,
    /// Room key, URL-safe base64 of 32 bytes.
    pub key: String,
    #[serde(default)]
    pub download_dir: Option<PathBuf>,
    #[serde(default)]
    pub udp_port: Option<u16>,
}

/// Validated settings for one control session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub host: String,
    pub port: u16,
    pub room: String,
    pub name: String,
    pub key: SessionKey,
    pub download_dir: PathBuf,
    pub udp_port: Option<u16>,
    pub transport: AudioTransportConfig,
}

fn check_field(field: &'static str, value: &str, max: usize) -> Result<(), ConfigError> {
    if value.is_empty() {
        return Err(ConfigError::Empty(field));
    }
    if value.len() > max {
        return Err(ConfigError::TooLong {
            field,
            len: value.len(),
            max,
        });
    }
    Ok(())
}

impl ClientConfig {
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn validate(self) -> Result<SessionConfig, ConfigError> {
        check_field("host", &self.host, usize::MAX)?;
        check_field("room", &self.room, MAX_ROOM_LEN)?;
        check_field("name", &self.name, MAX_NAME_LEN)?;
        if self.port == 0 {
            return Err(ConfigError::ZeroPort("server"));
        }
        let key = SessionKey::from_base64(&self.key)?;
        Ok(SessionConfig {
            host: self.host,
            port: self.port,
            room: self.room,
            name: self.name,
            key,
            download_dir: self
                .download_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DOWNLOAD_DIR)),
            udp_port: self.udp_port.filter(|p| *p != 0),
            transport: AudioTransportConfig::default(),
        })
    }
}

/// Unvalidated direct-dial settings.
#[derive(Debug, Clone, Deserialize)]
pub struct DirectDialConfig {
    pub server_ip: String,
    pub server_port: u16,
    #[serde(default)]
    pub local_port: Option<u16>,
    /// 64 hex characters.
    pub key_hex: String,
}

impl DirectDialConfig {
    pub fn validate(self) -> Result<DirectDial, ConfigError> {
        check_field("server address", &self.server_ip, usize::MAX)?;
        if self.server_port == 0 {
            return Err(ConfigError::ZeroPort("server"));
        }
        let key = SessionKey::from_hex(&self.key_hex)?;
        Ok(DirectDial {
            host: self.server_ip,
            port: self.server_port,
            local_port: self.local_port.filter(|p| *p != 0),
            key,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(key: String) -> ClientConfig {
        ClientConfig {
            host: "127.0.0.1".into(),
            port: 8888,
            room: "r1".into(),
            name: "alice".into(),
            key,
            download_dir: None,
            udp_port: Some(0),
        }
    }

    #[test]
    fn test_valid_client_config() {
        let key = SessionKey::generate();
        let config = client(key.to_base64()).validate().unwrap();
        assert_eq!(config.key, key);
        assert_eq!(config.download_dir, PathBuf::from("downloads"));
        assert_eq!(config.udp_port, None);
    }

    #[test]
    fn test_short_key_rejected() {
        let err = client("AAAAAAAAAAAAAAAAAAAAAA".into()).validate().unwrap_err();
        assert!(matches!(err, ConfigError::Key(KeyError::InvalidLength(16))));
    }

    #[test]
    fn test_empty_and_long_fields_rejected() {
        let key = SessionKey::generate().to_base64();
        let mut c = client(key.clone());
        c.name = String::new();
        assert!(matches!(c.validate(), Err(ConfigError::Empty("name"))));
        let mut c = client(key);
        c.room = "r".repeat(MAX_ROOM_LEN + 1);
        assert!(matches!(c.validate(), Err(ConfigError::TooLong { field: "room", .. })));
    }

    #[test]
    fn test_json_defaults() {
        let key = SessionKey::generate().to_base64();
        let json = format!(r#"{{"host":"h","room":"r","name":"n","key":"{key}"}}"#);
        let config: ClientConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config.port, DEFAULT_PORT);
        assert!(config.udp_port.is_none());
    }

    #[test]
    fn test_direct_dial_config() {
        let dial = DirectDialConfig {
            server_ip: "10.0.0.2".into(),
            server_port: 50000,
            local_port: Some(40000),
            key_hex: "ab".repeat(32),
        }
        .validate()
        .unwrap();
        assert_eq!(dial.port, 50000);
        assert_eq!(dial.local_port, Some(40000));
        assert_eq!(dial.key.as_bytes()[0], 0xAB);

        let err = DirectDialConfig {
            server_ip: "10.0.0.2".into(),
            server_port: 50000,
            local_port: None,
            key_hex: "ab".repeat(16),
        }
        .validate()
        .unwrap_err();
        assert!(matches!(err, ConfigError::Key(KeyError::InvalidLength(16))));
    }
}
