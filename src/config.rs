use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::router::Limits;
use crate::transport::{TransportConfig, DEFAULT_BAUD, DEFAULT_TCP_PORT};

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Tcp,
    Serial,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpSettings {
    pub host: String,
    pub port: u16,
}

impl Default for TcpSettings {
    fn default() -> Self {
        TcpSettings {
            host: "localhost".into(),
            port: DEFAULT_TCP_PORT,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialSettings {
    pub path: String,
    pub baud: u32,
}

impl Default for SerialSettings {
    fn default() -> Self {
        SerialSettings {
            path: "/dev/ttyUSB0".into(),
            baud: DEFAULT_BAUD,
        }
    }
}

/// The process configuration. Every field has a default, so an empty JSON
/// object (or no file at all) is a valid configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub transport: TransportKind,
    pub tcp: TcpSettings,
    pub serial: SerialSettings,
    pub max_sources: u16,
    pub max_destinations: u16,
    pub max_levels: u8,
    pub auto_connect: bool,
    pub client_listen: String,
    pub client_allowed_origin: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            transport: TransportKind::Tcp,
            tcp: TcpSettings::default(),
            serial: SerialSettings::default(),
            max_sources: 1024,
            max_destinations: 1024,
            max_levels: 16,
            auto_connect: true,
            client_listen: ":3001".into(),
            client_allowed_origin: "http://localhost:3000".into(),
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> io::Result<Config> {
        let data = std::fs::read_to_string(path)?;
        serde_json::from_str(&data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    pub fn transport_config(&self) -> TransportConfig {
        match self.transport {
            TransportKind::Tcp => TransportConfig::Tcp {
                host: self.tcp.host.clone(),
                port: self.tcp.port,
            },
            TransportKind::Serial => TransportConfig::Serial {
                path: self.serial.path.clone(),
                baud: self.serial.baud,
            },
        }
    }

    pub fn limits(&self) -> Limits {
        Limits {
            max_sources: self.max_sources,
            max_destinations: self.max_destinations,
            max_levels: self.max_levels,
        }
    }

    /// `client_listen` may be a bare `:port`, meaning every interface.
    pub fn listen_addr(&self) -> String {
        if self.client_listen.starts_with(':') {
            format!("0.0.0.0{}", self.client_listen)
        } else {
            self.client_listen.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_is_all_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.tcp.port, 2000);
        assert_eq!(config.serial.baud, 38_400);
        assert!(config.auto_connect);
    }

    #[test]
    fn partial_override() {
        let config: Config = serde_json::from_str(
            r#"{"transport":"serial","serial":{"path":"/dev/ttyS1"},"max_levels":4}"#,
        )
        .unwrap();
        assert_eq!(config.transport, TransportKind::Serial);
        assert_eq!(config.serial.path, "/dev/ttyS1");
        assert_eq!(config.serial.baud, 38_400);
        assert_eq!(config.max_levels, 4);
        assert_eq!(
            config.transport_config(),
            TransportConfig::Serial {
                path: "/dev/ttyS1".into(),
                baud: 38_400,
            }
        );
    }

    #[test]
    fn bare_port_listen_addr() {
        let config = Config::default();
        assert_eq!(config.listen_addr(), "0.0.0.0:3001");

        let explicit = Config {
            client_listen: "127.0.0.1:4000".into(),
            ..Config::default()
        };
        assert_eq!(explicit.listen_addr(), "127.0.0.1:4000");
    }
}
