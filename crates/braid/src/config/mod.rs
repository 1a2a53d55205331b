use error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::net::IpAddr;
use std::path::Path;
use std::path::PathBuf;

use braid_core::netif::{NetworkHandle, TransportKind};
use braid_core::session::{DEFAULT_LOCAL_PORT, DEFAULT_SERVER_PORT, SelectorConfig};

pub mod error;

use error::Result;

const CONFIG_FILE_NAME: &str = "braid.toml";

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub source: SourceConfig,
    pub scheduler: SchedulerConfig,
    pub links: Vec<LinkEntry>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    /// FQDN or literal address of the aggregation server.
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SourceConfig {
    /// UDP port the local SRT source sends into.
    pub listen_port: u16,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SchedulerConfig {
    pub stickiness: bool,
    pub quality: bool,
    pub network_priority: bool,
    pub exploration: bool,
    /// Score links by window alone, ignoring every other signal.
    pub classic: bool,
    pub min_switch_interval_ms: u64,
}

/// One bonded interface: a stable name, the address to bind, and the
/// transport kind ("wifi", "ethernet", "cellular", "unknown").
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LinkEntry {
    pub name: String,
    pub local_addr: IpAddr,
    pub kind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_SERVER_PORT,
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            listen_port: DEFAULT_LOCAL_PORT,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let defaults = SelectorConfig::default();
        Self {
            stickiness: defaults.stickiness,
            quality: defaults.quality,
            network_priority: defaults.priority,
            exploration: defaults.exploration,
            classic: defaults.classic,
            min_switch_interval_ms: defaults.min_switch_interval_ms,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            source: SourceConfig::default(),
            scheduler: SchedulerConfig::default(),
            links: Vec::new(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.server.host.trim().is_empty() {
            return Err(ConfigError::Validation {
                reason: "Server host cannot be empty.".to_string(),
            });
        }

        if self.server.port == 0 {
            return Err(ConfigError::Validation {
                reason: "Server port must be in 1..=65535.".to_string(),
            });
        }

        if self.source.listen_port == 0 {
            return Err(ConfigError::Validation {
                reason: "Source listen port must be in 1..=65535.".to_string(),
            });
        }

        for link in &self.links {
            if link.name.trim().is_empty() {
                return Err(ConfigError::Validation {
                    reason: "Link names cannot be empty.".to_string(),
                });
            }
            if link.kind.parse::<TransportKind>().is_err() {
                return Err(ConfigError::Validation {
                    reason: format!(
                        "Link '{}' has unknown kind '{}'. Expected wifi, ethernet, cellular or unknown.",
                        link.name, link.kind
                    ),
                });
            }
        }

        let mut names: Vec<&str> = self.links.iter().map(|l| l.name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        if names.len() != self.links.len() {
            return Err(ConfigError::Validation {
                reason: "Link names must be unique.".to_string(),
            });
        }

        Ok(())
    }

    /// Selector toggles in the engine's terms.
    pub fn selector(&self) -> SelectorConfig {
        SelectorConfig {
            stickiness: self.scheduler.stickiness,
            quality: self.scheduler.quality,
            priority: self.scheduler.network_priority,
            exploration: self.scheduler.exploration,
            classic: self.scheduler.classic,
            min_switch_interval_ms: self.scheduler.min_switch_interval_ms,
        }
    }

    /// The configured interfaces as provider handles. Call after
    /// `validate`.
    pub fn handles(&self) -> Vec<NetworkHandle> {
        self.links
            .iter()
            .map(|link| NetworkHandle {
                name: link.name.clone(),
                local_addr: link.local_addr,
                kind: link.kind.parse().unwrap_or(TransportKind::Unknown),
            })
            .collect()
    }
}

pub fn handle() -> Result<Config> {
    let config_path = PathBuf::from(CONFIG_FILE_NAME);
    if config_path.exists() {
        let config_content = fs::read_to_string(&config_path).map_err(|source| ConfigError::Io {
            path: config_path.display().to_string(),
            source,
        })?;
        let config: Config =
            toml::from_str(&config_content).map_err(|source| ConfigError::TomlDeserialization {
                path: config_path.display().to_string(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    } else {
        let config = Config::default();
        save(&config, &config_path)?;
        Ok(config)
    }
}

fn save(config: &Config, path: &Path) -> Result<()> {
    let config_content =
        toml::to_string_pretty(config).map_err(|source| ConfigError::TomlSerialization {
            path: path.display().to_string(),
            source,
        })?;
    let mut file = fs::File::create(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    file.write_all(config_content.as_bytes())
        .map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass_validation_and_round_trip() {
        let config = Config::default();
        config.validate().unwrap();

        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        parsed.validate().unwrap();
        assert_eq!(parsed.server.port, DEFAULT_SERVER_PORT);
        assert_eq!(parsed.source.listen_port, DEFAULT_LOCAL_PORT);
    }

    #[test]
    fn partial_files_fill_in_defaults() {
        let parsed: Config = toml::from_str(
            r#"
            [server]
            host = "relay.example.net"
            "#,
        )
        .unwrap();
        assert_eq!(parsed.server.host, "relay.example.net");
        assert_eq!(parsed.server.port, DEFAULT_SERVER_PORT);
        assert!(parsed.scheduler.stickiness);
    }

    #[test]
    fn link_entries_parse_and_convert() {
        let parsed: Config = toml::from_str(
            r#"
            [[links]]
            name = "wlan0"
            local_addr = "192.168.1.7"
            kind = "wifi"

            [[links]]
            name = "rmnet0"
            local_addr = "10.20.0.3"
            kind = "cellular"
            "#,
        )
        .unwrap();
        parsed.validate().unwrap();

        let handles = parsed.handles();
        assert_eq!(handles.len(), 2);
        assert_eq!(handles[0].kind, TransportKind::Wifi);
        assert_eq!(handles[1].kind, TransportKind::Cellular);
    }

    #[test]
    fn validation_rejects_bad_input() {
        let mut config = Config::default();
        config.server.host = "  ".into();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.links.push(LinkEntry {
            name: "wlan0".into(),
            local_addr: "127.0.0.1".parse().unwrap(),
            kind: "zeppelin".into(),
        });
        assert!(config.validate().is_err());

        let mut config = Config::default();
        for _ in 0..2 {
            config.links.push(LinkEntry {
                name: "wlan0".into(),
                local_addr: "127.0.0.1".parse().unwrap(),
                kind: "wifi".into(),
            });
        }
        assert!(config.validate().is_err());
    }
}
