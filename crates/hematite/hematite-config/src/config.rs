use serde::Deserialize;
use std::path::Path;

#[derive(Deserialize, Debug, Clone)]
pub struct HematiteConfig {
    #[serde(default = "defaults::host")]
    pub host: String,
    #[serde(default = "defaults::port")]
    pub port: u16,
    #[serde(default = "defaults::connect_timeout_ms")]
    pub connect_timeout_ms: u32,
    /// Symbol ids to subscribe to; empty means the full feed.
    #[serde(default)]
    pub subscribe: Vec<u16>,
    #[serde(default = "defaults::auto_reconnect")]
    pub auto_reconnect: bool,
    /// When set, the latency histogram is exported here on shutdown.
    #[serde(default)]
    pub latency_csv: Option<String>,
    #[serde(default = "defaults::log_level")]
    pub log_level: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read '{path}'")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config")]
    Parse(#[from] toml::de::Error),
}

mod defaults {
    pub fn host() -> String {
        "127.0.0.1".into()
    }

    pub fn port() -> u16 {
        9876
    }

    pub fn connect_timeout_ms() -> u32 {
        5000
    }

    pub fn auto_reconnect() -> bool {
        true
    }

    pub fn log_level() -> String {
        "info".into()
    }
}

impl Default for HematiteConfig {
    fn default() -> Self {
        Self {
            host: defaults::host(),
            port: defaults::port(),
            connect_timeout_ms: defaults::connect_timeout_ms(),
            subscribe: Vec::new(),
            auto_reconnect: defaults::auto_reconnect(),
            latency_csv: None,
            log_level: defaults::log_level(),
        }
    }
}

impl HematiteConfig {
    pub fn load(path: impl AsRef<Path> + ToString) -> Result<Self, ConfigError> {
        let toml_to_str = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        let config: HematiteConfig = toml::from_str(&toml_to_str)?;
        Ok(config)
    }
}
