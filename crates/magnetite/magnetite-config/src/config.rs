use serde::Deserialize;
use std::path::Path;

#[derive(Deserialize, Debug, Clone)]
pub struct MagnetiteConfig {
    #[serde(default = "defaults::port")]
    pub port: u16,
    #[serde(default = "defaults::num_symbols")]
    pub num_symbols: usize,
    #[serde(default = "defaults::tick_rate")]
    pub tick_rate: u32,
    /// "neutral", "bullish"/"bull", or "bearish"/"bear".
    #[serde(default = "defaults::market")]
    pub market: String,
    #[serde(default)]
    pub fault_injection: bool,
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
    pub fn port() -> u16 {
        9876
    }

    pub fn num_symbols() -> usize {
        100
    }

    pub fn tick_rate() -> u32 {
        100_000
    }

    pub fn market() -> String {
        "neutral".into()
    }

    pub fn log_level() -> String {
        "info".into()
    }
}

impl Default for MagnetiteConfig {
    fn default() -> Self {
        Self {
            port: defaults::port(),
            num_symbols: defaults::num_symbols(),
            tick_rate: defaults::tick_rate(),
            market: defaults::market(),
            fault_injection: false,
            log_level: defaults::log_level(),
        }
    }
}

impl MagnetiteConfig {
    pub fn load(path: impl AsRef<Path> + ToString) -> Result<Self, ConfigError> {
        let toml_to_str = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        let config: MagnetiteConfig = toml::from_str(&toml_to_str)?;
        Ok(config)
    }
}
