use std::time::Duration;
use thiserror::Error;

pub const SAMPLE_INTERVAL_VAR: &str = "GPU_OVERLAY_SAMPLE_INTERVAL_MS";
pub const SELF_MEMORY_INTERVAL_VAR: &str = "GPU_OVERLAY_SELF_MEMORY_INTERVAL_MS";
pub const TITLE_BAR_DELAY_VAR: &str = "GPU_OVERLAY_TITLE_BAR_DELAY_SECS";
pub const ALT_MEMORY_VAR: &str = "GPU_OVERLAY_ALT_MEMORY";

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("{var}={value:?} is not a valid {expected}")]
    Invalid {
        var: &'static str,
        value: String,
        expected: &'static str,
    },
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    pub sample_interval: Duration,
    pub self_memory_interval: Duration,
    pub title_bar_delay: Duration,
    /// Whether `nvidia-smi` may be used as the preferred memory source.
    pub alternate_memory: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_secs(1),
            self_memory_interval: Duration::from_secs(2),
            title_bar_delay: Duration::from_secs(10),
            alternate_memory: true,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Builds a config from any variable lookup; unset variables keep defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let millis = |var: &'static str, default: Duration| -> Result<Duration, ConfigError> {
            match lookup(var) {
                Some(value) => parse_nonzero(var, &value).map(Duration::from_millis),
                None => Ok(default),
            }
        };

        let sample_interval = millis(SAMPLE_INTERVAL_VAR, defaults.sample_interval)?;
        let self_memory_interval = millis(SELF_MEMORY_INTERVAL_VAR, defaults.self_memory_interval)?;
        let title_bar_delay = match lookup(TITLE_BAR_DELAY_VAR) {
            Some(value) => Duration::from_secs(parse_u64(TITLE_BAR_DELAY_VAR, &value)?),
            None => defaults.title_bar_delay,
        };
        let alternate_memory = match lookup(ALT_MEMORY_VAR) {
            Some(value) => parse_bool(ALT_MEMORY_VAR, &value)?,
            None => defaults.alternate_memory,
        };

        Ok(Self {
            sample_interval,
            self_memory_interval,
            title_bar_delay,
            alternate_memory,
        })
    }
}

fn parse_u64(var: &'static str, value: &str) -> Result<u64, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        var,
        value: value.to_string(),
        expected: "non-negative integer",
    })
}

fn parse_nonzero(var: &'static str, value: &str) -> Result<u64, ConfigError> {
    match parse_u64(var, value)? {
        0 => Err(ConfigError::Zero(var)),
        n => Ok(n),
    }
}

fn parse_bool(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            var,
            value: value.to_string(),
            expected: "boolean",
        }),
    }
}
