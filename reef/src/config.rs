use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use thiserror::Error;

const DEFAULT_API_URL: &str = "https://api.reservoir.tools";
const DEFAULT_WS_URL: &str = "wss://ws.reservoir.tools";
const DEFAULT_API_KEY: &str = "demo-api-key";
const DEFAULT_STATE_DIR: &str = "reef.state";
const DEFAULT_POOL_SIZE: usize = 6;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value}")]
    InvalidValue { var: &'static str, value: String },
}

/// Runtime configuration, read from the environment with compiled defaults.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub api_base_url: String,
    pub ws_url: String,
    pub api_key: String,
    pub state_dir: PathBuf,
    pub pool_size: usize,
    pub dashboard: bool,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            api_base_url: env_or("RESERVOIR_API_URL", DEFAULT_API_URL),
            ws_url: env_or("RESERVOIR_WS_URL", DEFAULT_WS_URL),
            api_key: env_or("RESERVOIR_API_KEY", DEFAULT_API_KEY),
            state_dir: PathBuf::from(env_or("REEF_STATE_DIR", DEFAULT_STATE_DIR)),
            pool_size: parse_value("REEF_POOL_SIZE", read_var("REEF_POOL_SIZE"), DEFAULT_POOL_SIZE)?,
            dashboard: parse_value("REEF_DASHBOARD", read_var("REEF_DASHBOARD"), true)?,
        })
    }
}

fn read_var(var: &str) -> Option<String> {
    env::var(var).ok().filter(|value| !value.trim().is_empty())
}

fn env_or(var: &str, default: &str) -> String {
    read_var(var).unwrap_or_else(|| default.to_string())
}

fn parse_value<T: FromStr>(
    var: &'static str,
    raw: Option<String>,
    default: T,
) -> Result<T, ConfigError> {
    match raw {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { var, value }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_values_fall_back_to_defaults() {
        assert_eq!(parse_value("REEF_POOL_SIZE", None, 6).unwrap(), 6);
        assert!(parse_value("REEF_DASHBOARD", None, true).unwrap());
    }

    #[test]
    fn values_parse_from_strings() {
        let parsed: usize = parse_value("REEF_POOL_SIZE", Some("12".to_string()), 6).unwrap();
        assert_eq!(parsed, 12);
        let parsed: bool = parse_value("REEF_DASHBOARD", Some("false".to_string()), true).unwrap();
        assert!(!parsed);
    }

    #[test]
    fn garbage_values_are_rejected_with_the_variable_name() {
        let err = parse_value::<usize>("REEF_POOL_SIZE", Some("many".to_string()), 6).unwrap_err();
        assert!(err.to_string().contains("REEF_POOL_SIZE"));
    }
}
