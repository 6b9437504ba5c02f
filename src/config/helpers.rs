use std::str::FromStr;

use crate::error::ConfigError;

/// Read an env var, treating empty values as unset.
pub(crate) fn optional_env(key: &str) -> Result<Option<String>, ConfigError> {
    match std::env::var(key) {
        Ok(val) if val.trim().is_empty() => Ok(None),
        Ok(val) => Ok(Some(val)),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
    }
}

pub(crate) fn parse_optional_env<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    optional_env(key)?
        .map(|raw| {
            raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            })
        })
        .transpose()
}

pub(crate) fn parse_bool_env(key: &str) -> Result<Option<bool>, ConfigError> {
    let Some(raw) = optional_env(key)? else {
        return Ok(None);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(Some(true)),
        "0" | "false" | "no" | "off" => Ok(Some(false)),
        other => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected a boolean, got '{}'", other),
        }),
    }
}
