//! Engine configuration persistence
//!
//! `EngineConfig` lives at `~/.rollcall/config.json`. A missing file means
//! defaults; a present-but-broken file is an error the caller surfaces
//! rather than silently ignoring.

use std::fs;
use std::path::{Path, PathBuf};

use chrono_tz::Tz;

use crate::error::{EngineError, Result};
use crate::types::EngineConfig;

pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| EngineError::Configuration("Could not determine home directory".into()))?;
    Ok(home.join(".rollcall"))
}

pub fn config_path() -> Result<PathBuf> {
    Ok(config_dir()?.join("config.json"))
}

pub fn load_config() -> Result<EngineConfig> {
    load_config_from(&config_path()?)
}

pub fn load_config_from(path: &Path) -> Result<EngineConfig> {
    if !path.exists() {
        log::info!("No config at {:?}, using defaults", path);
        return Ok(EngineConfig::default());
    }
    let raw = fs::read_to_string(path)?;
    let config: EngineConfig = serde_json::from_str(&raw)?;
    validate(&config)?;
    Ok(config)
}

pub fn save_config(config: &EngineConfig) -> Result<()> {
    save_config_to(&config_path()?, config)
}

pub fn save_config_to(path: &Path, config: &EngineConfig) -> Result<()> {
    validate(config)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let raw = serde_json::to_string_pretty(config)?;
    fs::write(path, raw)?;
    log::debug!("Saved config to {:?}", path);
    Ok(())
}

fn validate(config: &EngineConfig) -> Result<()> {
    config
        .timezone
        .parse::<Tz>()
        .map_err(|_| EngineError::InvalidTimezone(config.timezone.clone()))?;
    if config.tick_interval_secs == 0 {
        return Err(EngineError::Configuration("tickIntervalSecs must be positive".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time_window::RangePolicy;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config_from(&dir.path().join("config.json")).unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let config = EngineConfig {
            timezone: "Asia/Jerusalem".into(),
            tick_interval_secs: 30,
            ..EngineConfig::default()
        };
        save_config_to(&path, &config).unwrap();
        assert_eq!(load_config_from(&path).unwrap(), config);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"timezone": "Europe/Paris"}"#).unwrap();
        let config = load_config_from(&path).unwrap();
        assert_eq!(config.timezone, "Europe/Paris");
        assert_eq!(config.tick_interval_secs, 60);
        assert_eq!(config.counterpart_range_policy, RangePolicy::FailOpen);
    }

    #[test]
    fn test_bad_timezone_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"timezone": "Mars/Olympus"}"#).unwrap();
        assert!(matches!(
            load_config_from(&path),
            Err(EngineError::InvalidTimezone(_))
        ));
    }

    #[test]
    fn test_malformed_json_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(load_config_from(&path), Err(EngineError::Decode(_))));
    }
}
