use std::fs;
use std::path::{Path, PathBuf};

use crate::model::config::AppConfig;

pub const CONFIG_FILE: &str = "taskpixel.toml";

/// Error type for config I/O
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not read {path}: {source}")]
    ReadError {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("could not parse taskpixel.toml: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("could not serialize taskpixel.toml: {0}")]
    SerializeError(#[from] toml::ser::Error),
}

/// Read `taskpixel.toml` from the data directory. A missing file yields the
/// defaults.
pub fn read_config(data_dir: &Path) -> Result<AppConfig, ConfigError> {
    let config_path = data_dir.join(CONFIG_FILE);
    if !config_path.exists() {
        return Ok(AppConfig::default());
    }
    let config_text = fs::read_to_string(&config_path).map_err(|e| ConfigError::ReadError {
        path: config_path.clone(),
        source: e,
    })?;
    Ok(toml::from_str(&config_text)?)
}

/// Write the config to `taskpixel.toml`, replacing any existing file.
pub fn write_config(data_dir: &Path, config: &AppConfig) -> Result<(), ConfigError> {
    let config_path = data_dir.join(CONFIG_FILE);
    let text = toml::to_string_pretty(config)?;
    fs::write(&config_path, text).map_err(|e| ConfigError::ReadError {
        path: config_path,
        source: e,
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn missing_file_gives_defaults() {
        let tmp = TempDir::new().unwrap();
        let config = read_config(tmp.path()).unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.store.key, "taskpixel_data");
        assert_eq!(config.sync.interval_ms, 5_000);
        assert_eq!(config.input.debounce_ms, 300);
        assert_eq!(config.input.max_suggestions, 8);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let tmp = TempDir::new().unwrap();
        fs::write(
            tmp.path().join(CONFIG_FILE),
            "[sync]\ninterval_ms = 1000\n\n[log]\nlevel = \"debug\"\n",
        )
        .unwrap();
        let config = read_config(tmp.path()).unwrap();
        assert_eq!(config.sync.interval_ms, 1000);
        assert!(config.sync.auto_sync);
        assert_eq!(config.log.level, "debug");
        assert!(config.input.allow_create);
    }

    #[test]
    fn bad_toml_is_a_parse_error() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join(CONFIG_FILE), "[sync\n").unwrap();
        let err = read_config(tmp.path()).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }

    #[test]
    fn write_then_read() {
        let tmp = TempDir::new().unwrap();
        let mut config = AppConfig::default();
        config.input.allow_create = false;
        config.store.key = "other".into();
        write_config(tmp.path(), &config).unwrap();
        assert_eq!(read_config(tmp.path()).unwrap(), config);
    }
}
