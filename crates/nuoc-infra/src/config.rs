//! Engine configuration loader.
//!
//! An explicitly named file must exist and parse. The implicit
//! `{data_dir}/nuoc.toml` is optional: a missing or malformed file falls back
//! to defaults with a warning. `NUOC_DATA_DIR` overrides `data_dir` either way.

use std::path::{Path, PathBuf};

use nuoc_types::config::EngineConfig;

/// Environment variable overriding `data_dir`.
pub const DATA_DIR_ENV: &str = "NUOC_DATA_DIR";

/// File name looked up inside the data directory.
pub const CONFIG_FILE_NAME: &str = "nuoc.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Load the engine configuration.
///
/// With `path`, that file is read and parsed; any failure is an error.
/// Without it, `{data_dir}/nuoc.toml` is tried where `data_dir` comes from
/// `NUOC_DATA_DIR` or the default.
pub async fn load_engine_config(path: Option<&Path>) -> Result<EngineConfig, ConfigError> {
    let env_dir = std::env::var_os(DATA_DIR_ENV).map(PathBuf::from);
    load_with_data_dir(path, env_dir).await
}

async fn load_with_data_dir(
    path: Option<&Path>,
    env_dir: Option<PathBuf>,
) -> Result<EngineConfig, ConfigError> {
    let mut config = match path {
        Some(path) => {
            let content = tokio::fs::read_to_string(path)
                .await
                .map_err(|source| ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
            toml::from_str::<EngineConfig>(&content).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?
        }
        None => {
            let data_dir = env_dir
                .clone()
                .unwrap_or_else(|| EngineConfig::default().data_dir);
            load_implicit(&data_dir.join(CONFIG_FILE_NAME)).await
        }
    };

    if let Some(dir) = env_dir {
        config.data_dir = dir;
    }
    Ok(config)
}

async fn load_implicit(config_path: &Path) -> EngineConfig {
    let content = match tokio::fs::read_to_string(config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %config_path.display(), "no config file, using defaults");
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!(path = %config_path.display(), error = %err, "failed to read config, using defaults");
            return EngineConfig::default();
        }
    };

    match toml::from_str::<EngineConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(path = %config_path.display(), error = %err, "failed to parse config, using defaults");
            EngineConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_missing_implicit_file_returns_default() {
        let tmp = TempDir::new().unwrap();
        let config = load_with_data_dir(None, Some(tmp.path().to_path_buf()))
            .await
            .unwrap();
        assert_eq!(config.max_concurrency, 8);
        assert_eq!(config.data_dir, tmp.path());
    }

    #[tokio::test]
    async fn test_implicit_file_is_read_from_data_dir() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(
            tmp.path().join(CONFIG_FILE_NAME),
            "max_concurrency = 3\nsweep_interval_ms = 250\n",
        )
        .await
        .unwrap();

        let config = load_with_data_dir(None, Some(tmp.path().to_path_buf()))
            .await
            .unwrap();
        assert_eq!(config.max_concurrency, 3);
        assert_eq!(config.sweep_interval_ms, 250);
    }

    #[tokio::test]
    async fn test_malformed_implicit_file_falls_back() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(tmp.path().join(CONFIG_FILE_NAME), "max_concurrency = [")
            .await
            .unwrap();

        let config = load_with_data_dir(None, Some(tmp.path().to_path_buf()))
            .await
            .unwrap();
        assert_eq!(config.max_concurrency, 8);
    }

    #[tokio::test]
    async fn test_explicit_file_must_exist_and_parse() {
        let tmp = TempDir::new().unwrap();
        let missing = tmp.path().join("absent.toml");
        let err = load_with_data_dir(Some(&missing), None).await.unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));

        let broken = tmp.path().join("broken.toml");
        tokio::fs::write(&broken, "http = 5").await.unwrap();
        let err = load_with_data_dir(Some(&broken), None).await.unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[tokio::test]
    async fn test_env_dir_overrides_explicit_file() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("engine.toml");
        tokio::fs::write(&file, "data_dir = \"/srv/nuoc\"\n[http]\nbind = \"0.0.0.0:8080\"\n")
            .await
            .unwrap();

        let config = load_with_data_dir(Some(&file), None).await.unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/srv/nuoc"));

        let config = load_with_data_dir(Some(&file), Some(PathBuf::from("/tmp/override")))
            .await
            .unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/tmp/override"));
        assert_eq!(config.http.bind, "0.0.0.0:8080");
    }
}
