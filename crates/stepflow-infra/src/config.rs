//! Engine configuration loader.
//!
//! Reads `config.toml` from the data directory (`~/.stepflow/` unless
//! `STEPFLOW_DATA_DIR` says otherwise) into [`EngineConfig`]. Falls back to
//! defaults when the file is missing or malformed.

use std::path::{Path, PathBuf};

use stepflow_types::config::EngineConfig;

use crate::sqlite::pool::default_database_url;

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "STEPFLOW_DATA_DIR";

/// Resolve the data directory: `$STEPFLOW_DATA_DIR`, else `~/.stepflow`.
///
/// Falls back to `./.stepflow` when no home directory can be determined.
pub fn resolve_data_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os(DATA_DIR_ENV).filter(|v| !v.is_empty()) {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".stepflow")
}

/// Load engine configuration from `{data_dir}/config.toml`.
///
/// - Missing file: [`EngineConfig::default()`].
/// - Unreadable or unparsable file: logs a warning and returns the default.
pub async fn load_engine_config(data_dir: &Path) -> EngineConfig {
    let config_path = data_dir.join("config.toml");

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config.toml found at {}, using defaults", config_path.display());
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return EngineConfig::default();
        }
    };

    match toml::from_str::<EngineConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(
                "Failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            EngineConfig::default()
        }
    }
}

/// The database URL to open: the configured one, else `stepflow.db` in the
/// data directory.
pub fn resolve_database_url(config: &EngineConfig, data_dir: &Path) -> String {
    config
        .database_url
        .clone()
        .unwrap_or_else(|| default_database_url(data_dir))
}

#[cfg(test)]
mod tests {
    use super::*;
    use stepflow_types::config::ReferencePolicy;
    use tempfile::TempDir;

    #[tokio::test]
    async fn load_engine_config_missing_file_returns_default() {
        let tmp = TempDir::new().unwrap();
        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config, EngineConfig::default());
    }

    #[tokio::test]
    async fn load_engine_config_partial_toml_keeps_other_defaults() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(
            tmp.path().join("config.toml"),
            r#"
[validation]
unknown_reference = "warning"

[resilience.categories.crm]
capacity = 2

[queue]
max_attempts = 5
"#,
        )
        .await
        .unwrap();

        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config.validation.unknown_reference, ReferencePolicy::Warning);
        assert_eq!(config.resilience.categories["crm"].capacity, Some(2));
        assert_eq!(config.queue.max_attempts, 5);
        assert!(config.queue.enabled);
        assert_eq!(config.worker.concurrency, 4);
    }

    #[tokio::test]
    async fn load_engine_config_invalid_toml_returns_default() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(tmp.path().join("config.toml"), "this is not { valid toml !!!")
            .await
            .unwrap();

        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn resolve_database_url_prefers_configured() {
        let dir = Path::new("/srv/stepflow");
        let mut config = EngineConfig::default();
        assert_eq!(
            resolve_database_url(&config, dir),
            "sqlite:///srv/stepflow/stepflow.db?mode=rwc"
        );

        config.database_url = Some("sqlite::memory:".to_string());
        assert_eq!(resolve_database_url(&config, dir), "sqlite::memory:");
    }
}
