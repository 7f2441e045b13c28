use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::WebDbError;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WebDbConfig {
    /// DuckDB execution thread cap.
    pub threads: u32,
    /// Extensions loaded with `LOAD` when the engine is constructed.
    pub extensions: Vec<String>,
    /// Let DuckDB autoload extensions it discovers it needs.
    pub autoload_extensions: bool,
    /// Optional database file; the database lives in memory when unset.
    pub database_path: Option<String>,
    /// Optional DuckDB memory limit, e.g. "512MB".
    pub memory_limit: Option<String>,
    /// Maximum number of open connections.
    pub max_connections: Option<usize>,
    /// Rows per batch produced by the JSON table reader.
    pub batch_size: usize,
    /// Log format: "compact" or "json".
    pub log_format: String,
}

impl Default for WebDbConfig {
    fn default() -> Self {
        Self {
            threads: 1,
            extensions: vec!["parquet".to_string(), "json".to_string()],
            autoload_extensions: false,
            database_path: None,
            memory_limit: None,
            max_connections: None,
            batch_size: 2048,
            log_format: "compact".to_string(),
        }
    }
}

impl WebDbConfig {
    /// Load defaults overlaid with `DUCKWEB_*` environment variables.
    pub fn load() -> Result<Self, WebDbError> {
        let defaults_json = serde_json::to_string(&Self::default()).map_err(|err| {
            WebDbError::InvalidArgument(format!("failed to serialize defaults: {err}"))
        })?;
        let settings = config::Config::builder()
            .add_source(
                config::File::from_str(&defaults_json, config::FileFormat::Json).required(false),
            )
            .add_source(
                config::Environment::with_prefix("DUCKWEB")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("extensions"),
            )
            .build()
            .map_err(|err| {
                WebDbError::InvalidArgument(format!("failed to load configuration: {err}"))
            })?;
        let cfg: WebDbConfig = settings.try_deserialize().map_err(|err| {
            WebDbError::InvalidArgument(format!("failed to deserialize configuration: {err}"))
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn database_path(&self) -> Option<PathBuf> {
        self.database_path
            .as_deref()
            .map(str::trim)
            .filter(|path| !path.is_empty() && *path != ":memory:")
            .map(PathBuf::from)
    }

    pub fn validate(&self) -> Result<(), WebDbError> {
        if self.threads == 0 {
            return Err(WebDbError::InvalidArgument(
                "threads must be at least 1".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(WebDbError::InvalidArgument(
                "batch_size must be at least 1".to_string(),
            ));
        }
        if self.max_connections == Some(0) {
            return Err(WebDbError::InvalidArgument(
                "max_connections must be at least 1 when set".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pin_a_single_thread_and_columnar_extensions() {
        let cfg = WebDbConfig::default();
        assert_eq!(cfg.threads, 1);
        assert!(cfg.extensions.iter().any(|ext| ext == "parquet"));
        assert!(cfg.database_path().is_none());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn memory_marker_means_no_database_file() {
        let cfg = WebDbConfig {
            database_path: Some(":memory:".to_string()),
            ..WebDbConfig::default()
        };
        assert!(cfg.database_path().is_none());

        let cfg = WebDbConfig {
            database_path: Some("/tmp/web.duckdb".to_string()),
            ..WebDbConfig::default()
        };
        assert_eq!(cfg.database_path(), Some(PathBuf::from("/tmp/web.duckdb")));
    }

    #[test]
    fn validate_rejects_zero_limits() {
        let cfg = WebDbConfig {
            threads: 0,
            ..WebDbConfig::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = WebDbConfig {
            batch_size: 0,
            ..WebDbConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
