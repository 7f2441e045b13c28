//! DuckDB database construction and connection factory.
//!
//! The database is opened once with the configured thread cap and extension
//! set. Every connection handed out afterwards is a clone of the root
//! connection, so all of them see the same catalog.

use std::sync::Mutex;

use duckdb::{Config, Connection};
use tracing::{info, instrument};

use crate::config::WebDbConfig;
use crate::engine::connection::DuckDbConnection;
use crate::error::WebDbError;
use crate::session::ConnectionId;

/// Owns the single embedded database instance.
pub struct EngineFactory {
    root: Mutex<Connection>,
    version: String,
}

impl EngineFactory {
    /// Open the database and load the configured extensions.
    ///
    /// A failing extension load aborts construction; there is no degraded mode.
    #[instrument(skip(config), fields(threads = config.threads))]
    pub fn new(config: &WebDbConfig) -> Result<Self, WebDbError> {
        config.validate()?;
        let mut flags = Config::default()
            .threads(i64::from(config.threads))?
            .enable_autoload_extension(config.autoload_extensions)?;
        if let Some(limit) = config.memory_limit.as_deref() {
            flags = flags.max_memory(limit)?;
        }

        let conn = match config.database_path() {
            Some(path) => {
                info!(path = %path.display(), "opening database file");
                Connection::open_with_flags(path, flags)?
            }
            None => Connection::open_in_memory_with_flags(flags)?,
        };

        let init_sql = build_init_sql(&config.extensions)?;
        if !init_sql.is_empty() {
            info!("base init sql {}", init_sql);
            conn.execute_batch(&init_sql)?;
        }

        let version: String = conn.query_row(
            "SELECT library_version FROM pragma_version()",
            [],
            |row| row.get(0),
        )?;
        info!(%version, "engine initialized");

        Ok(Self {
            root: Mutex::new(conn),
            version,
        })
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Create a new connection to the shared database, driven by its own worker.
    #[instrument(skip(self))]
    pub fn create_connection(&self, id: ConnectionId) -> Result<DuckDbConnection, WebDbError> {
        let conn = {
            let root = self
                .root
                .lock()
                .map_err(|_| WebDbError::Unknown("root connection mutex poisoned".to_string()))?;
            root.try_clone()?
        };
        DuckDbConnection::spawn(id, conn)
    }
}

fn build_init_sql(extensions: &[String]) -> Result<String, WebDbError> {
    let mut statements = Vec::with_capacity(extensions.len());
    for extension in extensions {
        let name = extension.trim();
        if name.is_empty() {
            continue;
        }
        if !name
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
        {
            return Err(WebDbError::InvalidArgument(format!(
                "invalid extension name: {name}"
            )));
        }
        statements.push(format!("LOAD {name};"));
    }
    Ok(statements.join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_sql_loads_each_extension() -> Result<(), WebDbError> {
        let sql = build_init_sql(&["parquet".to_string(), " json ".to_string(), String::new()])?;
        assert_eq!(sql, "LOAD parquet; LOAD json;");
        Ok(())
    }

    #[test]
    fn init_sql_rejects_suspicious_extension_names() {
        let err = build_init_sql(&["parquet; DROP TABLE x".to_string()]);
        assert!(matches!(err, Err(WebDbError::InvalidArgument(_))));
    }

    #[test]
    fn factory_reports_version_and_shares_one_catalog() -> Result<(), WebDbError> {
        let factory = EngineFactory::new(&WebDbConfig::default())?;
        assert!(!factory.version().is_empty());

        let writer = factory.create_connection(ConnectionId::new(1))?;
        let reader = factory.create_connection(ConnectionId::new(2))?;
        writer.execute_batch("CREATE TABLE shared (n INTEGER); INSERT INTO shared VALUES (1)")?;
        let count: i64 = reader.with_conn(|conn| {
            Ok(conn.query_row("SELECT count(*) FROM shared", [], |row| row.get(0))?)
        })?;
        assert_eq!(count, 1);
        Ok(())
    }

    #[test]
    fn unknown_extension_is_fatal_to_construction() {
        let config = WebDbConfig {
            extensions: vec!["no_such_extension_xyz".to_string()],
            ..WebDbConfig::default()
        };
        assert!(EngineFactory::new(&config).is_err());
    }
}
