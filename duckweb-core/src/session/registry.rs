//! Connection registry - tracks every open client connection.
//!
//! The registry:
//! - Mints connection ids and creates the engine connection behind each one
//! - Provides connection lookup by id
//! - Enforces the optional connection limit
//! - Resets and drops connections on disconnect

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::engine::EngineFactory;
use crate::error::WebDbError;
use crate::io::FileSystemBuffer;
use crate::session::id::{ConnectionId, ConnectionIdGenerator};
use crate::session::Connection;

/// Registry for managing all open connections
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ConnectionId, Arc<Connection>>>,
    factory: Arc<EngineFactory>,
    files: Arc<FileSystemBuffer>,
    ids: ConnectionIdGenerator,
    max_connections: Option<usize>,
    batch_size: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistrySnapshot {
    pub total_connections: usize,
    pub max_connections: Option<usize>,
}

impl ConnectionRegistry {
    pub fn new(
        factory: Arc<EngineFactory>,
        files: Arc<FileSystemBuffer>,
        max_connections: Option<usize>,
        batch_size: usize,
    ) -> Self {
        info!(?max_connections, "connection registry initialized");
        Self {
            connections: RwLock::new(HashMap::new()),
            factory,
            files,
            ids: ConnectionIdGenerator::new(),
            max_connections,
            batch_size,
        }
    }

    /// Open a new connection and register it under a fresh id.
    #[instrument(skip(self))]
    pub fn create(&self) -> Result<ConnectionId, WebDbError> {
        let mut connections = self
            .connections
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(max) = self.max_connections {
            if connections.len() >= max {
                warn!(
                    current = connections.len(),
                    max, "max connections limit reached"
                );
                return Err(WebDbError::ConnectionLimit(max));
            }
        }

        let id = self.ids.next();
        let engine = self.factory.create_connection(id)?;
        let connection = Connection::new(engine, self.files.clone(), self.batch_size);
        connections.insert(id, Arc::new(connection));
        info!(
            connection_id = %id,
            total_connections = connections.len(),
            "connection opened"
        );
        Ok(id)
    }

    pub fn get(&self, id: ConnectionId) -> Result<Arc<Connection>, WebDbError> {
        let connections = self
            .connections
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        connections
            .get(&id)
            .cloned()
            .ok_or(WebDbError::ConnectionNotFound(id))
    }

    /// Unregister `id`, resetting its query state. Unknown ids are ignored.
    #[instrument(skip(self))]
    pub fn remove(&self, id: ConnectionId) -> bool {
        let removed = {
            let mut connections = self
                .connections
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            connections.remove(&id)
        };
        match removed {
            Some(connection) => {
                connection.reset();
                info!(connection_id = %id, "connection closed");
                true
            }
            None => {
                debug!(connection_id = %id, "disconnect of unknown connection ignored");
                false
            }
        }
    }

    pub fn len(&self) -> usize {
        self.connections
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            total_connections: self.len(),
            max_connections: self.max_connections,
        }
    }
}

#[cfg(test)]
mod tests {
    use anyhow::{anyhow, Result};

    use super::*;
    use crate::config::WebDbConfig;

    fn build_registry(max_connections: Option<usize>) -> Result<ConnectionRegistry> {
        let factory = Arc::new(EngineFactory::new(&WebDbConfig::default())?);
        Ok(ConnectionRegistry::new(
            factory,
            Arc::new(FileSystemBuffer::default()),
            max_connections,
            128,
        ))
    }

    #[test]
    fn snapshot_for_empty_registry_reports_limit() -> Result<()> {
        let registry = build_registry(Some(3))?;
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.total_connections, 0);
        assert_eq!(snapshot.max_connections, Some(3));
        assert!(registry.is_empty());
        Ok(())
    }

    #[test]
    fn ids_are_distinct_and_never_reused() -> Result<()> {
        let registry = build_registry(None)?;
        let first = registry.create()?;
        assert!(registry.remove(first));
        let second = registry.create()?;
        assert_ne!(first, second);
        assert_eq!(registry.get(second)?.id(), second);
        Ok(())
    }

    #[test]
    fn removed_ids_are_not_found_and_double_remove_is_a_no_op() -> Result<()> {
        let registry = build_registry(None)?;
        let id = registry.create()?;
        assert!(registry.remove(id));
        assert!(!registry.remove(id));

        let err = registry
            .get(id)
            .err()
            .ok_or_else(|| anyhow!("expected not-found error"))?;
        assert!(matches!(err, WebDbError::ConnectionNotFound(missing) if missing == id));
        Ok(())
    }

    #[test]
    fn create_returns_limit_error_when_full() -> Result<()> {
        let registry = build_registry(Some(1))?;
        let first = registry.create()?;

        let err = registry
            .create()
            .err()
            .ok_or_else(|| anyhow!("expected connection-limit error"))?;
        assert!(matches!(err, WebDbError::ConnectionLimit(1)));
        assert_eq!(registry.len(), 1);

        registry.remove(first);
        registry.create()?;
        Ok(())
    }

    #[test]
    fn connections_are_independent() -> Result<()> {
        let registry = build_registry(None)?;
        let left = registry.get(registry.create()?)?;
        let right = registry.get(registry.create()?)?;

        left.send_query("SELECT * FROM range(3)")?;
        right.send_query("SELECT 1")?;
        assert!(left.is_active());
        assert!(right.is_active());

        registry.remove(right.id());
        assert!(left.is_active());
        assert!(left.fetch_query_results()?.is_some());
        Ok(())
    }
}
