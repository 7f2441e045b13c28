//! The engine handle and its public call surface.
//!
//! Every method returns `Result` and runs inside a panic boundary, so hosts
//! calling through an FFI or message layer never see an unwind.

use std::path::Path;
use std::sync::{Arc, Mutex, OnceLock};

use bytes::Bytes;
use tracing::{info, instrument};

use crate::config::WebDbConfig;
use crate::engine::EngineFactory;
use crate::error::{catch_panics, WebDbError};
use crate::import::RecordBatchSource;
use crate::io::{FileSystem, FileSystemBuffer, LocalFileSystem};
use crate::session::{ConnectionId, ConnectionRegistry, RegistrySnapshot};
use crate::tokenize;

static INSTANCE: OnceLock<Arc<WebDb>> = OnceLock::new();
static INSTANCE_INIT: Mutex<()> = Mutex::new(());

/// One embedded database plus the connections opened against it.
pub struct WebDb {
    config: WebDbConfig,
    factory: Arc<EngineFactory>,
    files: Arc<FileSystemBuffer>,
    registry: ConnectionRegistry,
}

impl WebDb {
    pub fn open(config: WebDbConfig) -> Result<Arc<Self>, WebDbError> {
        Self::open_with_filesystem(config, Box::new(LocalFileSystem))
    }

    /// Open the database with `filesystem` behind the file buffer.
    #[instrument(skip_all)]
    pub fn open_with_filesystem(
        config: WebDbConfig,
        filesystem: Box<dyn FileSystem>,
    ) -> Result<Arc<Self>, WebDbError> {
        catch_panics(|| {
            let factory = Arc::new(EngineFactory::new(&config)?);
            let files = Arc::new(FileSystemBuffer::new(filesystem));
            let registry = ConnectionRegistry::new(
                factory.clone(),
                files.clone(),
                config.max_connections,
                config.batch_size,
            );
            info!(version = factory.version(), "webdb opened");
            Ok(Arc::new(Self {
                config,
                factory,
                files,
                registry,
            }))
        })
    }

    /// Process-wide handle, opened with the default configuration on first use.
    pub fn instance() -> Result<Arc<Self>, WebDbError> {
        Self::instance_with(WebDbConfig::default, || Box::new(LocalFileSystem))
    }

    /// Process-wide handle; the arguments are only used if it does not exist yet.
    ///
    /// A failed construction is returned to the caller and retried on the next call.
    pub fn instance_with(
        config: impl FnOnce() -> WebDbConfig,
        filesystem: impl FnOnce() -> Box<dyn FileSystem>,
    ) -> Result<Arc<Self>, WebDbError> {
        if let Some(db) = INSTANCE.get() {
            return Ok(db.clone());
        }
        let _guard = INSTANCE_INIT
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(db) = INSTANCE.get() {
            return Ok(db.clone());
        }
        let db = Self::open_with_filesystem(config(), filesystem())?;
        Ok(INSTANCE.get_or_init(|| db).clone())
    }

    pub fn version(&self) -> &str {
        self.factory.version()
    }

    pub fn config(&self) -> &WebDbConfig {
        &self.config
    }

    pub fn connect(&self) -> Result<ConnectionId, WebDbError> {
        catch_panics(|| self.registry.create())
    }

    /// Close `id`. Unknown ids are ignored.
    pub fn disconnect(&self, id: ConnectionId) {
        // Dropping a connection joins its worker; a panic there must not escape either.
        let _ = catch_panics(|| {
            self.registry.remove(id);
            Ok(())
        });
    }

    /// Whether `id` has a streamed query waiting to be fetched.
    pub fn is_active(&self, id: ConnectionId) -> Result<bool, WebDbError> {
        catch_panics(|| Ok(self.registry.get(id)?.is_active()))
    }

    /// Run `sql` to completion; the result is an Arrow IPC file.
    pub fn run_query(&self, id: ConnectionId, sql: &str) -> Result<Vec<u8>, WebDbError> {
        catch_panics(|| self.registry.get(id)?.run_query(sql))
    }

    /// Start streaming `sql`; the result is the IPC schema message.
    pub fn send_query(&self, id: ConnectionId, sql: &str) -> Result<Vec<u8>, WebDbError> {
        catch_panics(|| self.registry.get(id)?.send_query(sql))
    }

    /// Next IPC batch message of the streamed query, or `None` once it is exhausted.
    pub fn fetch_query_results(&self, id: ConnectionId) -> Result<Option<Vec<u8>>, WebDbError> {
        catch_panics(|| self.registry.get(id)?.fetch_query_results())
    }

    pub fn import_csv(
        &self,
        id: ConnectionId,
        path: &str,
        options_json: &str,
    ) -> Result<(), WebDbError> {
        catch_panics(|| self.registry.get(id)?.import_csv(path, options_json))
    }

    pub fn import_json(
        &self,
        id: ConnectionId,
        path: &str,
        options_json: &str,
    ) -> Result<(), WebDbError> {
        catch_panics(|| self.registry.get(id)?.import_json(path, options_json))
    }

    /// Register an external reader as table `schema.table` (schema defaults to `main`).
    pub fn register_table(
        &self,
        id: ConnectionId,
        schema: Option<&str>,
        table: &str,
        source: Box<dyn RecordBatchSource>,
    ) -> Result<usize, WebDbError> {
        catch_panics(|| self.registry.get(id)?.register_table(schema, table, source))
    }

    /// Tokens of `sql` as `{"offsets": [...], "types": [...]}`.
    pub fn tokenize(&self, sql: &str) -> Result<String, WebDbError> {
        catch_panics(|| tokenize::tokenize(sql).to_json())
    }

    pub fn flush_files(&self) -> Result<(), WebDbError> {
        catch_panics(|| Ok(self.files.flush()?))
    }

    pub fn flush_file(&self, path: impl AsRef<Path>) -> Result<(), WebDbError> {
        catch_panics(|| Ok(self.files.flush_file(path)?))
    }

    /// Place host-provided contents at `path`; they are written out on flush.
    pub fn register_file(&self, path: impl AsRef<Path>, data: impl Into<Bytes>) {
        self.files.write_file(path.as_ref(), data);
    }

    pub fn drop_file(&self, path: impl AsRef<Path>) -> bool {
        self.files.drop_file(path)
    }

    pub fn registry_snapshot(&self) -> RegistrySnapshot {
        self.registry.snapshot()
    }
}
