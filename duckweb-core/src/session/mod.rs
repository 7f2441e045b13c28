//! Connection management.
//!
//! This module provides:
//! - `Connection`: one client connection with its own DuckDB worker and
//!   query state (`Idle` or `Active` with an open cursor)
//! - `ConnectionRegistry`: the table of open connections
//! - `ConnectionId`: opaque identifier handed to hosts

pub mod id;
pub mod registry;

pub use id::{ConnectionId, ConnectionIdGenerator};
pub use registry::{ConnectionRegistry, RegistrySnapshot};

use std::sync::{Arc, Mutex, MutexGuard};

use arrow_array::RecordBatch;
use arrow_schema::SchemaRef;
use tracing::{debug, info, instrument};

use crate::engine::{ChunkCursor, DuckDbConnection};
use crate::error::WebDbError;
use crate::import::{self, ImportTarget, RecordBatchSource};
use crate::io::FileSystemBuffer;
use crate::ipc::{FileEncoder, StreamEncoder};

/// Streaming state of a connection.
enum QueryState {
    Idle,
    Active(ActiveQuery),
}

/// A streamed query between `send_query` and the end of its results.
struct ActiveQuery {
    cursor: ChunkCursor,
    schema: SchemaRef,
    encoder: StreamEncoder,
    batches: usize,
}

impl ActiveQuery {
    fn next_payload(&mut self) -> Result<Option<Vec<u8>>, WebDbError> {
        let Some(chunk) = self.cursor.next_chunk()? else {
            return Ok(None);
        };
        let batch = conform(&self.schema, chunk)?;
        let payload = self.encoder.encode_batch(&batch)?;
        self.batches += 1;
        debug!(
            batch = self.batches,
            rows = batch.num_rows(),
            bytes = payload.len(),
            "encoded result batch"
        );
        Ok(Some(payload))
    }
}

/// A client connection with its own engine connection and query state.
pub struct Connection {
    id: ConnectionId,
    engine: DuckDbConnection,
    files: Arc<FileSystemBuffer>,
    batch_size: usize,
    state: Mutex<QueryState>,
}

impl Connection {
    pub fn new(engine: DuckDbConnection, files: Arc<FileSystemBuffer>, batch_size: usize) -> Self {
        Self {
            id: engine.id(),
            engine,
            files,
            batch_size,
            state: Mutex::new(QueryState::Idle),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Whether a streamed query is waiting to be fetched.
    pub fn is_active(&self) -> bool {
        matches!(*self.lock_state(), QueryState::Active(_))
    }

    /// Abandon any streamed query.
    pub fn reset(&self) {
        let mut state = self.lock_state();
        if matches!(*state, QueryState::Active(_)) {
            debug!(connection_id = %self.id, "discarding active query");
        }
        *state = QueryState::Idle;
    }

    /// Run `sql` to completion and return the whole result as an IPC file.
    #[instrument(skip(self), fields(connection_id = %self.id, sql = %sql))]
    pub fn run_query(&self, sql: &str) -> Result<Vec<u8>, WebDbError> {
        let mut state = self.lock_state();
        *state = QueryState::Idle;

        let mut cursor = self.engine.open_cursor(sql)?;
        let schema = cursor.schema();
        let mut file = FileEncoder::try_new(&schema)?;
        while let Some(chunk) = cursor.next_chunk()? {
            file.write(&conform(&schema, chunk)?)?;
        }
        debug!(
            batches = file.batches(),
            rows = file.rows(),
            "materialized query result"
        );
        file.finish()
    }

    /// Start streaming `sql` and return the encoded schema message.
    #[instrument(skip(self), fields(connection_id = %self.id, sql = %sql))]
    pub fn send_query(&self, sql: &str) -> Result<Vec<u8>, WebDbError> {
        let mut state = self.lock_state();
        *state = QueryState::Idle;

        let cursor = self.engine.open_cursor(sql)?;
        let schema = cursor.schema();
        let mut encoder = StreamEncoder::new();
        let payload = encoder.encode_schema(&schema)?;
        *state = QueryState::Active(ActiveQuery {
            cursor,
            schema,
            encoder,
            batches: 0,
        });
        Ok(payload)
    }

    /// Next encoded batch of the streamed query.
    ///
    /// Returns `None` when no query is active or the results are exhausted;
    /// in both cases, and on error, the connection is left `Idle`.
    #[instrument(skip(self), fields(connection_id = %self.id))]
    pub fn fetch_query_results(&self) -> Result<Option<Vec<u8>>, WebDbError> {
        let mut state = self.lock_state();
        let outcome = match &mut *state {
            QueryState::Idle => return Ok(None),
            QueryState::Active(active) => active.next_payload(),
        };
        match outcome {
            Ok(Some(payload)) => Ok(Some(payload)),
            Ok(None) => {
                *state = QueryState::Idle;
                debug!("query results exhausted");
                Ok(None)
            }
            Err(err) => {
                *state = QueryState::Idle;
                Err(err)
            }
        }
    }

    #[instrument(skip(self, options_json), fields(connection_id = %self.id))]
    pub fn import_csv(&self, path: &str, options_json: &str) -> Result<(), WebDbError> {
        let mut state = self.lock_state();
        *state = QueryState::Idle;
        import::csv::import_csv_table(&self.engine, &self.files, path, options_json)
    }

    #[instrument(skip(self, options_json), fields(connection_id = %self.id))]
    pub fn import_json(&self, path: &str, options_json: &str) -> Result<(), WebDbError> {
        let mut state = self.lock_state();
        *state = QueryState::Idle;
        let rows = import::json::import_json_table(
            &self.engine,
            &self.files,
            path,
            options_json,
            self.batch_size,
        )?;
        info!(rows, "imported json table");
        Ok(())
    }

    /// Create `schema.table` from an external reader and append everything it yields.
    #[instrument(skip(self, source), fields(connection_id = %self.id))]
    pub fn register_table(
        &self,
        schema: Option<&str>,
        table: &str,
        source: Box<dyn RecordBatchSource>,
    ) -> Result<usize, WebDbError> {
        let target = ImportTarget::resolve(schema, Some(table))?;
        let mut state = self.lock_state();
        *state = QueryState::Idle;
        import::register_source(&self.engine, target, source)
    }

    fn lock_state(&self) -> MutexGuard<'_, QueryState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Re-bind an engine chunk to the schema announced for the query.
fn conform(schema: &SchemaRef, chunk: RecordBatch) -> Result<RecordBatch, WebDbError> {
    RecordBatch::try_new(schema.clone(), chunk.columns().to_vec()).map_err(|err| {
        WebDbError::Conversion(format!("result chunk does not match query schema: {err}"))
    })
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use anyhow::{anyhow, Result};
    use arrow_array::{Array, Int32Array, Int64Array};
    use arrow_ipc::reader::{FileReader, StreamReader};
    use arrow_schema::{DataType, Field, Schema};

    use super::*;

    fn connection() -> Result<Connection> {
        let engine = DuckDbConnection::spawn(
            ConnectionId::new(1),
            duckdb::Connection::open_in_memory()?,
        )?;
        Ok(Connection::new(
            engine,
            Arc::new(FileSystemBuffer::default()),
            1024,
        ))
    }

    #[test]
    fn run_query_returns_a_readable_ipc_file() -> Result<()> {
        let conn = connection()?;
        let bytes = conn.run_query("SELECT 42::INTEGER AS answer")?;
        let reader = FileReader::try_new(Cursor::new(bytes), None)?;
        assert_eq!(reader.schema().field(0).name(), "answer");
        let batches = reader.collect::<Result<Vec<_>, _>>()?;
        let answer = batches[0]
            .column(0)
            .as_any()
            .downcast_ref::<Int32Array>()
            .ok_or_else(|| anyhow!("expected Int32 column"))?;
        assert_eq!(answer.value(0), 42);
        assert!(!conn.is_active());
        Ok(())
    }

    #[test]
    fn streamed_messages_concatenate_into_an_ipc_stream() -> Result<()> {
        let conn = connection()?;
        let mut stream = conn.send_query("SELECT * FROM range(5000) t(n)")?;
        assert!(conn.is_active());
        while let Some(payload) = conn.fetch_query_results()? {
            stream.extend(payload);
        }
        assert!(!conn.is_active());
        assert!(conn.fetch_query_results()?.is_none());

        let reader = StreamReader::try_new(Cursor::new(stream), None)?;
        let mut total = 0i64;
        for batch in reader {
            let batch = batch?;
            let column = batch
                .column(0)
                .as_any()
                .downcast_ref::<Int64Array>()
                .ok_or_else(|| anyhow!("expected Int64 column"))?;
            total += column.len() as i64;
        }
        assert_eq!(total, 5000);
        Ok(())
    }

    #[test]
    fn fetch_without_query_is_empty() -> Result<()> {
        let conn = connection()?;
        assert!(conn.fetch_query_results()?.is_none());
        Ok(())
    }

    #[test]
    fn a_new_query_replaces_the_active_one() -> Result<()> {
        let conn = connection()?;
        conn.send_query("SELECT 1 AS first")?;
        let schema_bytes = conn.send_query("SELECT 'x' AS second")?;
        let mut stream = schema_bytes;
        while let Some(payload) = conn.fetch_query_results()? {
            stream.extend(payload);
        }
        let reader = StreamReader::try_new(Cursor::new(stream), None)?;
        assert_eq!(reader.schema().field(0).name(), "second");
        Ok(())
    }

    #[test]
    fn failures_leave_the_connection_idle() -> Result<()> {
        let conn = connection()?;
        conn.send_query("SELECT 1")?;
        let err = conn
            .send_query("SELECT * FROM no_such_table")
            .err()
            .ok_or_else(|| anyhow!("expected execution error"))?;
        assert!(matches!(err, WebDbError::Execution(_)));
        assert!(!conn.is_active());

        conn.send_query("SELECT 1")?;
        assert!(conn.run_query("SELEC nonsense").is_err());
        assert!(!conn.is_active());
        Ok(())
    }

    #[test]
    fn reset_discards_the_active_query() -> Result<()> {
        let conn = connection()?;
        conn.send_query("SELECT * FROM range(10)")?;
        conn.reset();
        assert!(!conn.is_active());
        assert!(conn.fetch_query_results()?.is_none());
        Ok(())
    }

    #[test]
    fn conform_rejects_chunks_with_other_column_types() -> Result<()> {
        let announced = Arc::new(Schema::new(vec![Field::new("n", DataType::Int64, true)]));
        let chunk = RecordBatch::try_new(
            Arc::new(Schema::new(vec![Field::new("n", DataType::Int32, true)])),
            vec![Arc::new(Int32Array::from(vec![1, 2]))],
        )?;
        let err = conform(&announced, chunk)
            .err()
            .ok_or_else(|| anyhow!("expected conversion error"))?;
        assert!(matches!(err, WebDbError::Conversion(_)));
        Ok(())
    }

    #[test]
    fn register_table_makes_batches_queryable() -> Result<()> {
        let conn = connection()?;
        let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, true)]));
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![Arc::new(Int64Array::from(vec![5, 6, 7]))],
        )?;
        let source = import::MemoryBatchSource::new(schema, vec![batch]);
        assert_eq!(conn.register_table(None, "vals", Box::new(source))?, 3);

        let bytes = conn.run_query("SELECT sum(v) AS total FROM vals")?;
        let reader = FileReader::try_new(Cursor::new(bytes), None)?;
        let batches = reader.collect::<Result<Vec<_>, _>>()?;
        assert_eq!(batches[0].num_rows(), 1);
        Ok(())
    }
}
