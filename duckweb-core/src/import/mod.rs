//! Table import pipeline.
//!
//! Each import parses its options payload, resolves the target
//! `schema.table`, and registers the data with the engine in a single
//! transaction: the table either appears complete or not at all.
//!
//! - `csv`: the engine's own auto-detecting CSV scan over a path.
//! - `json`: shape inference plus an Arrow JSON reader, appended through the
//!   DuckDB appender via [`RecordBatchSource`].

pub mod csv;
pub mod json;

use std::collections::VecDeque;

use arrow_array::RecordBatch;
use arrow_schema::SchemaRef;
use duckdb::Connection;
use tracing::{info, instrument};

use crate::engine::DuckDbConnection;
use crate::error::WebDbError;
use crate::types::{build_create_table_sql, quote_ident};

pub const DEFAULT_SCHEMA: &str = "main";

/// External reader that the engine pulls record batches from.
pub trait RecordBatchSource: Send {
    fn schema(&self) -> SchemaRef;
    fn next_batch(&mut self) -> Result<Option<RecordBatch>, WebDbError>;
}

/// Batches already held in memory.
pub struct MemoryBatchSource {
    schema: SchemaRef,
    batches: VecDeque<RecordBatch>,
}

impl MemoryBatchSource {
    pub fn new(schema: SchemaRef, batches: Vec<RecordBatch>) -> Self {
        Self {
            schema,
            batches: batches.into(),
        }
    }
}

impl RecordBatchSource for MemoryBatchSource {
    fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    fn next_batch(&mut self) -> Result<Option<RecordBatch>, WebDbError> {
        Ok(self.batches.pop_front())
    }
}

/// Where an import lands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportTarget {
    pub schema: String,
    pub table: String,
}

impl ImportTarget {
    /// Validate the table name and default the schema to `main`.
    pub fn resolve(schema: Option<&str>, table: Option<&str>) -> Result<Self, WebDbError> {
        let table = table.map(str::trim).unwrap_or_default();
        if table.is_empty() {
            return Err(WebDbError::InvalidArgument(
                "missing 'name' option".to_string(),
            ));
        }
        let schema = schema
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_SCHEMA);
        Ok(Self {
            schema: schema.to_string(),
            table: table.to_string(),
        })
    }
}

/// Create `target` from the source schema and append every batch it yields.
#[instrument(skip(conn, source), fields(schema = %target.schema, table = %target.table))]
pub fn register_source(
    conn: &DuckDbConnection,
    target: ImportTarget,
    mut source: Box<dyn RecordBatchSource>,
) -> Result<usize, WebDbError> {
    let rows = conn.with_conn(move |conn| {
        in_transaction(conn, |tx| {
            ensure_schema(tx, &target.schema)?;
            let schema = source.schema();
            tx.execute_batch(&build_create_table_sql(
                &target.schema,
                &target.table,
                &schema,
            )?)?;

            let mut appender = tx.appender_to_db(&target.table, &target.schema)?;
            let mut rows = 0usize;
            while let Some(batch) = source.next_batch()? {
                rows += batch.num_rows();
                appender.append_record_batch(batch)?;
            }
            appender.flush()?;
            Ok(rows)
        })
    })?;
    info!(rows, "registered external reader as table");
    Ok(rows)
}

pub(crate) fn ensure_schema(conn: &Connection, schema: &str) -> Result<(), WebDbError> {
    if schema != DEFAULT_SCHEMA {
        conn.execute_batch(&format!(
            "CREATE SCHEMA IF NOT EXISTS {};",
            quote_ident(schema)
        ))?;
    }
    Ok(())
}

/// Run `f` inside a transaction that rolls back on error.
///
/// Imports need an autocommit connection; inside a transaction opened by the
/// client the `BEGIN` fails and the import is rejected.
pub(crate) fn in_transaction<T>(
    conn: &mut Connection,
    f: impl FnOnce(&Connection) -> Result<T, WebDbError>,
) -> Result<T, WebDbError> {
    let tx = conn.transaction()?;
    let value = f(&tx)?;
    tx.commit()?;
    Ok(value)
}
