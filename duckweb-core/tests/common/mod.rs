#![allow(dead_code)]

use std::io::Cursor;
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{Array, Int64Array, RecordBatch};
use arrow_ipc::reader::{FileReader, StreamReader};
use duckweb_core::{ConnectionId, WebDb, WebDbConfig};

pub fn open_db() -> Result<Arc<WebDb>> {
    Ok(WebDb::open(WebDbConfig::default())?)
}

/// Drain a streamed query into one IPC stream buffer.
pub fn stream_query(db: &WebDb, id: ConnectionId, sql: &str) -> Result<Vec<u8>> {
    let mut stream = db.send_query(id, sql)?;
    while let Some(payload) = db.fetch_query_results(id)? {
        stream.extend(payload);
    }
    Ok(stream)
}

pub fn read_stream(bytes: Vec<u8>) -> Result<Vec<RecordBatch>> {
    let reader = StreamReader::try_new(Cursor::new(bytes), None)?;
    Ok(reader.collect::<Result<Vec<_>, _>>()?)
}

pub fn read_file(bytes: Vec<u8>) -> Result<Vec<RecordBatch>> {
    let reader = FileReader::try_new(Cursor::new(bytes), None)?;
    Ok(reader.collect::<Result<Vec<_>, _>>()?)
}

/// First value of a single BIGINT column query.
pub fn query_i64(db: &WebDb, id: ConnectionId, sql: &str) -> Result<i64> {
    let batches = read_file(db.run_query(id, sql)?)?;
    let batch = batches.first().context("expected a result batch")?;
    let column = batch
        .column(0)
        .as_any()
        .downcast_ref::<Int64Array>()
        .context("expected Int64 column")?;
    Ok(column.value(0))
}
