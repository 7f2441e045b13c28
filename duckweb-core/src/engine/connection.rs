//! DuckDB connection wrapper with a streaming cursor.
//!
//! A `duckdb::Statement` borrows its connection, so an in-flight query cannot
//! be stored next to the connection it runs on. Each `DuckDbConnection`
//! therefore hands its `duckdb::Connection` to a dedicated worker thread. The
//! worker keeps the open statement on its own stack and serves chunk requests
//! until the cursor is exhausted, closed, or superseded by another request.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

use arrow_array::RecordBatch;
use arrow_schema::SchemaRef;
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use duckdb::{Connection, Statement};
use tracing::{debug, instrument, warn};

use crate::error::{panic_message, WebDbError};
use crate::session::ConnectionId;
use crate::tokenize::split_statements;

type Job = Box<dyn FnOnce(&mut Connection) + Send>;

enum Request {
    Open {
        cursor: u64,
        sql: String,
        reply: Sender<Result<SchemaRef, WebDbError>>,
    },
    Fetch {
        cursor: u64,
        reply: Sender<Result<Option<RecordBatch>, WebDbError>>,
    },
    Close {
        cursor: u64,
    },
    Run(Job),
    Shutdown,
}

/// DuckDB connection driven through its worker thread.
///
/// Requests are served strictly in submission order. Opening a cursor or
/// running a job closes whatever cursor was open before.
pub struct DuckDbConnection {
    id: ConnectionId,
    requests: Sender<Request>,
    next_cursor: AtomicU64,
    worker: Option<JoinHandle<()>>,
}

impl DuckDbConnection {
    pub(crate) fn spawn(id: ConnectionId, conn: Connection) -> Result<Self, WebDbError> {
        let (requests, inbox) = unbounded();
        let worker = thread::Builder::new()
            .name(format!("duckweb-conn-{id}"))
            .spawn(move || Worker { conn, inbox }.run())?;
        debug!(connection_id = %id, "spawned connection worker");
        Ok(Self {
            id,
            requests,
            next_cursor: AtomicU64::new(1),
            worker: Some(worker),
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    fn submit(&self, request: Request) -> Result<(), WebDbError> {
        self.requests
            .send(request)
            .map_err(|_| WebDbError::worker_gone())
    }

    /// Run `f` against the underlying connection on the worker thread.
    pub fn with_conn<T, F>(&self, f: F) -> Result<T, WebDbError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, WebDbError> + Send + 'static,
    {
        let (reply, response) = bounded(1);
        self.submit(Request::Run(Box::new(move |conn: &mut Connection| {
            let _ = reply.send(f(conn));
        })))?;
        response.recv().map_err(|_| request_dropped())?
    }

    /// Execute one or more statements for their side effects.
    #[instrument(skip(self), fields(connection_id = %self.id, sql = %sql))]
    pub fn execute_batch(&self, sql: &str) -> Result<(), WebDbError> {
        reject_nul(sql)?;
        let sql = sql.to_string();
        self.with_conn(move |conn| Ok(conn.execute_batch(&sql)?))?;
        debug!("executed batch");
        Ok(())
    }

    /// Run a query and return a cursor over its result chunks.
    ///
    /// Every statement but the last is executed for effect; the last one
    /// produces the cursor.
    #[instrument(skip(self), fields(connection_id = %self.id, sql = %sql))]
    pub fn open_cursor(&self, sql: &str) -> Result<ChunkCursor, WebDbError> {
        reject_nul(sql)?;
        let cursor = self.next_cursor.fetch_add(1, Ordering::SeqCst);
        let (reply, response) = bounded(1);
        self.submit(Request::Open {
            cursor,
            sql: sql.to_string(),
            reply,
        })?;
        let schema = response.recv().map_err(|_| request_dropped())??;
        debug!(
            cursor,
            field_count = schema.fields().len(),
            "opened cursor"
        );
        Ok(ChunkCursor {
            id: cursor,
            schema,
            requests: self.requests.clone(),
            exhausted: false,
        })
    }
}

impl Drop for DuckDbConnection {
    fn drop(&mut self) {
        let _ = self.requests.send(Request::Shutdown);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!(connection_id = %self.id, "connection worker panicked");
            }
        }
    }
}

/// Cursor over the chunks of one open query.
///
/// Dropping an unfinished cursor closes the statement on the worker.
pub struct ChunkCursor {
    id: u64,
    schema: SchemaRef,
    requests: Sender<Request>,
    exhausted: bool,
}

impl ChunkCursor {
    /// Schema reported by the engine when the query was opened.
    pub fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    /// Pull the next chunk; `None` once the result is exhausted.
    pub fn next_chunk(&mut self) -> Result<Option<RecordBatch>, WebDbError> {
        if self.exhausted {
            return Ok(None);
        }
        let (reply, response) = bounded(1);
        self.requests
            .send(Request::Fetch {
                cursor: self.id,
                reply,
            })
            .map_err(|_| WebDbError::worker_gone())?;
        let chunk = match response.recv().map_err(|_| request_dropped())? {
            Ok(chunk) => chunk,
            Err(err) => {
                self.exhausted = true;
                return Err(err);
            }
        };
        if chunk.is_none() {
            self.exhausted = true;
        }
        Ok(chunk)
    }
}

impl Drop for ChunkCursor {
    fn drop(&mut self) {
        if !self.exhausted {
            let _ = self.requests.send(Request::Close { cursor: self.id });
        }
    }
}

struct Worker {
    conn: Connection,
    inbox: Receiver<Request>,
}

impl Worker {
    fn run(mut self) {
        let mut pending = self.inbox.recv().ok();
        while let Some(request) = pending {
            pending = match request {
                Request::Open { cursor, sql, reply } => self.stream(cursor, &sql, reply),
                Request::Fetch { reply, .. } => {
                    let _ = reply.send(Err(cursor_not_active()));
                    self.inbox.recv().ok()
                }
                Request::Close { .. } => self.inbox.recv().ok(),
                Request::Run(job) => {
                    let conn = &mut self.conn;
                    if catch_unwind(AssertUnwindSafe(|| job(conn))).is_err() {
                        warn!("connection job panicked");
                    }
                    self.inbox.recv().ok()
                }
                Request::Shutdown => None,
            };
        }
        debug!("connection worker stopped");
    }

    /// Serve one query until its cursor ends; returns the request that ended it, if any.
    fn stream(
        &self,
        cursor: u64,
        sql: &str,
        reply: Sender<Result<SchemaRef, WebDbError>>,
    ) -> Option<Request> {
        let statements = split_statements(sql);
        let (last, prefix) = match statements.split_last() {
            Some((last, prefix)) => (*last, prefix),
            None => (sql, &[][..]),
        };
        for statement in prefix {
            if let Err(err) = self.conn.execute_batch(statement) {
                let _ = reply.send(Err(err.into()));
                return self.inbox.recv().ok();
            }
        }

        let mut statement = match self.conn.prepare(last) {
            Ok(statement) => statement,
            Err(err) => {
                let _ = reply.send(Err(err.into()));
                return self.inbox.recv().ok();
            }
        };
        // Streaming execution: chunks are produced by the engine as they are fetched.
        let schema = match statement.stream_arrow([]) {
            Ok(stream) => stream.get_schema(),
            Err(err) => {
                let _ = reply.send(Err(err.into()));
                return self.inbox.recv().ok();
            }
        };
        if reply.send(Ok(schema)).is_err() {
            return self.inbox.recv().ok();
        }

        loop {
            let request = match self.inbox.recv() {
                Ok(request) => request,
                Err(_) => return None,
            };
            match request {
                Request::Fetch { cursor: id, reply } => {
                    if id != cursor {
                        let _ = reply.send(Err(cursor_not_active()));
                        continue;
                    }
                    match fetch_chunk(&statement) {
                        Ok(Some(chunk)) => {
                            let _ = reply.send(Ok(Some(chunk)));
                        }
                        Ok(None) => {
                            let _ = reply.send(Ok(None));
                            return self.inbox.recv().ok();
                        }
                        Err(err) => {
                            warn!(cursor, error = %err, "fetching a result chunk failed");
                            let _ = reply.send(Err(err));
                            return self.inbox.recv().ok();
                        }
                    }
                }
                Request::Close { cursor: id } if id == cursor => {
                    debug!(cursor, "closed cursor");
                    return self.inbox.recv().ok();
                }
                Request::Close { .. } => {}
                other => return Some(other),
            }
        }
    }
}

/// Pull one chunk from a statement executed in streaming mode.
fn fetch_chunk(statement: &Statement<'_>) -> Result<Option<RecordBatch>, WebDbError> {
    match catch_unwind(AssertUnwindSafe(|| statement.step())) {
        Ok(Ok(Some(array))) => Ok(Some(RecordBatch::from(&array))),
        Ok(Ok(None)) => Ok(None),
        Ok(Err(err)) => Err(err.into()),
        Err(payload) => Err(WebDbError::Execution(format!(
            "engine failed while fetching a result chunk: {}",
            panic_message(payload.as_ref())
        ))),
    }
}

fn reject_nul(sql: &str) -> Result<(), WebDbError> {
    if sql.contains('\0') {
        return Err(WebDbError::InvalidArgument(
            "SQL contains null bytes".to_string(),
        ));
    }
    Ok(())
}

fn cursor_not_active() -> WebDbError {
    WebDbError::Execution("cursor is no longer active".to_string())
}

fn request_dropped() -> WebDbError {
    WebDbError::Execution("connection request was dropped before completing".to_string())
}

#[cfg(test)]
mod tests {
    use arrow_array::{Array, Int64Array};

    use super::*;

    fn spawn_connection() -> Result<DuckDbConnection, WebDbError> {
        let conn = Connection::open_in_memory()?;
        DuckDbConnection::spawn(ConnectionId::new(1), conn)
    }

    fn collect_i64(cursor: &mut ChunkCursor) -> Result<Vec<i64>, WebDbError> {
        let mut values = Vec::new();
        while let Some(chunk) = cursor.next_chunk()? {
            let column = chunk
                .column(0)
                .as_any()
                .downcast_ref::<Int64Array>()
                .ok_or_else(|| WebDbError::Conversion("expected BIGINT column".into()))?;
            values.extend(column.iter().flatten());
        }
        Ok(values)
    }

    #[test]
    fn cursor_streams_all_rows_then_stays_exhausted() -> Result<(), WebDbError> {
        let conn = spawn_connection()?;
        let mut cursor = conn.open_cursor("SELECT range AS n FROM range(5000) ORDER BY n")?;
        assert_eq!(cursor.schema().field(0).name(), "n");

        let values = collect_i64(&mut cursor)?;
        assert_eq!(values, (0..5000).collect::<Vec<_>>());
        assert!(cursor.next_chunk()?.is_none());
        Ok(())
    }

    #[test]
    fn multi_statement_scripts_stream_the_last_statement() -> Result<(), WebDbError> {
        let conn = spawn_connection()?;
        let mut cursor = conn.open_cursor(
            "CREATE TABLE t (n BIGINT); INSERT INTO t VALUES (3), (4); SELECT n FROM t ORDER BY n;",
        )?;
        assert_eq!(collect_i64(&mut cursor)?, vec![3, 4]);
        Ok(())
    }

    #[test]
    fn new_cursor_supersedes_the_previous_one() -> Result<(), WebDbError> {
        let conn = spawn_connection()?;
        let mut first = conn.open_cursor("SELECT 1::BIGINT")?;
        let mut second = conn.open_cursor("SELECT 2::BIGINT")?;

        assert!(matches!(first.next_chunk(), Err(WebDbError::Execution(_))));
        assert_eq!(collect_i64(&mut second)?, vec![2]);
        drop(first);
        Ok(())
    }

    #[test]
    fn dropping_a_stale_cursor_leaves_the_current_one_open() -> Result<(), WebDbError> {
        let conn = spawn_connection()?;
        let first = conn.open_cursor("SELECT 1::BIGINT")?;
        let mut second = conn.open_cursor("SELECT 2::BIGINT")?;
        drop(first);
        assert_eq!(collect_i64(&mut second)?, vec![2]);
        Ok(())
    }

    #[test]
    fn jobs_close_the_open_cursor_and_run_in_order() -> Result<(), WebDbError> {
        let conn = spawn_connection()?;
        let mut cursor = conn.open_cursor("SELECT 1::BIGINT")?;
        conn.execute_batch("CREATE TABLE t (n INTEGER)")?;
        assert!(cursor.next_chunk().is_err());

        let count: i64 = conn.with_conn(|c| {
            Ok(c.query_row(
                "SELECT count(*) FROM information_schema.tables WHERE table_name = 't'",
                [],
                |row| row.get(0),
            )?)
        })?;
        assert_eq!(count, 1);
        Ok(())
    }

    #[test]
    fn engine_errors_surface_as_execution_errors() -> Result<(), WebDbError> {
        let conn = spawn_connection()?;
        assert!(matches!(
            conn.open_cursor("SELEC 1"),
            Err(WebDbError::Execution(_))
        ));
        assert!(matches!(
            conn.open_cursor("SELECT 1\0"),
            Err(WebDbError::InvalidArgument(_))
        ));
        let mut cursor = conn.open_cursor("SELECT 7::BIGINT")?;
        assert_eq!(collect_i64(&mut cursor)?, vec![7]);
        Ok(())
    }

    #[test]
    fn late_row_errors_surface_on_fetch() -> Result<(), WebDbError> {
        let conn = spawn_connection()?;
        let mut cursor = conn.open_cursor(
            "SELECT CASE WHEN range < 1000000 THEN range ELSE error('late row failed') END AS n \
             FROM range(2000000)",
        )?;
        assert_eq!(cursor.schema().field(0).name(), "n");

        let first = cursor.next_chunk()?.map(|chunk| chunk.num_rows());
        assert!(first.is_some_and(|rows| rows > 0));
        let failure = loop {
            match cursor.next_chunk() {
                Ok(Some(_)) => continue,
                Ok(None) => panic!("expected the stream to fail"),
                Err(err) => break err,
            }
        };
        assert!(matches!(
            failure,
            WebDbError::Execution(ref message) if message.contains("late row failed")
        ));
        assert!(cursor.next_chunk()?.is_none());

        let mut next = conn.open_cursor("SELECT 9::BIGINT")?;
        assert_eq!(collect_i64(&mut next)?, vec![9]);
        Ok(())
    }

    #[test]
    fn panicking_job_does_not_kill_the_worker() -> Result<(), WebDbError> {
        let conn = spawn_connection()?;
        let result: Result<(), WebDbError> = conn.with_conn(|_| panic!("job failed"));
        assert!(result.is_err());
        conn.execute_batch("SELECT 1")?;
        Ok(())
    }
}
