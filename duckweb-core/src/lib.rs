//! Embedded analytical database with a connection-oriented query protocol.
//!
//! Hosts open a [`WebDb`], connect, and either run a query to completion
//! (Arrow IPC file) or stream it as an IPC schema message followed by batch
//! messages. CSV and JSON files can be imported as tables, and SQL text can be
//! tokenized for highlighting without touching the engine.

pub mod config;
pub mod engine;
pub mod error;
pub mod import;
pub mod io;
pub mod ipc;
pub mod session;
pub mod tokenize;
pub mod types;
pub mod webdb;

pub use config::WebDbConfig;
pub use error::{ErrorKind, WebDbError};
pub use import::RecordBatchSource;
pub use session::{Connection, ConnectionId};
pub use webdb::WebDb;
