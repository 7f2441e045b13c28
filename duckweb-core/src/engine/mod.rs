//! DuckDB engine module - engine construction, connections and cursors.
//!
//! This module provides:
//! - `EngineFactory`: Opens the database once and hands out connections to it
//! - `DuckDbConnection`: A DuckDB connection owned by a dedicated worker thread
//! - `ChunkCursor`: Pulls result chunks of an open query one at a time

pub mod connection;
mod factory;

pub use connection::{ChunkCursor, DuckDbConnection};
pub use factory::EngineFactory;
