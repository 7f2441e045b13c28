//! JSON table import.
//!
//! Four layouts are understood:
//!
//! - `row-array`: `[{"a": 1}, {"a": 2}]`
//! - `column-object`: `{"a": [1, 2], "b": ["x", "y"]}`
//! - `record`: a single `{"a": 1}` object, imported as one row
//! - `ndjson`: one object per line (or any whitespace-separated sequence)
//!
//! When the options do not name a layout it is inferred from a copy of the
//! input stream. The stream handed to the reader is never consumed by
//! inference.

use std::fmt;
use std::sync::Arc;

use arrow_array::RecordBatch;
use arrow_json::reader::{infer_json_schema_from_iterator, Decoder};
use arrow_json::ReaderBuilder;
use arrow_schema::SchemaRef;
use serde::de::{self, Deserializer, IgnoredAny, MapAccess, SeqAccess, Visitor};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, instrument};

use crate::engine::DuckDbConnection;
use crate::error::WebDbError;
use crate::import::{register_source, ImportTarget, RecordBatchSource};
use crate::io::{FileSystemBuffer, InputFileStream};
use crate::types::widen_null_types;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TableShape {
    RowArray,
    ColumnObject,
    Record,
    Ndjson,
    #[serde(other)]
    Unrecognized,
}

impl fmt::Display for TableShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TableShape::RowArray => "row-array",
            TableShape::ColumnObject => "column-object",
            TableShape::Record => "record",
            TableShape::Ndjson => "ndjson",
            TableShape::Unrecognized => "unrecognized",
        };
        f.write_str(name)
    }
}

/// Options payload accepted by the JSON import.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct JsonImportOptions {
    pub schema: Option<String>,
    pub name: Option<String>,
    pub shape: Option<TableShape>,
}

impl JsonImportOptions {
    pub fn parse(json: &str) -> Result<Self, WebDbError> {
        serde_json::from_str(json)
            .map_err(|err| WebDbError::InvalidArgument(format!("invalid JSON import options: {err}")))
    }

    pub fn target(&self) -> Result<ImportTarget, WebDbError> {
        ImportTarget::resolve(self.schema.as_deref(), self.name.as_deref())
    }

    /// The declared layout; an unrecognized value means "infer".
    pub fn declared_shape(&self) -> Option<TableShape> {
        self.shape.filter(|shape| *shape != TableShape::Unrecognized)
    }
}

/// Import the JSON file at `path` as a new table.
#[instrument(skip(conn, files, options_json), fields(connection_id = %conn.id()))]
pub fn import_json_table(
    conn: &DuckDbConnection,
    files: &FileSystemBuffer,
    path: &str,
    options_json: &str,
    batch_size: usize,
) -> Result<usize, WebDbError> {
    let options = JsonImportOptions::parse(options_json)?;
    let target = options.target()?;
    let stream = files.open(path)?;

    let shape = match options.declared_shape() {
        Some(shape) => shape,
        None => {
            let inferred = infer_table_shape(stream.clone())?;
            debug!(%inferred, "inferred JSON table shape");
            inferred
        }
    };
    let reader = JsonTableReader::try_new(stream, shape, batch_size)?;
    register_source(conn, target, Box::new(reader))
}

/// Inspect the top-level structure of a JSON document.
pub fn infer_table_shape(stream: InputFileStream) -> Result<TableShape, WebDbError> {
    let mut values = serde_json::Deserializer::from_reader(stream).into_iter::<Probe>();
    let first = match values.next() {
        Some(Ok(probe)) => probe,
        Some(Err(err)) => return Err(invalid_json(err)),
        None => return Err(malformed("JSON input is empty")),
    };
    let more = match values.next() {
        Some(Ok(_)) => true,
        Some(Err(err)) => return Err(invalid_json(err)),
        None => false,
    };

    match (first, more) {
        (Probe::Object { .. }, true) => Ok(TableShape::Ndjson),
        (Probe::Array, false) => Ok(TableShape::RowArray),
        (
            Probe::Object {
                members,
                all_arrays: true,
            },
            false,
        ) if members > 0 => Ok(TableShape::ColumnObject),
        (Probe::Object { .. }, false) => Ok(TableShape::Record),
        (Probe::Array, true) => Err(malformed("a sequence of JSON values must consist of objects")),
        (Probe::Scalar, _) => Err(malformed("top-level JSON value must be an object or an array")),
    }
}

/// Arrow reader over a JSON document in one of the supported layouts.
pub struct JsonTableReader {
    schema: SchemaRef,
    rows: RowSource,
}

enum RowSource {
    /// Rows materialized as JSON objects, decoded `batch_size` at a time.
    Buffered {
        rows: std::vec::IntoIter<Value>,
        decoder: Decoder,
        batch_size: usize,
    },
    Lines(arrow_json::Reader<InputFileStream>),
}

impl JsonTableReader {
    pub fn try_new(
        stream: InputFileStream,
        shape: TableShape,
        batch_size: usize,
    ) -> Result<Self, WebDbError> {
        let batch_size = batch_size.max(1);
        let rows = match shape {
            TableShape::Ndjson => return Self::lines(stream, batch_size),
            TableShape::RowArray => row_array(parse_document(stream)?)?,
            TableShape::ColumnObject => column_object(parse_document(stream)?)?,
            TableShape::Record => match parse_document(stream)? {
                record @ Value::Object(_) => vec![record],
                _ => return Err(shape_mismatch(shape)),
            },
            TableShape::Unrecognized => return Err(shape_mismatch(shape)),
        };

        let inferred = infer_json_schema_from_iterator(rows.iter().cloned().map(Ok))?;
        let schema = Arc::new(widen_null_types(&inferred));
        let decoder = ReaderBuilder::new(schema.clone())
            .with_batch_size(batch_size)
            .with_coerce_primitive(true)
            .build_decoder()?;
        Ok(Self {
            schema,
            rows: RowSource::Buffered {
                rows: rows.into_iter(),
                decoder,
                batch_size,
            },
        })
    }

    /// Objects separated by any whitespace, not only newlines.
    fn lines(stream: InputFileStream, batch_size: usize) -> Result<Self, WebDbError> {
        let mut values = serde_json::Deserializer::from_reader(stream.clone()).into_iter::<Value>();
        let mut failure = None;
        let inferred = infer_json_schema_from_iterator(std::iter::from_fn(|| {
            match values.next()? {
                Ok(value) => Some(Ok(value)),
                Err(err) => {
                    failure = Some(err);
                    None
                }
            }
        }));
        if let Some(err) = failure {
            return Err(invalid_json(err));
        }
        let inferred = inferred.map_err(|err| malformed(format!("invalid JSON record: {err}")))?;
        let schema = Arc::new(widen_null_types(&inferred));
        let reader = ReaderBuilder::new(schema.clone())
            .with_batch_size(batch_size)
            .with_coerce_primitive(true)
            .build(stream)?;
        Ok(Self {
            schema,
            rows: RowSource::Lines(reader),
        })
    }
}

impl RecordBatchSource for JsonTableReader {
    fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    fn next_batch(&mut self) -> Result<Option<RecordBatch>, WebDbError> {
        match &mut self.rows {
            RowSource::Buffered {
                rows,
                decoder,
                batch_size,
            } => {
                let chunk: Vec<Value> = rows.by_ref().take(*batch_size).collect();
                if chunk.is_empty() {
                    return Ok(None);
                }
                decoder.serialize(&chunk)?;
                Ok(decoder.flush()?)
            }
            RowSource::Lines(reader) => Ok(reader.next().transpose()?),
        }
    }
}

fn parse_document(stream: InputFileStream) -> Result<Value, WebDbError> {
    serde_json::from_reader(stream).map_err(invalid_json)
}

fn row_array(document: Value) -> Result<Vec<Value>, WebDbError> {
    let Value::Array(rows) = document else {
        return Err(shape_mismatch(TableShape::RowArray));
    };
    if rows.iter().any(|row| !row.is_object()) {
        return Err(malformed("row-array elements must be JSON objects"));
    }
    Ok(rows)
}

/// Transpose `{"col": [v0, v1, ...]}` into row objects. Short columns are padded with nulls.
fn column_object(document: Value) -> Result<Vec<Value>, WebDbError> {
    let Value::Object(columns) = document else {
        return Err(shape_mismatch(TableShape::ColumnObject));
    };
    let mut names = Vec::with_capacity(columns.len());
    let mut values = Vec::with_capacity(columns.len());
    for (name, column) in columns {
        let Value::Array(column) = column else {
            return Err(malformed(format!("column '{name}' is not a JSON array")));
        };
        names.push(name);
        values.push(column.into_iter());
    }

    let row_count = values.iter().map(|column| column.len()).max().unwrap_or(0);
    let mut rows = Vec::with_capacity(row_count);
    for _ in 0..row_count {
        let mut row = Map::with_capacity(names.len());
        for (name, column) in names.iter().zip(values.iter_mut()) {
            row.insert(name.clone(), column.next().unwrap_or(Value::Null));
        }
        rows.push(Value::Object(row));
    }
    Ok(rows)
}

/// Problems with the file contents; only the options payload is an invalid argument.
fn malformed(message: impl Into<String>) -> WebDbError {
    WebDbError::Unknown(message.into())
}

fn shape_mismatch(shape: TableShape) -> WebDbError {
    malformed(format!("JSON input does not have the {shape} layout"))
}

fn invalid_json(err: serde_json::Error) -> WebDbError {
    malformed(format!("invalid JSON input: {err}"))
}

/// Top-level structure of a JSON value, read without materializing it.
enum Probe {
    Array,
    Object { members: usize, all_arrays: bool },
    Scalar,
}

/// Whether a member value is an array, with the value itself skipped.
struct IsArray(bool);

macro_rules! scalar_visits {
    ($value:expr) => {
        fn visit_bool<E: de::Error>(self, _: bool) -> Result<Self::Value, E> {
            Ok($value)
        }
        fn visit_i64<E: de::Error>(self, _: i64) -> Result<Self::Value, E> {
            Ok($value)
        }
        fn visit_u64<E: de::Error>(self, _: u64) -> Result<Self::Value, E> {
            Ok($value)
        }
        fn visit_f64<E: de::Error>(self, _: f64) -> Result<Self::Value, E> {
            Ok($value)
        }
        fn visit_str<E: de::Error>(self, _: &str) -> Result<Self::Value, E> {
            Ok($value)
        }
        fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
            Ok($value)
        }
    };
}

struct ProbeVisitor;

impl<'de> Visitor<'de> for ProbeVisitor {
    type Value = Probe;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a JSON value")
    }

    scalar_visits!(Probe::Scalar);

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Probe, A::Error> {
        while seq.next_element::<IgnoredAny>()?.is_some() {}
        Ok(Probe::Array)
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Probe, A::Error> {
        let mut members = 0usize;
        let mut all_arrays = true;
        while map.next_key::<IgnoredAny>()?.is_some() {
            let IsArray(is_array) = map.next_value()?;
            all_arrays &= is_array;
            members += 1;
        }
        Ok(Probe::Object {
            members,
            all_arrays,
        })
    }
}

impl<'de> Deserialize<'de> for Probe {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(ProbeVisitor)
    }
}

struct IsArrayVisitor;

impl<'de> Visitor<'de> for IsArrayVisitor {
    type Value = IsArray;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a JSON value")
    }

    scalar_visits!(IsArray(false));

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<IsArray, A::Error> {
        while seq.next_element::<IgnoredAny>()?.is_some() {}
        Ok(IsArray(true))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<IsArray, A::Error> {
        while map.next_entry::<IgnoredAny, IgnoredAny>()?.is_some() {}
        Ok(IsArray(false))
    }
}

impl<'de> Deserialize<'de> for IsArray {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(IsArrayVisitor)
    }
}
