//! Type and SQL text helpers shared by the engine and the import pipeline.
//!
//! Arrow types coming out of external readers are mapped onto DuckDB column
//! types here, and every identifier or literal spliced into generated SQL goes
//! through the quoting helpers.

use arrow_schema::{DataType, Field, Fields, Schema};

use crate::error::WebDbError;

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// `"schema"."table"`
pub fn qualified_name(schema: &str, table: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(table))
}

/// Map an Arrow type to the DuckDB column type used when creating tables.
pub fn arrow_type_to_duckdb(dt: &DataType) -> Result<String, WebDbError> {
    let t = match dt {
        DataType::Null => "VARCHAR",
        DataType::Int8 => "TINYINT",
        DataType::Int16 => "SMALLINT",
        DataType::Int32 => "INTEGER",
        DataType::Int64 => "BIGINT",
        DataType::UInt8 => "UTINYINT",
        DataType::UInt16 => "USMALLINT",
        DataType::UInt32 => "UINTEGER",
        DataType::UInt64 => "UBIGINT",
        DataType::Float16 | DataType::Float32 => "FLOAT",
        DataType::Float64 => "DOUBLE",
        DataType::Utf8 | DataType::LargeUtf8 | DataType::Utf8View => "VARCHAR",
        DataType::Binary | DataType::FixedSizeBinary(_) | DataType::LargeBinary => "BLOB",
        DataType::Boolean => "BOOLEAN",
        DataType::Date32 => "DATE",
        DataType::Date64 => "TIMESTAMP",
        DataType::Timestamp(_, None) => "TIMESTAMP",
        DataType::Timestamp(_, Some(_)) => "TIMESTAMPTZ",
        DataType::Time32(_) | DataType::Time64(_) => "TIME",
        DataType::Interval(_) => "INTERVAL",
        DataType::Decimal128(p, s) | DataType::Decimal256(p, s) => {
            let scale = (*s).max(0);
            return Ok(format!("DECIMAL({}, {})", p, scale));
        }
        DataType::List(field) | DataType::LargeList(field) => {
            let inner = arrow_type_to_duckdb(field.data_type())?;
            return Ok(format!("{}[]", inner));
        }
        DataType::Struct(fields) => {
            let mut members = Vec::with_capacity(fields.len());
            for field in fields {
                members.push(format!(
                    "{} {}",
                    quote_ident(field.name()),
                    arrow_type_to_duckdb(field.data_type())?
                ));
            }
            return Ok(format!("STRUCT({})", members.join(", ")));
        }
        _ => {
            return Err(WebDbError::Conversion(format!(
                "unsupported arrow type for table creation: {dt:?}"
            )))
        }
    };
    Ok(t.to_string())
}

/// Replace `Null` columns (all values missing during inference) with nullable text.
pub fn widen_null_types(schema: &Schema) -> Schema {
    let fields: Vec<Field> = schema
        .fields()
        .iter()
        .map(|field| widen_field(field))
        .collect();
    Schema::new_with_metadata(fields, schema.metadata().clone())
}

fn widen_field(field: &Field) -> Field {
    let data_type = match field.data_type() {
        DataType::Null => DataType::Utf8,
        DataType::List(inner) => DataType::List(widen_field(inner).into()),
        DataType::Struct(children) => DataType::Struct(
            children
                .iter()
                .map(|child| widen_field(child))
                .collect::<Fields>(),
        ),
        other => other.clone(),
    };
    Field::new(field.name(), data_type, true)
}

pub fn build_create_table_sql(
    schema_name: &str,
    table: &str,
    schema: &Schema,
) -> Result<String, WebDbError> {
    if schema.fields().is_empty() {
        return Err(WebDbError::Execution(format!(
            "cannot create table {table} without columns"
        )));
    }
    let mut cols = Vec::with_capacity(schema.fields().len());
    for field in schema.fields() {
        let col_type = arrow_type_to_duckdb(field.data_type())?;
        let nullable = if field.is_nullable() { "" } else { " NOT NULL" };
        cols.push(format!(
            "{} {}{}",
            quote_ident(field.name()),
            col_type,
            nullable
        ));
    }
    Ok(format!(
        "CREATE TABLE {} ({});",
        qualified_name(schema_name, table),
        cols.join(", ")
    ))
}
