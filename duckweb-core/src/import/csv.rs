//! CSV table import through the engine's own auto-detecting scanner.

use serde::Deserialize;
use tracing::{info, instrument};

use crate::engine::DuckDbConnection;
use crate::error::WebDbError;
use crate::import::{ensure_schema, in_transaction, ImportTarget};
use crate::io::FileSystemBuffer;
use crate::types::{qualified_name, quote_literal};

/// Options payload accepted by the CSV import.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CsvImportOptions {
    pub schema: Option<String>,
    pub name: Option<String>,
    pub header: Option<bool>,
    pub delimiter: Option<String>,
    pub quote: Option<String>,
    pub escape: Option<String>,
    pub skip: Option<u64>,
    pub date_format: Option<String>,
    pub timestamp_format: Option<String>,
}

impl CsvImportOptions {
    pub fn parse(json: &str) -> Result<Self, WebDbError> {
        serde_json::from_str(json)
            .map_err(|err| WebDbError::InvalidArgument(format!("invalid CSV import options: {err}")))
    }

    pub fn target(&self) -> Result<ImportTarget, WebDbError> {
        ImportTarget::resolve(self.schema.as_deref(), self.name.as_deref())
    }

    /// Named `read_csv_auto` parameters for the knobs that were given.
    fn scan_parameters(&self) -> Vec<String> {
        let mut params = Vec::new();
        if let Some(header) = self.header {
            params.push(format!("header={header}"));
        }
        let strings = [
            ("delim", &self.delimiter),
            ("quote", &self.quote),
            ("escape", &self.escape),
            ("dateformat", &self.date_format),
            ("timestampformat", &self.timestamp_format),
        ];
        for (key, value) in strings {
            if let Some(value) = value {
                params.push(format!("{key}={}", quote_literal(value)));
            }
        }
        if let Some(skip) = self.skip {
            params.push(format!("skip={skip}"));
        }
        params
    }

    fn create_table_sql(&self, target: &ImportTarget, path: &str) -> String {
        let mut args = vec![quote_literal(path)];
        args.extend(self.scan_parameters());
        format!(
            "CREATE TABLE {} AS SELECT * FROM read_csv_auto({});",
            qualified_name(&target.schema, &target.table),
            args.join(", ")
        )
    }
}

/// Import the CSV file at `path` as a new table.
#[instrument(skip(conn, files, options_json), fields(connection_id = %conn.id()))]
pub fn import_csv_table(
    conn: &DuckDbConnection,
    files: &FileSystemBuffer,
    path: &str,
    options_json: &str,
) -> Result<(), WebDbError> {
    let options = CsvImportOptions::parse(options_json)?;
    let target = options.target()?;
    files.flush_file(path)?;

    let sql = options.create_table_sql(&target, path);
    let schema = target.schema.clone();
    conn.with_conn(move |conn| {
        in_transaction(conn, |tx| {
            ensure_schema(tx, &schema)?;
            tx.execute_batch(&sql)?;
            Ok(())
        })
    })?;
    info!(schema = %target.schema, table = %target.table, "imported csv table");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_given_knobs_reach_the_scan() -> Result<(), WebDbError> {
        let options = CsvImportOptions::parse(
            r#"{"name":"t","header":true,"delimiter":"|","skip":2,"dateFormat":"%d.%m.%Y"}"#,
        )?;
        let target = options.target()?;
        assert_eq!(
            options.create_table_sql(&target, "/tmp/in.csv"),
            "CREATE TABLE \"main\".\"t\" AS SELECT * FROM read_csv_auto('/tmp/in.csv', \
             header=true, delim='|', dateformat='%d.%m.%Y', skip=2);"
        );
        Ok(())
    }

    #[test]
    fn paths_and_values_are_quoted_as_literals() -> Result<(), WebDbError> {
        let options = CsvImportOptions::parse(r#"{"schema":"s","name":"t","quote":"'"}"#)?;
        let sql = options.create_table_sql(&options.target()?, "it's.csv");
        assert!(sql.contains("read_csv_auto('it''s.csv', quote='''')"));
        assert!(sql.starts_with("CREATE TABLE \"s\".\"t\""));
        Ok(())
    }

    #[test]
    fn malformed_or_nameless_options_are_invalid_arguments() {
        assert!(matches!(
            CsvImportOptions::parse("not json"),
            Err(WebDbError::InvalidArgument(_))
        ));
        let nameless = CsvImportOptions::parse(r#"{"schema":"s"}"#).and_then(|o| o.target());
        assert!(matches!(nameless, Err(WebDbError::InvalidArgument(_))));
    }
}
