//! Decoding of result payloads and table rendering.

use std::io::Cursor;

use anyhow::{Context, Result};
use arrow_array::RecordBatch;
use arrow_buffer::Buffer;
use arrow_cast::display::{ArrayFormatter, FormatOptions};
use arrow_ipc::reader::{FileReader, StreamDecoder};
use arrow_schema::SchemaRef;
use comfy_table::{
    modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Cell, CellAlignment, Color,
    ContentArrangement, Table,
};

/// Decoded query result.
pub struct QueryOutput {
    pub schema: SchemaRef,
    pub batches: Vec<RecordBatch>,
}

impl QueryOutput {
    pub fn rows(&self) -> usize {
        self.batches.iter().map(RecordBatch::num_rows).sum()
    }
}

/// Incremental decoder for a schema message followed by batch messages.
pub struct StreamCollector {
    decoder: StreamDecoder,
    batches: Vec<RecordBatch>,
}

impl StreamCollector {
    pub fn new() -> Self {
        Self {
            decoder: StreamDecoder::new(),
            batches: Vec::new(),
        }
    }

    pub fn push(&mut self, payload: Vec<u8>) -> Result<()> {
        let mut buffer = Buffer::from_vec(payload);
        while !buffer.is_empty() {
            match self.decoder.decode(&mut buffer)? {
                Some(batch) => self.batches.push(batch),
                None => break,
            }
        }
        Ok(())
    }

    pub fn finish(self) -> Result<QueryOutput> {
        let schema = self
            .decoder
            .schema()
            .context("result stream did not start with a schema message")?;
        Ok(QueryOutput {
            schema,
            batches: self.batches,
        })
    }
}

/// Decode a complete IPC file.
pub fn read_file(bytes: Vec<u8>) -> Result<QueryOutput> {
    let reader = FileReader::try_new(Cursor::new(bytes), None)?;
    let schema = reader.schema();
    let batches = reader.collect::<Result<Vec<_>, _>>()?;
    Ok(QueryOutput { schema, batches })
}

pub fn render(output: &QueryOutput) -> Result<Table> {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic);

    table.set_header(output.schema.fields().iter().map(|field| {
        Cell::new(field.name())
            .fg(Color::Cyan)
            .set_alignment(CellAlignment::Center)
    }));

    let options = FormatOptions::default().with_null("NULL");
    for batch in &output.batches {
        let formatters = batch
            .columns()
            .iter()
            .map(|column| ArrayFormatter::try_new(column.as_ref(), &options))
            .collect::<Result<Vec<_>, _>>()?;
        for row in 0..batch.num_rows() {
            table.add_row(
                formatters
                    .iter()
                    .map(|formatter| Cell::new(formatter.value(row).to_string())),
            );
        }
    }
    Ok(table)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow_array::{Int32Array, StringArray};
    use arrow_ipc::writer::StreamWriter;
    use arrow_schema::{DataType, Field, Schema};

    use super::*;

    fn sample() -> Result<RecordBatch> {
        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int32, false),
            Field::new("name", DataType::Utf8, true),
        ]));
        Ok(RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int32Array::from(vec![1, 2])),
                Arc::new(StringArray::from(vec![Some("ada"), None])),
            ],
        )?)
    }

    #[test]
    fn collector_decodes_payloads_split_at_any_point() -> Result<()> {
        let batch = sample()?;
        let mut writer = StreamWriter::try_new(Vec::new(), batch.schema().as_ref())?;
        writer.write(&batch)?;
        writer.write(&batch)?;
        writer.finish()?;
        let bytes = writer.into_inner()?;

        let mut collector = StreamCollector::new();
        let (head, tail) = bytes.split_at(bytes.len() / 3);
        collector.push(head.to_vec())?;
        collector.push(tail.to_vec())?;
        let output = collector.finish()?;
        assert_eq!(output.rows(), 4);
        assert_eq!(output.schema.field(1).name(), "name");
        Ok(())
    }

    #[test]
    fn render_prints_nulls() -> Result<()> {
        let batch = sample()?;
        let output = QueryOutput {
            schema: batch.schema(),
            batches: vec![batch],
        };
        let text = render(&output)?.to_string();
        assert!(text.contains("ada"));
        assert!(text.contains("NULL"));
        Ok(())
    }
}
