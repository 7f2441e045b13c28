//! Arrow IPC framing for query results.
//!
//! A streamed query produces one schema message followed by one message per
//! batch; concatenated they form a valid IPC stream. A fully buffered query is
//! written in the IPC file format instead.

use arrow_array::RecordBatch;
use arrow_ipc::writer::{
    write_message, DictionaryTracker, FileWriter, IpcDataGenerator, IpcWriteOptions,
};
use arrow_schema::Schema;

use crate::error::WebDbError;

/// Encoder for one result stream.
///
/// The dictionary tracker lives as long as the stream so dictionary ids stay
/// stable between the schema message and every later batch message.
pub struct StreamEncoder {
    generator: IpcDataGenerator,
    dictionaries: DictionaryTracker,
    options: IpcWriteOptions,
}

impl StreamEncoder {
    pub fn new() -> Self {
        Self {
            generator: IpcDataGenerator::default(),
            dictionaries: DictionaryTracker::new(false),
            options: IpcWriteOptions::default(),
        }
    }

    pub fn encode_schema(&mut self, schema: &Schema) -> Result<Vec<u8>, WebDbError> {
        let encoded = self.generator.schema_to_bytes_with_dictionary_tracker(
            schema,
            &mut self.dictionaries,
            &self.options,
        );
        let mut buffer = vec![];
        write_message(&mut buffer, encoded, &self.options)?;
        Ok(buffer)
    }

    /// Encode a batch, preceded by any dictionary messages it needs.
    pub fn encode_batch(&mut self, batch: &RecordBatch) -> Result<Vec<u8>, WebDbError> {
        let (dictionaries, encoded) =
            self.generator
                .encoded_batch(batch, &mut self.dictionaries, &self.options)?;
        let mut buffer = vec![];
        for dictionary in dictionaries {
            write_message(&mut buffer, dictionary, &self.options)?;
        }
        write_message(&mut buffer, encoded, &self.options)?;
        Ok(buffer)
    }
}

impl Default for StreamEncoder {
    fn default() -> Self {
        Self::new()
    }
}

/// In-memory IPC file writer used by the fully buffered query mode.
pub struct FileEncoder {
    writer: FileWriter<Vec<u8>>,
    batches: usize,
    rows: usize,
}

impl FileEncoder {
    pub fn try_new(schema: &Schema) -> Result<Self, WebDbError> {
        Ok(Self {
            writer: FileWriter::try_new(Vec::new(), schema)?,
            batches: 0,
            rows: 0,
        })
    }

    pub fn write(&mut self, batch: &RecordBatch) -> Result<(), WebDbError> {
        self.writer.write(batch)?;
        self.batches += 1;
        self.rows += batch.num_rows();
        Ok(())
    }

    pub fn batches(&self) -> usize {
        self.batches
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Write the footer and hand back the complete file.
    pub fn finish(mut self) -> Result<Vec<u8>, WebDbError> {
        self.writer.finish()?;
        Ok(self.writer.into_inner()?)
    }
}
