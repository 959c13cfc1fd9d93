use std::fmt::Debug;
use std::sync::Arc;

use serde_json::{Map, Value};
use tributary_types::{Record, Schema};

use crate::cdc::{CdcColumns, ComputedRecord};
use crate::error::{SinkError, SinkResult};

/// Serializes records into the bytes of one part file. Bytes are buffered until `flush`.
pub trait Encoder: Send {
    /// Buffers one record, returning the number of bytes it added.
    fn write(&mut self, record: &Record, computed: &ComputedRecord) -> SinkResult<usize>;

    /// Takes everything buffered so far.
    fn flush(&mut self) -> Vec<u8>;

    /// Takes the remaining buffered bytes plus any trailer the format requires.
    fn close(&mut self) -> Vec<u8>;
}

pub trait EncoderFactory: Send + Sync + Debug {
    fn create(&self) -> Box<dyn Encoder>;

    fn suffix(&self) -> &str;
}

/// Newline-delimited JSON. Partition columns are left out of the body since they are encoded in
/// the file's directory; the exists and record key columns, when configured, follow the record's
/// own columns.
#[derive(Debug, Clone)]
pub struct JsonEncoderFactory {
    columns: Arc<Vec<(String, usize)>>,
    cdc: Arc<CdcColumns>,
}

impl JsonEncoderFactory {
    pub fn new(schema: &Schema, partition_fields: &[String], cdc: CdcColumns) -> Self {
        let columns = schema
            .fields
            .iter()
            .enumerate()
            .filter(|(_, f)| !partition_fields.contains(&f.name))
            .map(|(i, f)| (f.name.clone(), i))
            .collect();
        Self {
            columns: Arc::new(columns),
            cdc: Arc::new(cdc),
        }
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.columns
            .iter()
            .map(|(name, _)| name.as_str())
            .chain(self.cdc.exists.as_deref())
            .chain(self.cdc.record_key.as_deref())
    }
}

impl EncoderFactory for JsonEncoderFactory {
    fn create(&self) -> Box<dyn Encoder> {
        Box::new(JsonEncoder {
            columns: self.columns.clone(),
            cdc: self.cdc.clone(),
            buffer: Vec::new(),
        })
    }

    fn suffix(&self) -> &str {
        ".json"
    }
}

pub struct JsonEncoder {
    columns: Arc<Vec<(String, usize)>>,
    cdc: Arc<CdcColumns>,
    buffer: Vec<u8>,
}

impl Encoder for JsonEncoder {
    fn write(&mut self, record: &Record, computed: &ComputedRecord) -> SinkResult<usize> {
        let mut object = Map::with_capacity(self.columns.len() + 2);
        for (name, idx) in self.columns.iter() {
            let value = if self.cdc.change.as_deref() == Some(name.as_str()) {
                Value::String(computed.change_kind.as_str().to_string())
            } else {
                record.value(*idx).to_json()
            };
            object.insert(name.clone(), value);
        }
        if let Some(name) = &self.cdc.exists {
            object.insert(name.clone(), Value::Bool(computed.exists));
        }
        if let Some(name) = &self.cdc.record_key {
            object.insert(name.clone(), Value::String(computed.record_key.clone()));
        }

        let start = self.buffer.len();
        serde_json::to_writer(&mut self.buffer, &Value::Object(object)).map_err(|e| {
            self.buffer.truncate(start);
            SinkError::InvalidRecord(format!("failed to encode record as JSON: {}", e))
        })?;
        self.buffer.push(b'\n');
        Ok(self.buffer.len() - start)
    }

    fn flush(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buffer)
    }

    fn close(&mut self) -> Vec<u8> {
        self.flush()
    }
}
