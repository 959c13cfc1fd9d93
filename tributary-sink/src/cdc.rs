use tributary_types::{ChangeKind, DataType, FieldValue, Record, Schema};

use crate::config::SinkConfig;
use crate::error::{SinkError, SinkResult};
use crate::partition::{BucketId, PartitionGenerator, PartitionValues};
use crate::{config_err, schema_err};

/// Everything the sink derives from a record before writing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputedRecord {
    pub partition_path: String,
    pub bucket_id: BucketId,
    pub partition_values: PartitionValues,
    pub change_kind: ChangeKind,
    /// Empty unless change-data-capture is enabled.
    pub record_key: String,
    /// False for deletes and update-befores.
    pub exists: bool,
}

/// Output columns the encoder fills from a [`ComputedRecord`] rather than from the record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CdcColumns {
    /// Existing column whose raw marker is replaced by the normalized change kind.
    pub change: Option<String>,
    pub exists: Option<String>,
    pub record_key: Option<String>,
}

/// Wraps a [`PartitionGenerator`] and classifies change-data-capture records.
#[derive(Debug, Clone)]
pub struct CdcPartitionComputer {
    generator: PartitionGenerator,
    change_column: Option<(String, usize)>,
    exists_column: Option<String>,
    record_key_column: Option<String>,
}

impl CdcPartitionComputer {
    pub fn try_new(schema: &Schema, config: &SinkConfig) -> SinkResult<Self> {
        let generator = PartitionGenerator::try_new(
            schema,
            &config.partition_fields,
            &config.record_key_fields,
            config.default_partition(),
        )?;

        let change_column = if config.cdc.enabled {
            let column = &config.cdc.change_column;
            if config.record_key_fields.is_empty() {
                return Err(config_err!(
                    "change-data-capture requires at least one record key column"
                ));
            }
            if config.partition_fields.contains(column) {
                return Err(config_err!(
                    "change column '{}' cannot also be a partition column",
                    column
                ));
            }
            let idx = schema.index_of(column).ok_or_else(|| {
                schema_err!(
                    "change column '{}' does not exist in the schema",
                    column
                )
            })?;
            if schema.fields[idx].data_type != DataType::Utf8 {
                return Err(schema_err!(
                    "change column '{}' must be a string column, found {:?}",
                    column,
                    schema.fields[idx].data_type
                ));
            }
            Some((column.clone(), idx))
        } else {
            None
        };

        let exists_column = config.cdc.exists_column.clone();
        let record_key_column = config.cdc.record_key_column.clone();
        for column in exists_column.iter().chain(record_key_column.iter()) {
            if change_column.is_none() {
                return Err(config_err!(
                    "output column '{}' requires change-data-capture",
                    column
                ));
            }
            if schema.index_of(column).is_some() {
                return Err(config_err!(
                    "output column '{}' already exists in the schema",
                    column
                ));
            }
        }
        if let (Some(exists), Some(key)) = (&exists_column, &record_key_column) {
            if exists == key {
                return Err(config_err!(
                    "exists and record key columns must differ, both are '{}'",
                    exists
                ));
            }
        }

        Ok(Self {
            generator,
            change_column,
            exists_column,
            record_key_column,
        })
    }

    pub fn generator(&self) -> &PartitionGenerator {
        &self.generator
    }

    pub fn cdc_enabled(&self) -> bool {
        self.change_column.is_some()
    }

    pub fn change_column(&self) -> Option<&str> {
        self.change_column.as_ref().map(|(name, _)| name.as_str())
    }

    pub fn output_columns(&self) -> CdcColumns {
        CdcColumns {
            change: self.change_column().map(|c| c.to_string()),
            exists: self.exists_column.clone(),
            record_key: self.record_key_column.clone(),
        }
    }

    /// The change kind and dedup key of a record; `(Insert, "")` without change-data-capture.
    pub fn change_metadata(&self, record: &Record) -> SinkResult<(ChangeKind, String)> {
        let Some((name, idx)) = &self.change_column else {
            return Ok((ChangeKind::Insert, String::new()));
        };

        let kind = match record.value(*idx) {
            FieldValue::Null => ChangeKind::Insert,
            FieldValue::Utf8(marker) => marker.parse().map_err(|e| {
                SinkError::InvalidRecord(format!("column '{}': {}", name, e))
            })?,
            other => {
                return Err(SinkError::InvalidRecord(format!(
                    "column '{}' holds {:?}, expected a change marker",
                    name, other
                )))
            }
        };

        Ok((kind, self.generator.record_key(record)))
    }

    pub fn compute_record(&self, record: &Record) -> SinkResult<ComputedRecord> {
        let partition_values = self.generator.partition_values(record);
        let partition_path = crate::partition::partition_path(&partition_values);
        self.finish(record, partition_path, partition_values)
    }

    /// Completes a record whose partition path was already resolved, e.g. from a cache.
    pub(crate) fn finish(
        &self,
        record: &Record,
        partition_path: String,
        partition_values: PartitionValues,
    ) -> SinkResult<ComputedRecord> {
        let (change_kind, record_key) = self.change_metadata(record)?;
        Ok(ComputedRecord {
            bucket_id: BucketId::new(partition_path.clone()),
            partition_path,
            partition_values,
            change_kind,
            record_key,
            exists: change_kind.row_exists(),
        })
    }
}
