use std::collections::HashSet;
use std::fmt::{Display, Formatter};

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use tributary_types::{Record, Schema};

use crate::config_err;
use crate::error::SinkResult;

pub const NULL_KEY_VALUE: &str = "__null__";
const KEY_SEPARATOR: char = ',';

/// Identifies one logical partition. Equal partition-column values always produce equal ids.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Encode, Decode, Serialize, Deserialize,
)]
pub struct BucketId(String);

impl BucketId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The bucket of an unpartitioned table.
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }
}

impl Display for BucketId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// `(column, value)` pairs in partition-column order, after default substitution.
pub type PartitionValues = Vec<(String, String)>;

fn needs_escape(c: char) -> bool {
    c.is_control()
        || matches!(
            c,
            '/' | '\\' | '=' | ':' | '%' | '#' | '?' | '*' | '"' | '<' | '>' | '|' | '\''
        )
}

/// Percent-escapes characters that would change the meaning of a partition directory name.
pub fn escape_path_name(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if needs_escape(c) {
            let mut buf = [0u8; 4];
            for b in c.encode_utf8(&mut buf).bytes() {
                escaped.push_str(&format!("%{:02X}", b));
            }
        } else {
            escaped.push(c);
        }
    }
    escaped
}

/// Joins partition values into a hive-style `col=value/...` path.
pub fn partition_path(values: &PartitionValues) -> String {
    values
        .iter()
        .map(|(column, value)| format!("{}={}", escape_path_name(column), escape_path_name(value)))
        .collect::<Vec<_>>()
        .join("/")
}

fn resolve_columns(schema: &Schema, names: &[String], kind: &str) -> SinkResult<Vec<(String, usize)>> {
    let mut seen = HashSet::new();
    names
        .iter()
        .map(|name| {
            if !seen.insert(name.as_str()) {
                return Err(config_err!("{} column '{}' is listed twice", kind, name));
            }
            schema
                .index_of(name)
                .map(|idx| (name.clone(), idx))
                .ok_or_else(|| {
                    config_err!("{} column '{}' does not exist in the schema", kind, name)
                })
        })
        .collect()
}

/// Derives partition paths, bucket ids and record keys from records of a fixed schema.
#[derive(Debug, Clone)]
pub struct PartitionGenerator {
    partition_columns: Vec<(String, usize)>,
    key_columns: Vec<(String, usize)>,
    default_partition: String,
}

impl PartitionGenerator {
    pub fn try_new(
        schema: &Schema,
        partition_fields: &[String],
        record_key_fields: &[String],
        default_partition: impl Into<String>,
    ) -> SinkResult<Self> {
        let default_partition = default_partition.into();
        if default_partition.is_empty() {
            return Err(config_err!("default partition value must not be empty"));
        }
        Ok(Self {
            partition_columns: resolve_columns(schema, partition_fields, "partition")?,
            key_columns: resolve_columns(schema, record_key_fields, "record key")?,
            default_partition,
        })
    }

    pub fn is_partitioned(&self) -> bool {
        !self.partition_columns.is_empty()
    }

    pub fn partition_columns(&self) -> impl Iterator<Item = &str> {
        self.partition_columns.iter().map(|(name, _)| name.as_str())
    }

    pub fn has_record_key(&self) -> bool {
        !self.key_columns.is_empty()
    }

    pub fn default_partition(&self) -> &str {
        &self.default_partition
    }

    pub fn partition_values(&self, record: &Record) -> PartitionValues {
        self.partition_columns
            .iter()
            .map(|(name, idx)| {
                let value = record
                    .value(*idx)
                    .render()
                    .filter(|v| !v.is_empty())
                    .unwrap_or_else(|| self.default_partition.clone());
                (name.clone(), value)
            })
            .collect()
    }

    pub fn compute_bucket_path(&self, record: &Record) -> (String, BucketId) {
        let path = partition_path(&self.partition_values(record));
        let id = BucketId::new(path.clone());
        (path, id)
    }

    /// Key columns rendered and joined with `,`; null values become [`NULL_KEY_VALUE`].
    pub fn record_key(&self, record: &Record) -> String {
        let mut key = String::new();
        for (i, (_, idx)) in self.key_columns.iter().enumerate() {
            if i > 0 {
                key.push(KEY_SEPARATOR);
            }
            match record.value(*idx).render() {
                Some(v) => key.push_str(&v),
                None => key.push_str(NULL_KEY_VALUE),
            }
        }
        key
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::SystemTime;
    use test_case::test_case;
    use tributary_types::{DataType, Field, FieldValue};

    fn schema() -> Schema {
        Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("region", DataType::Utf8, true),
            Field::new("date", DataType::Utf8, true),
            Field::new("amount", DataType::Float64, true),
        ])
    }

    fn record(id: i64, region: Option<&str>, date: &str) -> Record {
        Record::new(
            SystemTime::now(),
            vec![
                FieldValue::Int64(id),
                region
                    .map(|r| FieldValue::Utf8(r.to_string()))
                    .unwrap_or(FieldValue::Null),
                FieldValue::Utf8(date.to_string()),
                FieldValue::Float64(1.0),
            ],
        )
    }

    fn generator(partitions: &[&str], keys: &[&str]) -> PartitionGenerator {
        PartitionGenerator::try_new(
            &schema(),
            &partitions.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
            &keys.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
            "default_partition",
        )
        .unwrap()
    }

    #[test]
    fn test_same_partition_values_same_bucket() {
        let generator = generator(&["region", "date"], &[]);
        let (path_a, id_a) = generator.compute_bucket_path(&record(1, Some("us"), "2024-01-01"));
        let (path_b, id_b) = generator.compute_bucket_path(&record(2, Some("us"), "2024-01-01"));
        let (_, id_c) = generator.compute_bucket_path(&record(3, Some("eu"), "2024-01-01"));

        assert_eq!(path_a, "region=us/date=2024-01-01");
        assert_eq!(path_a, path_b);
        assert_eq!(id_a, id_b);
        assert_ne!(id_a, id_c);
    }

    #[test]
    fn test_null_and_empty_use_default_partition() {
        let generator = generator(&["region", "date"], &[]);
        let (null_path, null_id) = generator.compute_bucket_path(&record(1, None, "d"));
        let (empty_path, empty_id) = generator.compute_bucket_path(&record(1, Some(""), "d"));
        assert_eq!(null_path, "region=default_partition/date=d");
        assert_eq!(null_path, empty_path);
        assert_eq!(null_id, empty_id);
    }

    #[test]
    fn test_unpartitioned_bucket_is_root() {
        let generator = generator(&[], &[]);
        let (path, id) = generator.compute_bucket_path(&record(1, Some("us"), "d"));
        assert_eq!(path, "");
        assert!(id.is_root());
        assert!(!generator.is_partitioned());
    }

    #[test_case("us-east", "us-east"; "plain")]
    #[test_case("a/b", "a%2Fb"; "slash")]
    #[test_case("k=v", "k%3Dv"; "equals")]
    #[test_case("50%", "50%25"; "percent")]
    #[test_case("tab\there", "tab%09here"; "control")]
    #[test_case("東京", "東京"; "unicode passes through")]
    fn test_escape_path_name(input: &str, expected: &str) {
        assert_eq!(escape_path_name(input), expected);
    }

    #[test]
    fn test_value_cannot_add_directory_level() {
        let generator = generator(&["region"], &[]);
        let (path, _) = generator.compute_bucket_path(&record(1, Some("../etc"), "d"));
        assert_eq!(path, "region=..%2Fetc");
        assert_eq!(path.split('/').count(), 1);
    }

    #[test]
    fn test_record_key() {
        let generator = generator(&[], &["id", "region"]);
        assert_eq!(generator.record_key(&record(7, Some("us"), "d")), "7,us");
        assert_eq!(generator.record_key(&record(7, None, "d")), "7,__null__");
        assert!(generator.has_record_key());
    }

    #[test]
    fn test_missing_columns_are_configuration_errors() {
        let err = PartitionGenerator::try_new(
            &schema(),
            &["country".to_string()],
            &[],
            "default_partition",
        )
        .unwrap_err();
        assert!(err.is_fatal());

        assert!(PartitionGenerator::try_new(
            &schema(),
            &[],
            &["missing".to_string()],
            "default_partition",
        )
        .is_err());

        assert!(PartitionGenerator::try_new(
            &schema(),
            &["region".to_string(), "region".to_string()],
            &[],
            "default_partition",
        )
        .is_err());
    }
}
