use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;
use tributary_types::Schema;

use crate::cdc::CdcPartitionComputer;
use crate::config_err;
use crate::error::SinkResult;

pub const CDC_CHANGE_COLUMN: &str = "cdc_change_column";
pub const DEFAULT_PARTITION_VALUE: &str = "default_partition";
pub const DEFAULT_FILE_PREFIX: &str = "part";
pub const DEFAULT_ROLLING_SIZE: u64 = 128 * 1024 * 1024;
pub const DEFAULT_ROLLING_TIME: Duration = Duration::from_millis(2_000_000);
pub const DEFAULT_BUCKET_CHECK_INTERVAL: Duration = Duration::from_millis(1000);

// flat table option keys
pub const PATH_OPTION: &str = "path";
pub const TABLE_NAME_OPTION: &str = "table_name";
pub const PARTITIONS_OPTION: &str = "partitions";
pub const RECORD_KEY_OPTION: &str = "recordKey";
pub const USE_CDC_OPTION: &str = "use_cdc";
pub const CDC_COLUMN_OPTION: &str = CDC_CHANGE_COLUMN;
pub const FILE_EXIST_COLUMN_OPTION: &str = "fileExistColumn";
pub const RECORD_KEY_COLUMN_OPTION: &str = "recordKeyColumn";
pub const ROLLING_SIZE_OPTION: &str = "file_rolling_size";
pub const ROLLING_TIME_OPTION: &str = "file_rolling_time";
pub const INACTIVITY_TIME_OPTION: &str = "file_inactivity_time";
pub const CHECK_INTERVAL_OPTION: &str = "bucket_check_interval";
pub const DEFAULT_PARTITION_OPTION: &str = "default_partition";
pub const FILE_PREFIX_OPTION: &str = "file_prefix";

/// When to close an open part file. Unset fields fall back to the defaults above; inactivity has
/// no default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RollingPolicyConfig {
    pub file_size_bytes: Option<u64>,
    pub rollover_millis: Option<u64>,
    pub inactivity_millis: Option<u64>,
}

impl RollingPolicyConfig {
    pub fn file_size_bytes(&self) -> u64 {
        self.file_size_bytes.unwrap_or(DEFAULT_ROLLING_SIZE)
    }

    pub fn rollover(&self) -> Duration {
        self.rollover_millis
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_ROLLING_TIME)
    }

    pub fn inactivity(&self) -> Option<Duration> {
        self.inactivity_millis.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FileNamingConfig {
    pub prefix: Option<String>,
    /// Overrides the encoder's suffix, e.g. `.json`.
    pub suffix: Option<String>,
}

fn default_change_column() -> String {
    CDC_CHANGE_COLUMN.to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CdcConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_change_column")]
    pub change_column: String,
    /// Output column that gets `false` for deletes and update-befores, `true` otherwise.
    pub exists_column: Option<String>,
    /// Output column that gets the record key used for deduplication.
    pub record_key_column: Option<String>,
}

impl Default for CdcConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            change_column: default_change_column(),
            exists_column: None,
            record_key_column: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SinkConfig {
    /// Base output location; a local path, `file://`, `memory://` or `s3://` URL.
    pub path: String,
    pub table_name: Option<String>,
    #[serde(default)]
    pub partition_fields: Vec<String>,
    #[serde(default)]
    pub record_key_fields: Vec<String>,
    #[serde(default)]
    pub cdc: CdcConfig,
    #[serde(default)]
    pub rolling_policy: RollingPolicyConfig,
    #[serde(default)]
    pub file_naming: FileNamingConfig,
    pub default_partition: Option<String>,
    pub bucket_check_interval_millis: Option<u64>,
}

impl SinkConfig {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            table_name: None,
            partition_fields: vec![],
            record_key_fields: vec![],
            cdc: CdcConfig::default(),
            rolling_policy: RollingPolicyConfig::default(),
            file_naming: FileNamingConfig::default(),
            default_partition: None,
            bucket_check_interval_millis: None,
        }
    }

    pub fn from_json(json: &str) -> SinkResult<Self> {
        serde_json::from_str(json).map_err(|e| config_err!("invalid sink config: {}", e))
    }

    /// Builds a config from flat `key = value` table options.
    pub fn from_options(options: &HashMap<String, String>) -> SinkResult<Self> {
        let mut opts = options.clone();

        let path = opts
            .remove(PATH_OPTION)
            .ok_or_else(|| config_err!("missing required option '{}'", PATH_OPTION))?;

        let mut config = SinkConfig::new(path);
        config.table_name = opts.remove(TABLE_NAME_OPTION).filter(|s| !s.is_empty());
        config.partition_fields = pull_list(&mut opts, PARTITIONS_OPTION);
        config.record_key_fields = pull_list(&mut opts, RECORD_KEY_OPTION);
        config.cdc.enabled = pull_bool(&mut opts, USE_CDC_OPTION)?.unwrap_or(false);
        if let Some(column) = opts.remove(CDC_COLUMN_OPTION) {
            config.cdc.change_column = column;
        }
        config.cdc.exists_column = pull_column(&mut opts, FILE_EXIST_COLUMN_OPTION);
        config.cdc.record_key_column = pull_column(&mut opts, RECORD_KEY_COLUMN_OPTION);
        config.rolling_policy = RollingPolicyConfig {
            file_size_bytes: pull_u64(&mut opts, ROLLING_SIZE_OPTION)?,
            rollover_millis: pull_u64(&mut opts, ROLLING_TIME_OPTION)?,
            inactivity_millis: pull_u64(&mut opts, INACTIVITY_TIME_OPTION)?,
        };
        config.bucket_check_interval_millis = pull_u64(&mut opts, CHECK_INTERVAL_OPTION)?;
        config.default_partition = opts.remove(DEFAULT_PARTITION_OPTION);
        config.file_naming.prefix = opts.remove(FILE_PREFIX_OPTION);

        if !opts.is_empty() {
            let mut keys: Vec<_> = opts.keys().collect();
            keys.sort();
            warn!("ignoring unknown sink options: {:?}", keys);
        }

        Ok(config)
    }

    /// Checks the config against the record schema; every startup check lives here.
    pub fn validate(&self, schema: &Schema) -> SinkResult<()> {
        if self.path.trim().is_empty() {
            return Err(config_err!("'path' must not be empty"));
        }
        if self.rolling_policy.file_size_bytes == Some(0) {
            return Err(config_err!("file size limit must be greater than zero"));
        }
        if self.rolling_policy.rollover_millis == Some(0) {
            return Err(config_err!("rollover interval must be greater than zero"));
        }
        CdcPartitionComputer::try_new(schema, self)?;
        Ok(())
    }

    pub fn default_partition(&self) -> &str {
        self.default_partition
            .as_deref()
            .unwrap_or(DEFAULT_PARTITION_VALUE)
    }

    pub fn bucket_check_interval(&self) -> Duration {
        self.bucket_check_interval_millis
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_BUCKET_CHECK_INTERVAL)
    }

    pub fn file_prefix(&self) -> &str {
        self.file_naming
            .prefix
            .as_deref()
            .unwrap_or(DEFAULT_FILE_PREFIX)
    }
}

fn pull_list(opts: &mut HashMap<String, String>, key: &str) -> Vec<String> {
    opts.remove(key)
        .map(|v| {
            v.split(',')
                .map(|s| s.trim())
                .filter(|s| !s.is_empty() && *s != "null")
                .map(|s| s.to_string())
                .collect()
        })
        .unwrap_or_default()
}

/// A column name option; `null` and blank mean unset.
fn pull_column(opts: &mut HashMap<String, String>, key: &str) -> Option<String> {
    opts.remove(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty() && v != "null")
}

fn pull_bool(opts: &mut HashMap<String, String>, key: &str) -> SinkResult<Option<bool>> {
    opts.remove(key)
        .map(|v| match v.trim().to_ascii_lowercase().as_str() {
            "true" => Ok(true),
            "false" => Ok(false),
            _ => Err(config_err!("option '{}' must be true or false, got '{}'", key, v)),
        })
        .transpose()
}

fn pull_u64(opts: &mut HashMap<String, String>, key: &str) -> SinkResult<Option<u64>> {
    opts.remove(key)
        .map(|v| {
            v.trim()
                .parse::<u64>()
                .map_err(|_| config_err!("option '{}' must be an integer, got '{}'", key, v))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tributary_types::{DataType, Field};

    fn schema() -> Schema {
        Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("region", DataType::Utf8, true),
            Field::new("date", DataType::Utf8, true),
            Field::new(CDC_CHANGE_COLUMN, DataType::Utf8, true),
        ])
    }

    #[test]
    fn test_from_json_with_defaults() {
        let config = SinkConfig::from_json(
            r#"{
                "path": "/tmp/table",
                "partitionFields": ["region", "date"],
                "rollingPolicy": {"fileSizeBytes": 1024}
            }"#,
        )
        .unwrap();

        assert_eq!(config.partition_fields, vec!["region", "date"]);
        assert_eq!(config.rolling_policy.file_size_bytes(), 1024);
        assert_eq!(config.rolling_policy.rollover(), DEFAULT_ROLLING_TIME);
        assert_eq!(config.rolling_policy.inactivity(), None);
        assert_eq!(config.default_partition(), DEFAULT_PARTITION_VALUE);
        assert_eq!(config.file_prefix(), "part");
        assert!(!config.cdc.enabled);
        assert_eq!(config.cdc.change_column, CDC_CHANGE_COLUMN);
        assert_eq!(CDC_CHANGE_COLUMN, "cdc_change_column");
        assert_eq!(
            RollingPolicyConfig::default().file_size_bytes(),
            128 * 1024 * 1024
        );
        config.validate(&schema()).unwrap();
    }

    #[test]
    fn test_unknown_json_fields_are_rejected() {
        let err = SinkConfig::from_json(r#"{"path": "/tmp/t", "partitions": ["a"]}"#).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_from_options() {
        let options: HashMap<String, String> = [
            ("path", "/tmp/table"),
            ("partitions", "region, date"),
            ("recordKey", "id"),
            ("use_cdc", "true"),
            ("file_rolling_size", "2000"),
            ("file_rolling_time", "60000"),
            ("bucket_check_interval", "250"),
            ("fileExistColumn", "null"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let config = SinkConfig::from_options(&options).unwrap();
        assert_eq!(config.partition_fields, vec!["region", "date"]);
        assert_eq!(config.record_key_fields, vec!["id"]);
        assert!(config.cdc.enabled);
        assert_eq!(config.rolling_policy.file_size_bytes(), 2000);
        assert_eq!(config.rolling_policy.rollover(), Duration::from_secs(60));
        assert_eq!(config.bucket_check_interval(), Duration::from_millis(250));
        assert_eq!(config.cdc.exists_column, None);
        config.validate(&schema()).unwrap();
    }

    #[test]
    fn test_cdc_output_column_options() {
        let options: HashMap<String, String> = [
            ("path", "/tmp/table"),
            ("recordKey", "id"),
            ("use_cdc", "true"),
            ("fileExistColumn", "_exists"),
            ("recordKeyColumn", " _key "),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let config = SinkConfig::from_options(&options).unwrap();
        assert_eq!(config.cdc.exists_column.as_deref(), Some("_exists"));
        assert_eq!(config.cdc.record_key_column.as_deref(), Some("_key"));
        config.validate(&schema()).unwrap();

        let from_json = SinkConfig::from_json(
            r#"{
                "path": "/tmp/table",
                "recordKeyFields": ["id"],
                "cdc": {"enabled": true, "existsColumn": "_exists", "recordKeyColumn": "_key"}
            }"#,
        )
        .unwrap();
        assert_eq!(from_json.cdc, config.cdc);
    }

    #[test]
    fn test_from_options_rejects_bad_values() {
        let mut options = HashMap::new();
        assert!(SinkConfig::from_options(&options).is_err());

        options.insert("path".to_string(), "/tmp/t".to_string());
        options.insert("use_cdc".to_string(), "maybe".to_string());
        assert!(SinkConfig::from_options(&options).is_err());

        options.insert("use_cdc".to_string(), "false".to_string());
        options.insert("file_rolling_size".to_string(), "big".to_string());
        assert!(SinkConfig::from_options(&options).is_err());
    }

    #[test]
    fn test_null_partitions_option_means_unpartitioned() {
        let options: HashMap<String, String> = [("path", "/tmp/t"), ("partitions", "null")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let config = SinkConfig::from_options(&options).unwrap();
        assert!(config.partition_fields.is_empty());
    }

    #[test]
    fn test_validate_zero_limits() {
        let mut config = SinkConfig::new("/tmp/t");
        config.rolling_policy.file_size_bytes = Some(0);
        assert!(config.validate(&schema()).is_err());
    }
}
