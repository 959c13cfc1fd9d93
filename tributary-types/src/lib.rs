use anyhow::{anyhow, bail};
use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::fmt::{Display, Formatter};
use std::hash::{Hash, Hasher};
use std::ops::RangeInclusive;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const CHECKPOINT_URL_ENV: &str = "TRIBUTARY_CHECKPOINT_URL";
pub const JOB_ID_ENV: &str = "TRIBUTARY_JOB_ID";
pub const LOG_DIR_ENV: &str = "LOG_DIR";

pub fn to_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub fn from_millis(ts: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(ts)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInfo {
    pub job_id: String,
    pub operator_name: String,
    pub operator_id: String,
    pub task_index: usize,
    pub parallelism: usize,
    pub key_range: RangeInclusive<u64>,
}

impl TaskInfo {
    pub fn new(job_id: &str, operator_id: &str, task_index: usize, parallelism: usize) -> Self {
        Self {
            job_id: job_id.to_string(),
            operator_name: "bucket_sink".to_string(),
            operator_id: operator_id.to_string(),
            task_index,
            parallelism,
            key_range: range_for_server(task_index, parallelism),
        }
    }

    pub fn for_test(job_id: &str, operator_id: &str) -> Self {
        Self::new(job_id, operator_id, 0, 1)
    }

    /// Values for the `job_id`, `operator_id` and `subtask_idx` metric labels, in that order.
    pub fn metric_label_values(&self) -> [String; 3] {
        [
            self.job_id.clone(),
            self.operator_id.clone(),
            format!("{}", self.task_index),
        ]
    }
}

pub fn hash_key<K: Hash + ?Sized>(key: &K) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

/// Maps a 64-bit hash onto one of `n` contiguous, equally sized ranges.
pub fn server_for_hash(x: u64, n: usize) -> usize {
    if n == 1 {
        0
    } else {
        let range_size = (u64::MAX / (n as u64)) + 1;
        (x / range_size) as usize
    }
}

pub fn range_for_server(i: usize, n: usize) -> RangeInclusive<u64> {
    if n == 1 {
        return 0..=u64::MAX;
    }
    let range_size = (u64::MAX / (n as u64)) + 1;
    let start = range_size * (i as u64);
    let end = if i + 1 == n {
        u64::MAX
    } else {
        start + range_size - 1
    };
    start..=end
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Encode, Decode)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Boolean,
    Int64,
    Float64,
    Utf8,
    /// Milliseconds since the unix epoch.
    Timestamp,
}

fn default_nullable() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: DataType,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
}

impl Field {
    pub fn new(name: impl Into<String>, data_type: DataType, nullable: bool) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    pub fields: Vec<Field>,
}

impl Schema {
    pub fn new(fields: Vec<Field>) -> Self {
        Self { fields }
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    Boolean(bool),
    Int64(i64),
    Float64(f64),
    Utf8(String),
    Timestamp(i64),
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    /// String form used in partition paths and record keys. `None` for null.
    pub fn render(&self) -> Option<String> {
        match self {
            FieldValue::Null => None,
            FieldValue::Boolean(b) => Some(b.to_string()),
            FieldValue::Int64(i) => Some(i.to_string()),
            FieldValue::Float64(f) => Some(f.to_string()),
            FieldValue::Utf8(s) => Some(s.clone()),
            FieldValue::Timestamp(t) => Some(t.to_string()),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            FieldValue::Null => serde_json::Value::Null,
            FieldValue::Boolean(b) => serde_json::Value::Bool(*b),
            FieldValue::Int64(i) => serde_json::Value::from(*i),
            FieldValue::Float64(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            FieldValue::Utf8(s) => serde_json::Value::String(s.clone()),
            FieldValue::Timestamp(t) => serde_json::Value::from(*t),
        }
    }

    pub fn from_json(data_type: DataType, value: &serde_json::Value) -> anyhow::Result<Self> {
        use serde_json::Value;
        Ok(match (data_type, value) {
            (_, Value::Null) => FieldValue::Null,
            (DataType::Boolean, Value::Bool(b)) => FieldValue::Boolean(*b),
            (DataType::Int64, Value::Number(n)) => FieldValue::Int64(
                n.as_i64()
                    .ok_or_else(|| anyhow!("{} is not a 64-bit integer", n))?,
            ),
            (DataType::Float64, Value::Number(n)) => FieldValue::Float64(
                n.as_f64()
                    .ok_or_else(|| anyhow!("{} is not a float", n))?,
            ),
            (DataType::Utf8, Value::String(s)) => FieldValue::Utf8(s.clone()),
            (DataType::Timestamp, Value::Number(n)) => FieldValue::Timestamp(
                n.as_i64()
                    .ok_or_else(|| anyhow!("{} is not a millisecond timestamp", n))?,
            ),
            (data_type, value) => bail!("expected {:?}, found {}", data_type, value),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub timestamp: SystemTime,
    pub values: Vec<FieldValue>,
}

impl Record {
    pub fn new(timestamp: SystemTime, values: Vec<FieldValue>) -> Self {
        Self { timestamp, values }
    }

    pub fn value(&self, idx: usize) -> &FieldValue {
        self.values.get(idx).unwrap_or(&FieldValue::Null)
    }

    /// Builds a positional record from a JSON object. Missing columns are null.
    pub fn from_json(
        schema: &Schema,
        timestamp: SystemTime,
        value: &serde_json::Value,
    ) -> anyhow::Result<Self> {
        let object = value
            .as_object()
            .ok_or_else(|| anyhow!("record must be a JSON object, found {}", value))?;

        let mut values = Vec::with_capacity(schema.len());
        for field in &schema.fields {
            let v = match object.get(&field.name) {
                Some(v) => FieldValue::from_json(field.data_type, v)
                    .map_err(|e| anyhow!("invalid value for column '{}': {}", field.name, e))?,
                None => FieldValue::Null,
            };
            if v.is_null() && !field.nullable {
                bail!("column '{}' is not nullable", field.name);
            }
            values.push(v);
        }

        Ok(Self { timestamp, values })
    }
}

/// The change a record represents in a change-data-capture stream.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Encode, Decode, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    #[default]
    Insert,
    UpdateBefore,
    UpdateAfter,
    Delete,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Insert => "insert",
            ChangeKind::UpdateBefore => "update_before",
            ChangeKind::UpdateAfter => "update_after",
            ChangeKind::Delete => "delete",
        }
    }

    pub fn short_code(&self) -> &'static str {
        match self {
            ChangeKind::Insert => "+I",
            ChangeKind::UpdateBefore => "-U",
            ChangeKind::UpdateAfter => "+U",
            ChangeKind::Delete => "-D",
        }
    }

    /// Whether the row still exists after this change is applied.
    pub fn row_exists(&self) -> bool {
        !matches!(self, ChangeKind::Delete | ChangeKind::UpdateBefore)
    }
}

impl Display for ChangeKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChangeKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim() {
            "+I" => ChangeKind::Insert,
            "-U" => ChangeKind::UpdateBefore,
            "+U" => ChangeKind::UpdateAfter,
            "-D" => ChangeKind::Delete,
            other => match other.to_ascii_lowercase().as_str() {
                "insert" => ChangeKind::Insert,
                "update_before" => ChangeKind::UpdateBefore,
                "update" | "update_after" => ChangeKind::UpdateAfter,
                "delete" => ChangeKind::Delete,
                _ => bail!("unknown change kind '{}'", s),
            },
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointBarrier {
    pub epoch: u32,
    pub timestamp: SystemTime,
    pub then_stop: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn test_range_for_server() {
        let n = 6;

        for i in 0..(n - 1) {
            let range1 = range_for_server(i, n);
            let range2 = range_for_server(i + 1, n);

            assert_eq!(*range1.end() + 1, *range2.start(), "Ranges not adjacent");
        }

        let last_range = range_for_server(n - 1, n);
        assert_eq!(
            *last_range.end(),
            u64::MAX,
            "Last range does not contain u64::MAX"
        );
    }

    #[test]
    fn test_server_for_hash_within_range() {
        let n = 5;
        for x in [0, 1, u64::MAX / 3, u64::MAX / 2, u64::MAX - 1, u64::MAX] {
            let server = server_for_hash(x, n);
            assert!(server < n);
            assert!(range_for_server(server, n).contains(&x));
        }
    }

    #[test_case("+I", ChangeKind::Insert; "short insert")]
    #[test_case("-U", ChangeKind::UpdateBefore; "short update before")]
    #[test_case("+U", ChangeKind::UpdateAfter; "short update after")]
    #[test_case("-D", ChangeKind::Delete; "short delete")]
    #[test_case("INSERT", ChangeKind::Insert; "upper insert")]
    #[test_case("update", ChangeKind::UpdateAfter; "bare update")]
    #[test_case("Delete", ChangeKind::Delete; "mixed case delete")]
    fn test_parse_change_kind(input: &str, expected: ChangeKind) {
        assert_eq!(input.parse::<ChangeKind>().unwrap(), expected);
    }

    #[test]
    fn test_unknown_change_kind() {
        assert!("upsert".parse::<ChangeKind>().is_err());
    }

    #[test]
    fn test_record_from_json() {
        let schema = Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("name", DataType::Utf8, true),
            Field::new("score", DataType::Float64, true),
        ]);
        let record = Record::from_json(
            &schema,
            SystemTime::UNIX_EPOCH,
            &serde_json::json!({"id": 7, "score": 1.5}),
        )
        .unwrap();

        assert_eq!(
            record.values,
            vec![
                FieldValue::Int64(7),
                FieldValue::Null,
                FieldValue::Float64(1.5)
            ]
        );

        assert!(Record::from_json(
            &schema,
            SystemTime::UNIX_EPOCH,
            &serde_json::json!({"name": "a"}),
        )
        .is_err());

        assert!(Record::from_json(
            &schema,
            SystemTime::UNIX_EPOCH,
            &serde_json::json!({"id": "seven"}),
        )
        .is_err());
    }
}
