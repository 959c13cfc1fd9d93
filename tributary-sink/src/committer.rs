use std::fmt::Debug;
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use bincode::{Decode, Encode};
use tracing::info;
use tributary_types::{Record, Schema, TaskInfo};

use crate::assigner::PartitionBucketAssigner;
use crate::bucket::{BucketResources, OutputFileConfig};
use crate::cdc::CdcPartitionComputer;
use crate::config::SinkConfig;
use crate::encoder::{EncoderFactory, JsonEncoderFactory};
use crate::error::SinkResult;
use crate::factory::DefaultBucketFactory;
use crate::metadata::FileMetadata;
use crate::metrics::SinkMetrics;
use crate::rolling::{DefaultRollingPolicy, RollingPolicy};
use crate::store::PartStore;
use crate::writer::{BucketWriter, WriterState};

/// A sink that makes its output visible in two steps: files are made durable when a checkpoint
/// is taken, and published once every subtask has finished that checkpoint.
///
/// `DataRecovery` is the per-subtask state stored with each checkpoint; `PreCommit` describes
/// output that has been made durable but is not yet visible.
#[async_trait]
pub trait TwoPhaseCommitter: Send + 'static {
    type DataRecovery: Encode + Decode<()> + Clone + Send + Sync + Debug;
    type PreCommit: Clone + Send + Sync + Debug;

    fn name(&self) -> String;

    async fn init(
        &mut self,
        task_info: &TaskInfo,
        data_recovery: Option<Self::DataRecovery>,
    ) -> SinkResult<()>;

    async fn insert_record(&mut self, record: &Record) -> SinkResult<()>;

    async fn on_processing_time(&mut self, now: SystemTime) -> SinkResult<()>;

    async fn checkpoint(
        &mut self,
        task_info: &TaskInfo,
        epoch: u32,
        stopping: bool,
    ) -> SinkResult<(Self::DataRecovery, Vec<Self::PreCommit>)>;

    /// Publishes everything pre-committed up to `epoch`, returning what became visible.
    async fn commit(
        &mut self,
        task_info: &TaskInfo,
        epoch: u32,
    ) -> SinkResult<Vec<Self::PreCommit>>;

    async fn close(&mut self) -> SinkResult<()>;
}

/// The partitioned file sink for one subtask.
pub struct BucketSink {
    config: SinkConfig,
    writer: BucketWriter,
}

impl BucketSink {
    pub fn new(
        task_info: &TaskInfo,
        config: SinkConfig,
        schema: &Schema,
        store: Arc<dyn PartStore>,
    ) -> SinkResult<Self> {
        let rolling_policy = Arc::new(DefaultRollingPolicy::from_config(&config.rolling_policy));
        Self::with_rolling_policy(task_info, config, schema, store, rolling_policy)
    }

    pub fn with_rolling_policy(
        task_info: &TaskInfo,
        config: SinkConfig,
        schema: &Schema,
        store: Arc<dyn PartStore>,
        rolling_policy: Arc<dyn RollingPolicy>,
    ) -> SinkResult<Self> {
        config.validate(schema)?;
        let computer = CdcPartitionComputer::try_new(schema, &config)?;

        let encoder_factory =
            JsonEncoderFactory::new(schema, &config.partition_fields, computer.output_columns());
        let suffix = config
            .file_naming
            .suffix
            .clone()
            .unwrap_or_else(|| encoder_factory.suffix().to_string());

        let resources = BucketResources {
            store,
            encoder_factory: Arc::new(encoder_factory),
            rolling_policy,
            file_config: OutputFileConfig::new(config.file_prefix(), suffix),
            track_cdc: computer.cdc_enabled(),
        };

        let writer = BucketWriter::new(
            task_info.task_index,
            Box::new(PartitionBucketAssigner::new(computer)),
            Arc::new(DefaultBucketFactory::new(resources)),
            SinkMetrics::register(task_info),
        );

        Ok(Self { config, writer })
    }

    pub fn config(&self) -> &SinkConfig {
        &self.config
    }

    pub fn writer(&self) -> &BucketWriter {
        &self.writer
    }
}

#[async_trait]
impl TwoPhaseCommitter for BucketSink {
    type DataRecovery = WriterState;
    type PreCommit = FileMetadata;

    fn name(&self) -> String {
        match &self.config.table_name {
            Some(table) => format!("bucket-sink({})", table),
            None => "bucket-sink".to_string(),
        }
    }

    async fn init(
        &mut self,
        task_info: &TaskInfo,
        data_recovery: Option<WriterState>,
    ) -> SinkResult<()> {
        if let Some(state) = data_recovery {
            info!(
                "{} subtask {} restoring {} bucket(s)",
                self.name(),
                task_info.task_index,
                state.buckets.len()
            );
            self.writer.initialize_state(state).await?;
        }
        Ok(())
    }

    async fn insert_record(&mut self, record: &Record) -> SinkResult<()> {
        self.writer.write(record, SystemTime::now()).await
    }

    async fn on_processing_time(&mut self, now: SystemTime) -> SinkResult<()> {
        self.writer.on_processing_time(now).await
    }

    async fn checkpoint(
        &mut self,
        _task_info: &TaskInfo,
        epoch: u32,
        _stopping: bool,
    ) -> SinkResult<(WriterState, Vec<FileMetadata>)> {
        let state = self.writer.snapshot_state(epoch).await?;
        let pre_commits = state.pending_for(epoch);
        Ok((state, pre_commits))
    }

    async fn commit(&mut self, task_info: &TaskInfo, epoch: u32) -> SinkResult<Vec<FileMetadata>> {
        let committed = self.writer.commit_up_to(epoch).await?;
        if !committed.is_empty() {
            info!(
                "{} subtask {} committed {} file(s) for checkpoint {}",
                self.name(),
                task_info.task_index,
                committed.len(),
                epoch
            );
        }
        Ok(committed)
    }

    async fn close(&mut self) -> SinkResult<()> {
        self.writer.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rolling::CheckpointRollingPolicy;
    use crate::store::LocalPartStore;
    use tributary_types::{from_millis, DataType, Field, FieldValue};

    fn schema() -> Schema {
        Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("region", DataType::Utf8, true),
            Field::new("op", DataType::Utf8, true),
        ])
    }

    fn cdc_config(path: &str) -> SinkConfig {
        let mut config = SinkConfig::new(path);
        config.table_name = Some("orders".to_string());
        config.partition_fields = vec!["region".to_string()];
        config.record_key_fields = vec!["id".to_string()];
        config.cdc.enabled = true;
        config.cdc.change_column = "op".to_string();
        config
    }

    fn record(id: i64, region: &str, op: &str) -> Record {
        Record::new(
            from_millis(0),
            vec![
                FieldValue::Int64(id),
                FieldValue::Utf8(region.to_string()),
                FieldValue::Utf8(op.to_string()),
            ],
        )
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = cdc_config(&dir.path().to_string_lossy());
        config.record_key_fields.clear();

        let result = BucketSink::new(
            &TaskInfo::for_test("committer-invalid", "sink"),
            config,
            &schema(),
            Arc::new(LocalPartStore::new(dir.path())),
        );
        assert!(matches!(result, Err(e) if e.is_fatal()));
    }

    #[tokio::test]
    async fn test_cdc_counts_reach_file_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let task_info = TaskInfo::for_test("committer-cdc", "sink");
        let mut sink = BucketSink::with_rolling_policy(
            &task_info,
            cdc_config(&dir.path().to_string_lossy()),
            &schema(),
            Arc::new(LocalPartStore::new(dir.path())),
            Arc::new(CheckpointRollingPolicy),
        )
        .unwrap();
        assert_eq!(sink.name(), "bucket-sink(orders)");
        sink.init(&task_info, None).await.unwrap();

        sink.insert_record(&record(1, "eu", "+I")).await.unwrap();
        sink.insert_record(&record(1, "eu", "-U")).await.unwrap();
        sink.insert_record(&record(1, "eu", "+U")).await.unwrap();
        sink.insert_record(&record(2, "eu", "-D")).await.unwrap();

        let (state, pre_commits) = sink.checkpoint(&task_info, 1, false).await.unwrap();
        assert_eq!(state.buckets.len(), 1);
        assert_eq!(pre_commits.len(), 1);

        let committed = sink.commit(&task_info, 1).await.unwrap();
        assert_eq!(committed, pre_commits);
        let cdc = committed[0].cdc.unwrap();
        assert_eq!(
            (cdc.inserts, cdc.update_befores, cdc.update_afters, cdc.deletes),
            (1, 1, 1, 1)
        );

        let body = std::fs::read_to_string(dir.path().join(&committed[0].relative_path)).unwrap();
        assert_eq!(
            body.lines().next().unwrap(),
            r#"{"id":1,"op":"insert"}"#
        );
        sink.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_exists_and_record_key_reach_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let task_info = TaskInfo::for_test("committer-cdc-columns", "sink");
        let mut config = cdc_config(&dir.path().to_string_lossy());
        config.cdc.exists_column = Some("_exists".to_string());
        config.cdc.record_key_column = Some("_key".to_string());
        let mut sink = BucketSink::with_rolling_policy(
            &task_info,
            config,
            &schema(),
            Arc::new(LocalPartStore::new(dir.path())),
            Arc::new(CheckpointRollingPolicy),
        )
        .unwrap();
        sink.init(&task_info, None).await.unwrap();

        sink.insert_record(&record(1, "eu", "+I")).await.unwrap();
        sink.insert_record(&record(1, "eu", "-U")).await.unwrap();
        sink.insert_record(&record(1, "eu", "+U")).await.unwrap();
        sink.insert_record(&record(2, "eu", "-D")).await.unwrap();
        sink.checkpoint(&task_info, 1, false).await.unwrap();
        let committed = sink.commit(&task_info, 1).await.unwrap();

        let body = std::fs::read_to_string(dir.path().join(&committed[0].relative_path)).unwrap();
        let lines: Vec<serde_json::Value> = body
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(
            lines,
            vec![
                serde_json::json!({"id": 1, "op": "insert", "_exists": true, "_key": "1"}),
                serde_json::json!({"id": 1, "op": "update_before", "_exists": false, "_key": "1"}),
                serde_json::json!({"id": 1, "op": "update_after", "_exists": true, "_key": "1"}),
                serde_json::json!({"id": 2, "op": "delete", "_exists": false, "_key": "2"}),
            ]
        );
    }
}
