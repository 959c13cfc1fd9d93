use std::sync::Arc;
use std::time::SystemTime;

use tokio::sync::mpsc::{channel, Receiver, Sender};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tributary_state::CheckpointStore;
use tributary_types::{CheckpointBarrier, Record, Schema, TaskInfo};

use crate::cdc::CdcPartitionComputer;
use crate::committer::BucketSink;
use crate::config::SinkConfig;
use crate::coordinator::CommitCoordinator;
use crate::error::{SinkError, SinkResult};
use crate::metadata::FileMetadata;
use crate::operator::{ControlResp, SinkMessage, SinkOperator};
use crate::partition::PartitionGenerator;
use crate::rolling::{DefaultRollingPolicy, RollingPolicy};
use crate::router::BucketRouter;
use crate::store::PartStore;

pub const SINK_OPERATOR_ID: &str = "bucket-sink";
const QUEUE_SIZE: usize = 1024;

/// How a [`LocalPipeline`] is laid out.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub job_id: String,
    pub parallelism: usize,
    /// Take a checkpoint after this many records; `None` only checkpoints when asked to.
    pub checkpoint_every: Option<usize>,
    pub rolling_policy: Option<Arc<dyn RollingPolicy>>,
}

impl PipelineOptions {
    pub fn new(job_id: impl Into<String>, parallelism: usize) -> Self {
        Self {
            job_id: job_id.into(),
            parallelism,
            checkpoint_every: None,
            rolling_policy: None,
        }
    }
}

/// Runs a sink in-process: one [`SinkOperator`] task per writer, records routed by bucket, and a
/// coordinator deciding when checkpoints are complete.
pub struct LocalPipeline {
    generator: PartitionGenerator,
    router: BucketRouter,
    inputs: Vec<Sender<SinkMessage>>,
    responses: Receiver<ControlResp<FileMetadata>>,
    coordinator: CommitCoordinator<FileMetadata>,
    handles: Vec<JoinHandle<SinkResult<()>>>,
    next_epoch: u32,
    checkpoint_every: Option<usize>,
    since_checkpoint: usize,
    committed: Vec<FileMetadata>,
}

impl LocalPipeline {
    pub async fn start(
        options: PipelineOptions,
        config: SinkConfig,
        schema: &Schema,
        checkpoints: CheckpointStore,
        store: Arc<dyn PartStore>,
    ) -> SinkResult<Self> {
        config.validate(schema)?;
        let router = BucketRouter::new(options.parallelism)?;
        let generator = CdcPartitionComputer::try_new(schema, &config)?
            .generator()
            .clone();
        let rolling_policy = options.rolling_policy.clone().unwrap_or_else(|| {
            Arc::new(DefaultRollingPolicy::from_config(&config.rolling_policy))
        });

        let next_epoch = checkpoints
            .latest_metadata()
            .await?
            .map(|m| m.epoch + 1)
            .unwrap_or(1);

        let (resp_tx, responses) = channel(QUEUE_SIZE);
        let mut inputs = Vec::with_capacity(options.parallelism);
        let mut control_txs = Vec::with_capacity(options.parallelism);
        let mut handles = Vec::with_capacity(options.parallelism);

        for i in 0..options.parallelism {
            let task_info = TaskInfo::new(
                &options.job_id,
                SINK_OPERATOR_ID,
                i,
                options.parallelism,
            );
            let sink = BucketSink::with_rolling_policy(
                &task_info,
                config.clone(),
                schema,
                store.clone(),
                rolling_policy.clone(),
            )?;
            let operator = SinkOperator::new(
                sink,
                task_info,
                checkpoints.clone(),
                config.bucket_check_interval(),
            );

            let (in_tx, in_rx) = channel(QUEUE_SIZE);
            let (ctrl_tx, ctrl_rx) = channel(QUEUE_SIZE);
            handles.push(tokio::spawn(operator.run(in_rx, ctrl_rx, resp_tx.clone())));
            inputs.push(in_tx);
            control_txs.push(ctrl_tx);
        }

        let coordinator = CommitCoordinator::new(
            TaskInfo::new(&options.job_id, SINK_OPERATOR_ID, 0, options.parallelism),
            checkpoints,
            control_txs,
        );

        info!(
            "started sink pipeline for job {} with {} writer(s), next checkpoint {}",
            options.job_id, options.parallelism, next_epoch
        );

        Ok(Self {
            generator,
            router,
            inputs,
            responses,
            coordinator,
            handles,
            next_epoch,
            checkpoint_every: options.checkpoint_every,
            since_checkpoint: 0,
            committed: vec![],
        })
    }

    pub fn router(&self) -> &BucketRouter {
        &self.router
    }

    pub fn next_epoch(&self) -> u32 {
        self.next_epoch
    }

    /// Routes a record to the writer that owns its bucket.
    pub async fn send(&mut self, record: Record) -> SinkResult<()> {
        let (_, bucket_id) = self.generator.compute_bucket_path(&record);
        let writer = self.router.route(&bucket_id);
        self.inputs[writer]
            .send(SinkMessage::Record(record))
            .await
            .map_err(|_| SinkError::Shutdown(format!("writer {} is gone", writer)))?;

        self.since_checkpoint += 1;
        if self
            .checkpoint_every
            .is_some_and(|every| self.since_checkpoint >= every)
        {
            self.checkpoint().await?;
        }
        Ok(())
    }

    /// Takes a checkpoint and waits until its files are published. Returns the checkpoint's epoch.
    pub async fn checkpoint(&mut self) -> SinkResult<u32> {
        let epoch = self.inject_barrier(false).await?;
        self.drive_until(|c| c.is_committed(epoch)).await?;
        Ok(epoch)
    }

    /// Files published since the last call.
    pub fn take_committed(&mut self) -> Vec<FileMetadata> {
        self.committed.extend(self.coordinator.take_committed());
        std::mem::take(&mut self.committed)
    }

    /// Takes a final checkpoint, waits for every writer to publish and exit, and returns the
    /// files published since the last [`take_committed`](Self::take_committed).
    pub async fn finish(mut self) -> SinkResult<Vec<FileMetadata>> {
        let epoch = self.inject_barrier(true).await?;
        self.drive_until(|c| c.is_committed(epoch) && c.is_finished())
            .await?;
        self.join().await?;
        Ok(self.take_committed())
    }

    /// Stops every writer without a final checkpoint. Files from incomplete checkpoints are left
    /// for the next run to recover.
    pub async fn abort(mut self) -> SinkResult<()> {
        self.coordinator.stop_all().await;
        self.drive_until(|c| c.is_finished()).await?;
        self.join().await
    }

    async fn inject_barrier(&mut self, then_stop: bool) -> SinkResult<u32> {
        let epoch = self.next_epoch;
        self.next_epoch += 1;
        self.since_checkpoint = 0;

        let barrier = CheckpointBarrier {
            epoch,
            timestamp: SystemTime::now(),
            then_stop,
        };
        for (i, input) in self.inputs.iter().enumerate() {
            input
                .send(SinkMessage::Barrier(barrier))
                .await
                .map_err(|_| SinkError::Shutdown(format!("writer {} is gone", i)))?;
        }
        Ok(epoch)
    }

    async fn drive_until(
        &mut self,
        done: impl Fn(&CommitCoordinator<FileMetadata>) -> bool,
    ) -> SinkResult<()> {
        while !done(&self.coordinator) {
            let Some(resp) = self.responses.recv().await else {
                return Err(SinkError::Shutdown(
                    "all writers exited before the pipeline finished".to_string(),
                ));
            };
            self.coordinator.handle_response(resp).await?;
        }
        self.committed.extend(self.coordinator.take_committed());
        Ok(())
    }

    async fn join(&mut self) -> SinkResult<()> {
        for (i, handle) in self.handles.drain(..).enumerate() {
            match handle.await {
                Ok(result) => result?,
                Err(e) => {
                    warn!("writer {} panicked: {}", i, e);
                    return Err(SinkError::TaskFailed {
                        subtask_index: i,
                        message: e.to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}
