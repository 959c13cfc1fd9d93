use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use bincode::{Decode, Encode};
use tracing::{debug, info};
use tributary_types::Record;

use crate::assigner::{AssignerContext, BucketAssigner};
use crate::bucket::{Bucket, BucketState};
use crate::config_err;
use crate::error::SinkResult;
use crate::factory::BucketFactory;
use crate::metadata::FileMetadata;
use crate::metrics::SinkMetrics;
use crate::partition::BucketId;

/// Everything one writer instance needs to resume after a restart.
#[derive(Debug, Clone, Default, PartialEq, Eq, Encode, Decode)]
pub struct WriterState {
    pub subtask_index: u32,
    /// Highest counter handed out by any bucket; new buckets start here.
    pub max_part_counter: u64,
    pub buckets: Vec<BucketState>,
}

impl WriterState {
    /// Metadata of every file this state left pending for `checkpoint_id`.
    pub fn pending_for(&self, checkpoint_id: u32) -> Vec<FileMetadata> {
        self.buckets
            .iter()
            .flat_map(|b| b.pending_for(checkpoint_id).cloned())
            .collect()
    }
}

/// The buckets owned by one writer instance, keyed by bucket id.
pub struct BucketWriter {
    subtask_index: usize,
    assigner: Box<dyn BucketAssigner>,
    factory: Arc<dyn BucketFactory>,
    buckets: HashMap<BucketId, Bucket>,
    max_part_counter: u64,
    committed_unreported: Vec<FileMetadata>,
    metrics: SinkMetrics,
}

impl BucketWriter {
    pub fn new(
        subtask_index: usize,
        assigner: Box<dyn BucketAssigner>,
        factory: Arc<dyn BucketFactory>,
        metrics: SinkMetrics,
    ) -> Self {
        Self {
            subtask_index,
            assigner,
            factory,
            buckets: HashMap::new(),
            max_part_counter: 0,
            committed_unreported: vec![],
            metrics,
        }
    }

    pub fn subtask_index(&self) -> usize {
        self.subtask_index
    }

    pub fn max_part_counter(&self) -> u64 {
        self.max_part_counter
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn bucket(&self, bucket_id: &BucketId) -> Option<&Bucket> {
        self.buckets.get(bucket_id)
    }

    /// Restores buckets from a checkpoint. Must be called before any record is written.
    pub async fn initialize_state(&mut self, state: WriterState) -> SinkResult<()> {
        if state.subtask_index as usize != self.subtask_index {
            return Err(config_err!(
                "state of subtask {} cannot be restored into subtask {}",
                state.subtask_index,
                self.subtask_index
            ));
        }

        self.max_part_counter = self.max_part_counter.max(state.max_part_counter);
        for bucket_state in state.buckets {
            let expected_path = self.assigner.bucket_path(&bucket_state.bucket_id);
            if expected_path != bucket_state.bucket_path {
                return Err(config_err!(
                    "bucket '{}' was checkpointed at '{}' but now resolves to '{}'",
                    bucket_state.bucket_id,
                    bucket_state.bucket_path,
                    expected_path
                ));
            }
            if bucket_state.subtask_index as usize != self.subtask_index {
                return Err(config_err!(
                    "bucket '{}' belongs to subtask {}, not {}",
                    bucket_state.bucket_id,
                    bucket_state.subtask_index,
                    self.subtask_index
                ));
            }
            if self.buckets.contains_key(&bucket_state.bucket_id) {
                return Err(config_err!(
                    "bucket '{}' appears twice in restored state",
                    bucket_state.bucket_id
                ));
            }

            let bucket_id = bucket_state.bucket_id.clone();
            let bucket = self.factory.restore(bucket_state).await?;
            self.max_part_counter = self.max_part_counter.max(bucket.part_counter());
            self.buckets.insert(bucket_id, bucket);
        }

        info!(
            "subtask {} restored {} bucket(s), next part counter {}",
            self.subtask_index,
            self.buckets.len(),
            self.max_part_counter
        );
        self.update_gauges();
        Ok(())
    }

    pub async fn write(&mut self, record: &Record, now: SystemTime) -> SinkResult<()> {
        let context = AssignerContext {
            subtask_index: self.subtask_index,
            current_processing_time: now,
        };
        let computed = self.assigner.get_bucket_id(record, &context)?;

        let bucket = match self.buckets.entry(computed.bucket_id.clone()) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => {
                let bucket_path = self.assigner.bucket_path(&computed.bucket_id);
                let bucket = self
                    .factory
                    .create(
                        self.subtask_index,
                        computed.bucket_id.clone(),
                        bucket_path,
                        self.max_part_counter,
                    )
                    .await?;
                e.insert(bucket)
            }
        };

        let written = bucket.write(record, &computed, now).await?;
        let counter = bucket.part_counter();
        self.max_part_counter = self.max_part_counter.max(counter);
        self.metrics.record_write(written);
        Ok(())
    }

    pub async fn on_processing_time(&mut self, now: SystemTime) -> SinkResult<()> {
        for bucket in self.buckets.values_mut() {
            bucket.on_processing_time(now).await?;
        }
        self.update_gauges();
        Ok(())
    }

    /// Closes every open file and snapshots all buckets for `checkpoint_id`.
    pub async fn snapshot_state(&mut self, checkpoint_id: u32) -> SinkResult<WriterState> {
        let mut buckets = Vec::with_capacity(self.buckets.len());
        for bucket in self.buckets.values_mut() {
            buckets.push(bucket.on_checkpoint(checkpoint_id).await?);
        }
        buckets.sort_by(|a, b| a.bucket_id.cmp(&b.bucket_id));

        let state = WriterState {
            subtask_index: self.subtask_index as u32,
            max_part_counter: self.max_part_counter,
            buckets,
        };
        debug!(
            "subtask {} snapshotted {} bucket(s) for checkpoint {}",
            self.subtask_index,
            state.buckets.len(),
            checkpoint_id
        );
        self.update_gauges();
        Ok(state)
    }

    /// Publishes every file pending for a checkpoint up to `checkpoint_id`, then forgets buckets
    /// with nothing left to do. Metadata is returned exactly once, even across failed attempts.
    pub async fn commit_up_to(&mut self, checkpoint_id: u32) -> SinkResult<Vec<FileMetadata>> {
        for bucket in self.buckets.values_mut() {
            let committed = bucket.on_checkpoint_complete(checkpoint_id).await?;
            self.committed_unreported.extend(committed);
        }

        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| !bucket.is_inactive());
        if self.buckets.len() < before {
            debug!(
                "subtask {} dropped {} inactive bucket(s)",
                self.subtask_index,
                before - self.buckets.len()
            );
        }

        let mut committed = std::mem::take(&mut self.committed_unreported);
        committed.sort_by(|a, b| {
            (a.bucket_id.as_str(), a.part_counter).cmp(&(b.bucket_id.as_str(), b.part_counter))
        });
        self.metrics.files_committed(committed.len());
        self.update_gauges();
        Ok(committed)
    }

    /// Aborts all open files. Pending files stay where they are for recovery to commit.
    pub async fn close(&mut self) -> SinkResult<()> {
        for bucket in self.buckets.values_mut() {
            bucket.dispose().await?;
        }
        Ok(())
    }

    fn update_gauges(&self) {
        let pending = self.buckets.values().map(|b| b.pending_file_count()).sum();
        self.metrics.set_buckets(self.buckets.len(), pending);
    }
}
