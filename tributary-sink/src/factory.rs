use async_trait::async_trait;
use tracing::info;

use crate::bucket::{Bucket, BucketResources, BucketState, OutputFileConfig};
use crate::error::SinkResult;
use crate::partition::BucketId;
use crate::store::join_path;

/// Builds buckets for a writer, either fresh or from checkpointed state.
#[async_trait]
pub trait BucketFactory: Send + Sync {
    async fn create(
        &self,
        subtask_index: usize,
        bucket_id: BucketId,
        bucket_path: String,
        initial_part_counter: u64,
    ) -> SinkResult<Bucket>;

    async fn restore(&self, state: BucketState) -> SinkResult<Bucket>;
}

#[derive(Debug, Clone)]
pub struct DefaultBucketFactory {
    resources: BucketResources,
}

impl DefaultBucketFactory {
    pub fn new(resources: BucketResources) -> Self {
        Self { resources }
    }

    pub fn resources(&self) -> &BucketResources {
        &self.resources
    }

    /// The lowest counter at or above `floor` that no file of this subtask in the bucket
    /// directory has used, so files left behind by a crashed run are never overwritten.
    async fn first_unused_counter(
        &self,
        subtask_index: usize,
        bucket_path: &str,
        floor: u64,
    ) -> SinkResult<u64> {
        let file_config = &self.resources.file_config;
        let used = self
            .resources
            .store
            .list_dir(bucket_path)
            .await?
            .iter()
            .filter_map(|name| file_config.parse_counter(subtask_index, name))
            .max();
        Ok(used.map_or(floor, |c| floor.max(c + 1)))
    }

    /// Deletes in-progress files of this subtask numbered `from_counter` or higher. Nothing in
    /// the writer's state refers to them.
    async fn discard_orphans(
        &self,
        subtask_index: usize,
        bucket_id: &BucketId,
        bucket_path: &str,
        from_counter: u64,
    ) -> SinkResult<()> {
        let file_config = &self.resources.file_config;
        for name in self.resources.store.list_dir(bucket_path).await? {
            if !OutputFileConfig::is_in_progress(&name) {
                continue;
            }
            match file_config.parse_counter(subtask_index, &name) {
                Some(counter) if counter >= from_counter => {
                    info!(
                        "subtask {} discarding orphaned file {} in bucket '{}'",
                        subtask_index, name, bucket_id
                    );
                    self.resources
                        .store
                        .discard(&join_path(bucket_path, &name))
                        .await?;
                }
                _ => {}
            }
        }
        Ok(())
    }
}

#[async_trait]
impl BucketFactory for DefaultBucketFactory {
    async fn create(
        &self,
        subtask_index: usize,
        bucket_id: BucketId,
        bucket_path: String,
        initial_part_counter: u64,
    ) -> SinkResult<Bucket> {
        self.resources.store.ensure_dir(&bucket_path).await?;
        let part_counter = self
            .first_unused_counter(subtask_index, &bucket_path, initial_part_counter)
            .await?;
        // the writer holds no pending files for a bucket it is creating
        self.discard_orphans(subtask_index, &bucket_id, &bucket_path, 0)
            .await?;
        Ok(Bucket::new(
            subtask_index,
            bucket_id,
            bucket_path,
            part_counter,
            self.resources.clone(),
        ))
    }

    async fn restore(&self, mut state: BucketState) -> SinkResult<Bucket> {
        self.resources.store.ensure_dir(&state.bucket_path).await?;
        let part_counter = self
            .first_unused_counter(
                state.subtask_index as usize,
                &state.bucket_path,
                state.part_counter,
            )
            .await?;
        self.discard_orphans(
            state.subtask_index as usize,
            &state.bucket_id,
            &state.bucket_path,
            state.part_counter,
        )
        .await?;
        state.part_counter = part_counter;
        Ok(Bucket::restore(state, self.resources.clone()))
    }
}
