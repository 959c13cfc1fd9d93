use bincode::config::Configuration;
use bincode::{Decode, Encode};
use std::time::SystemTime;
use thiserror::Error;
use tracing::{debug, info};
use tributary_storage::{StorageError, StorageProvider, StorageProviderRef};
use tributary_types::{to_millis, TaskInfo};

pub const BINCODE_CONFIG: Configuration = bincode::config::standard();

#[derive(Debug, Error)]
pub enum StateError {
    #[error("state storage failed: {0}")]
    Storage(#[from] StorageError),
    #[error("failed to encode state: {0}")]
    Encode(#[from] bincode::error::EncodeError),
    #[error("failed to decode state: {0}")]
    Decode(#[from] bincode::error::DecodeError),
}

pub type StateResult<T> = Result<T, StateError>;

fn checkpoints_path(job_id: &str) -> String {
    format!("{}/checkpoints", job_id)
}

fn base_path(job_id: &str, epoch: u32) -> String {
    format!("{}/checkpoint-{:0>7}", checkpoints_path(job_id), epoch)
}

fn metadata_path(path: &str) -> String {
    format!("{}/metadata", path)
}

fn latest_path(job_id: &str) -> String {
    format!("{}/latest", checkpoints_path(job_id))
}

fn subtask_path(job_id: &str, epoch: u32, operator: &str, subtask: usize) -> String {
    format!(
        "{}/operator-{}/subtask-{:0>3}",
        base_path(job_id, epoch),
        operator,
        subtask
    )
}

fn epoch_from_path(path: &str) -> Option<u32> {
    path.split('/')
        .find_map(|part| part.strip_prefix("checkpoint-"))
        .and_then(|epoch| epoch.parse().ok())
}

/// Written once every subtask has snapshotted its state for `epoch`.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct CheckpointMetadata {
    pub job_id: String,
    pub epoch: u32,
    pub operator_id: String,
    pub parallelism: u32,
    pub finish_time: u64,
}

impl CheckpointMetadata {
    pub fn new(task_info: &TaskInfo, epoch: u32) -> Self {
        Self {
            job_id: task_info.job_id.clone(),
            epoch,
            operator_id: task_info.operator_id.clone(),
            parallelism: task_info.parallelism as u32,
            finish_time: to_millis(SystemTime::now()),
        }
    }
}

/// Per-subtask durable state slots, laid out as
/// `{job}/checkpoints/checkpoint-{epoch}/operator-{op}/subtask-{idx}`.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    storage: StorageProviderRef,
    job_id: String,
}

impl CheckpointStore {
    pub fn new(storage: StorageProviderRef, job_id: impl Into<String>) -> Self {
        Self {
            storage,
            job_id: job_id.into(),
        }
    }

    pub async fn for_url(url: &str, job_id: impl Into<String>) -> StateResult<Self> {
        let storage = StorageProvider::for_url(url).await?;
        Ok(Self::new(storage.into(), job_id))
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub async fn write_state<T: Encode>(
        &self,
        task_info: &TaskInfo,
        epoch: u32,
        state: &T,
    ) -> StateResult<()> {
        let bytes = bincode::encode_to_vec(state, BINCODE_CONFIG)?;
        let path = subtask_path(
            &self.job_id,
            epoch,
            &task_info.operator_id,
            task_info.task_index,
        );
        debug!(
            message = "writing subtask state",
            path = %path,
            size = bytes.len()
        );
        self.storage.put(&path, bytes).await?;
        Ok(())
    }

    pub async fn load_state<T: Decode<()>>(
        &self,
        task_info: &TaskInfo,
        epoch: u32,
    ) -> StateResult<Option<T>> {
        let path = subtask_path(
            &self.job_id,
            epoch,
            &task_info.operator_id,
            task_info.task_index,
        );
        let Some(bytes) = self.storage.get_if_present(&path).await? else {
            return Ok(None);
        };
        let (state, _) = bincode::decode_from_slice(&bytes, BINCODE_CONFIG)?;
        Ok(Some(state))
    }

    /// Marks `metadata.epoch` as the newest restorable checkpoint.
    pub async fn write_metadata(&self, metadata: &CheckpointMetadata) -> StateResult<()> {
        let bytes = bincode::encode_to_vec(metadata, BINCODE_CONFIG)?;
        self.storage
            .put(
                &metadata_path(&base_path(&self.job_id, metadata.epoch)),
                bytes,
            )
            .await?;
        self.storage
            .put(
                &latest_path(&self.job_id),
                bincode::encode_to_vec(metadata.epoch, BINCODE_CONFIG)?,
            )
            .await?;
        info!(
            message = "finished checkpoint",
            job_id = %self.job_id,
            epoch = metadata.epoch
        );
        Ok(())
    }

    pub async fn latest_metadata(&self) -> StateResult<Option<CheckpointMetadata>> {
        let Some(latest) = self.storage.get_if_present(&latest_path(&self.job_id)).await? else {
            return Ok(None);
        };
        let (epoch, _): (u32, _) = bincode::decode_from_slice(&latest, BINCODE_CONFIG)?;

        let Some(bytes) = self
            .storage
            .get_if_present(&metadata_path(&base_path(&self.job_id, epoch)))
            .await?
        else {
            return Ok(None);
        };
        let (metadata, _) = bincode::decode_from_slice(&bytes, BINCODE_CONFIG)?;
        Ok(Some(metadata))
    }

    /// Deletes every checkpoint older than `min_epoch`.
    pub async fn cleanup(&self, min_epoch: u32) -> StateResult<usize> {
        let paths = self.storage.list(&checkpoints_path(&self.job_id)).await?;
        let mut deleted = 0;
        for path in paths {
            let path = path.to_string();
            match epoch_from_path(&path) {
                Some(epoch) if epoch < min_epoch => {
                    self.storage.delete_if_present(path.as_str()).await?;
                    deleted += 1;
                }
                _ => {}
            }
        }
        if deleted > 0 {
            debug!(
                message = "cleaned up old checkpoints",
                job_id = %self.job_id,
                min_epoch,
                deleted
            );
        }
        Ok(deleted)
    }
}
