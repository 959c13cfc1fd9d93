use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::time::SystemTime;

use bincode::{Decode, Encode};
use tracing::{debug, info};
use tributary_types::Record;

use crate::cdc::ComputedRecord;
use crate::encoder::{Encoder, EncoderFactory};
use crate::error::SinkResult;
use crate::metadata::{CdcSummary, FileMetadata};
use crate::partition::{BucketId, PartitionValues};
use crate::rolling::{PartFileInfo, RollingPolicy};
use crate::store::{join_path, CommitOutcome, PartStore, PartWriter};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputFileConfig {
    pub prefix: String,
    pub suffix: String,
}

impl OutputFileConfig {
    pub fn new(prefix: impl Into<String>, suffix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            suffix: suffix.into(),
        }
    }

    pub fn part_file_name(&self, subtask_index: usize, part_counter: u64) -> String {
        format!(
            "{}-{:>05}-{:>03}{}",
            self.prefix, part_counter, subtask_index, self.suffix
        )
    }

    /// Dot-prefixed so readers listing the directory skip it.
    pub fn in_progress_file_name(&self, subtask_index: usize, part_counter: u64) -> String {
        format!(
            ".{}.inprogress",
            self.part_file_name(subtask_index, part_counter)
        )
    }

    /// The counter of a part file written by `subtask_index`, whether in progress or final.
    pub fn parse_counter(&self, subtask_index: usize, file_name: &str) -> Option<u64> {
        let name = file_name
            .strip_prefix('.')
            .and_then(|n| n.strip_suffix(".inprogress"))
            .unwrap_or(file_name);
        let rest = name
            .strip_prefix(self.prefix.as_str())?
            .strip_prefix('-')?
            .strip_suffix(self.suffix.as_str())?;
        let (counter, subtask) = rest.split_once('-')?;
        if subtask.parse::<usize>().ok()? != subtask_index {
            return None;
        }
        counter.parse().ok()
    }

    pub fn is_in_progress(file_name: &str) -> bool {
        file_name.starts_with('.') && file_name.ends_with(".inprogress")
    }
}

/// Everything a bucket needs besides its identity; shared by all buckets of a writer.
#[derive(Debug, Clone)]
pub struct BucketResources {
    pub store: Arc<dyn PartStore>,
    pub encoder_factory: Arc<dyn EncoderFactory>,
    pub rolling_policy: Arc<dyn RollingPolicy>,
    pub file_config: OutputFileConfig,
    /// Whether file metadata carries per-change-kind counts.
    pub track_cdc: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketStatus {
    /// No open file and nothing awaiting commit.
    Active,
    Writing,
    /// The open file is being closed.
    RollPending,
    /// Closed files are waiting for their checkpoint to complete.
    Pending,
    /// Everything this bucket wrote has been committed and reported.
    Committed,
}

/// A closed file that is durable but not yet visible to readers.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct PendingFile {
    pub in_progress_path: String,
    pub final_path: String,
    pub metadata: FileMetadata,
}

/// Durable progress of a bucket, taken at every checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct BucketState {
    pub subtask_index: u32,
    pub bucket_id: BucketId,
    pub bucket_path: String,
    /// Next counter to use; every counter below it has been handed out.
    pub part_counter: u64,
    /// Files left pending, keyed by the checkpoint that closed them.
    pub pending_files: Vec<(u32, Vec<PendingFile>)>,
}

impl BucketState {
    pub fn pending_for(&self, checkpoint_id: u32) -> impl Iterator<Item = &FileMetadata> {
        self.pending_files
            .iter()
            .filter(move |(id, _)| *id == checkpoint_id)
            .flat_map(|(_, files)| files.iter().map(|f| &f.metadata))
    }
}

struct InProgressPart {
    writer: Box<dyn PartWriter>,
    encoder: Box<dyn Encoder>,
    info: PartFileInfo,
    in_progress_path: String,
    final_path: String,
    partition_values: PartitionValues,
    cdc: Option<CdcSummary>,
}

impl InProgressPart {
    async fn append(
        &mut self,
        record: &Record,
        computed: &ComputedRecord,
        now: SystemTime,
    ) -> SinkResult<usize> {
        let n = self.encoder.write(record, computed)?;
        let bytes = self.encoder.flush();
        self.writer.write(&bytes).await?;
        self.info.record_write(n as u64, now);
        if let Some(cdc) = &mut self.cdc {
            cdc.record(computed.change_kind);
        }
        Ok(n)
    }
}

/// Owns at most one open part file for a single bucket of one writer instance, and every file
/// it has closed but not yet seen committed.
pub struct Bucket {
    subtask_index: usize,
    bucket_id: BucketId,
    bucket_path: String,
    part_counter: u64,
    status: BucketStatus,
    in_progress: Option<InProgressPart>,
    pending_for_next_checkpoint: Vec<PendingFile>,
    pending_per_checkpoint: BTreeMap<u32, Vec<PendingFile>>,
    committed_unreported: Vec<FileMetadata>,
    resources: BucketResources,
}

impl Debug for Bucket {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bucket")
            .field("subtask_index", &self.subtask_index)
            .field("bucket_id", &self.bucket_id)
            .field("part_counter", &self.part_counter)
            .field("status", &self.status)
            .field("open_file", &self.in_progress.as_ref().map(|p| &p.info))
            .field("pending", &self.pending_file_count())
            .finish()
    }
}

impl Bucket {
    pub fn new(
        subtask_index: usize,
        bucket_id: BucketId,
        bucket_path: String,
        initial_part_counter: u64,
        resources: BucketResources,
    ) -> Self {
        debug!(
            "subtask {} creating bucket '{}' at counter {}",
            subtask_index, bucket_id, initial_part_counter
        );
        Self {
            subtask_index,
            bucket_id,
            bucket_path,
            part_counter: initial_part_counter,
            status: BucketStatus::Active,
            in_progress: None,
            pending_for_next_checkpoint: vec![],
            pending_per_checkpoint: BTreeMap::new(),
            committed_unreported: vec![],
            resources,
        }
    }

    /// Rebuilds a bucket without reopening anything; files pending in `state` await commit again.
    pub fn restore(state: BucketState, resources: BucketResources) -> Self {
        let pending_per_checkpoint: BTreeMap<_, _> = state
            .pending_files
            .into_iter()
            .filter(|(_, files)| !files.is_empty())
            .collect();
        let status = if pending_per_checkpoint.is_empty() {
            BucketStatus::Active
        } else {
            BucketStatus::Pending
        };
        info!(
            "subtask {} restored bucket '{}' at counter {} with {} pending checkpoint(s)",
            state.subtask_index,
            state.bucket_id,
            state.part_counter,
            pending_per_checkpoint.len()
        );
        Self {
            subtask_index: state.subtask_index as usize,
            bucket_id: state.bucket_id,
            bucket_path: state.bucket_path,
            part_counter: state.part_counter,
            status,
            in_progress: None,
            pending_for_next_checkpoint: vec![],
            pending_per_checkpoint,
            committed_unreported: vec![],
            resources,
        }
    }

    pub fn bucket_id(&self) -> &BucketId {
        &self.bucket_id
    }

    pub fn bucket_path(&self) -> &str {
        &self.bucket_path
    }

    pub fn subtask_index(&self) -> usize {
        self.subtask_index
    }

    pub fn part_counter(&self) -> u64 {
        self.part_counter
    }

    pub fn status(&self) -> BucketStatus {
        self.status
    }

    pub fn open_file(&self) -> Option<&PartFileInfo> {
        self.in_progress.as_ref().map(|p| &p.info)
    }

    pub fn pending_file_count(&self) -> usize {
        self.pending_for_next_checkpoint.len()
            + self
                .pending_per_checkpoint
                .values()
                .map(|files| files.len())
                .sum::<usize>()
    }

    fn has_pending(&self) -> bool {
        self.pending_file_count() > 0
    }

    /// Nothing open and nothing left to commit or report.
    pub fn is_inactive(&self) -> bool {
        self.in_progress.is_none() && !self.has_pending() && self.committed_unreported.is_empty()
    }

    pub fn state(&self) -> BucketState {
        BucketState {
            subtask_index: self.subtask_index as u32,
            bucket_id: self.bucket_id.clone(),
            bucket_path: self.bucket_path.clone(),
            part_counter: self.part_counter,
            pending_files: self
                .pending_per_checkpoint
                .iter()
                .map(|(id, files)| (*id, files.clone()))
                .collect(),
        }
    }

    async fn open_part_file(
        &mut self,
        computed: &ComputedRecord,
        now: SystemTime,
    ) -> SinkResult<InProgressPart> {
        let counter = self.part_counter;
        // the counter is consumed even if the file ends up empty
        self.part_counter += 1;

        let file_config = &self.resources.file_config;
        let in_progress_path = join_path(
            &self.bucket_path,
            &file_config.in_progress_file_name(self.subtask_index, counter),
        );
        let final_path = join_path(
            &self.bucket_path,
            &file_config.part_file_name(self.subtask_index, counter),
        );

        let writer = self.resources.store.open(&in_progress_path).await?;
        debug!(
            "subtask {} opened {} for bucket '{}'",
            self.subtask_index, in_progress_path, self.bucket_id
        );

        self.status = BucketStatus::Writing;
        Ok(InProgressPart {
            writer,
            encoder: self.resources.encoder_factory.create(),
            info: PartFileInfo::new(self.bucket_id.clone(), counter, now),
            in_progress_path,
            final_path,
            partition_values: computed.partition_values.clone(),
            cdc: self.resources.track_cdc.then(CdcSummary::default),
        })
    }

    /// Appends a record, opening a part file if none is open and rolling it if the policy says
    /// so. Returns the number of bytes written.
    pub async fn write(
        &mut self,
        record: &Record,
        computed: &ComputedRecord,
        now: SystemTime,
    ) -> SinkResult<usize> {
        let mut part = match self.in_progress.take() {
            Some(part) => part,
            None => self.open_part_file(computed, now).await?,
        };
        let result = part.append(record, computed, now).await;
        let should_roll = self.resources.rolling_policy.should_roll_on_append(&part.info);
        self.in_progress = Some(part);
        let written = result?;

        if should_roll {
            self.roll().await?;
        }
        Ok(written)
    }

    /// Closes the open file, if any. An empty file is discarded instead of becoming pending.
    async fn roll(&mut self) -> SinkResult<()> {
        let Some(mut part) = self.in_progress.take() else {
            return Ok(());
        };
        self.status = BucketStatus::RollPending;

        let trailer = part.encoder.close();
        if !trailer.is_empty() {
            part.writer.write(&trailer).await?;
        }

        if part.info.rows_written == 0 {
            part.writer.abort().await?;
            debug!(
                "subtask {} discarded empty part file {}",
                self.subtask_index, part.in_progress_path
            );
        } else {
            let size_bytes = part.writer.close().await?;
            info!(
                "subtask {} rolled {} ({} rows, {} bytes) in bucket '{}'",
                self.subtask_index,
                part.in_progress_path,
                part.info.rows_written,
                size_bytes,
                self.bucket_id
            );
            let metadata = FileMetadata {
                path: self.resources.store.qualified(&part.final_path),
                relative_path: part.final_path.clone(),
                bucket_id: self.bucket_id.to_string(),
                partition_values: part.partition_values,
                subtask_index: self.subtask_index as u32,
                part_counter: part.info.part_counter,
                row_count: part.info.rows_written,
                size_bytes,
                checkpoint_id: 0,
                cdc: part.cdc,
            };
            self.pending_for_next_checkpoint.push(PendingFile {
                in_progress_path: part.in_progress_path,
                final_path: part.final_path,
                metadata,
            });
        }

        self.status = if self.has_pending() {
            BucketStatus::Pending
        } else {
            BucketStatus::Active
        };
        Ok(())
    }

    /// Rolls the open file if it has been open or idle for too long.
    pub async fn on_processing_time(&mut self, now: SystemTime) -> SinkResult<()> {
        let should_roll = self.in_progress.as_ref().is_some_and(|part| {
            self.resources
                .rolling_policy
                .should_roll_on_processing_time(&part.info, now)
        });
        if should_roll {
            self.roll().await?;
        }
        Ok(())
    }

    /// Closes the open file and files everything closed since the last checkpoint under
    /// `checkpoint_id`.
    pub async fn on_checkpoint(&mut self, checkpoint_id: u32) -> SinkResult<BucketState> {
        let should_roll = self.in_progress.as_ref().is_some_and(|part| {
            self.resources
                .rolling_policy
                .should_roll_on_checkpoint(&part.info)
        });
        if should_roll {
            self.roll().await?;
        }

        if !self.pending_for_next_checkpoint.is_empty() {
            let mut files = std::mem::take(&mut self.pending_for_next_checkpoint);
            for file in &mut files {
                file.metadata.checkpoint_id = checkpoint_id;
            }
            self.pending_per_checkpoint
                .entry(checkpoint_id)
                .or_default()
                .extend(files);
        }

        Ok(self.state())
    }

    /// Publishes every file pending for a checkpoint `<= checkpoint_id` and returns its
    /// metadata. Calling this again for the same id returns nothing new.
    pub async fn on_checkpoint_complete(
        &mut self,
        checkpoint_id: u32,
    ) -> SinkResult<Vec<FileMetadata>> {
        let ready: Vec<u32> = self
            .pending_per_checkpoint
            .range(..=checkpoint_id)
            .map(|(id, _)| *id)
            .collect();

        for id in ready {
            let files = self.pending_per_checkpoint.remove(&id).unwrap_or_default();
            let mut files = files.into_iter();
            while let Some(file) = files.next() {
                match self
                    .resources
                    .store
                    .commit(&file.in_progress_path, &file.final_path)
                    .await
                {
                    Ok(outcome) => {
                        if outcome == CommitOutcome::AlreadyCommitted {
                            debug!("{} was committed before a restart", file.final_path);
                        }
                        self.committed_unreported.push(file.metadata);
                    }
                    Err(e) => {
                        let mut remaining = vec![file];
                        remaining.extend(files);
                        self.pending_per_checkpoint.insert(id, remaining);
                        return Err(e);
                    }
                }
            }
        }

        let committed = std::mem::take(&mut self.committed_unreported);
        if !committed.is_empty() && self.in_progress.is_none() && !self.has_pending() {
            self.status = BucketStatus::Committed;
        }
        Ok(committed)
    }

    /// Drops the open file on cancellation. Pending files are left for recovery to commit.
    pub async fn dispose(&mut self) -> SinkResult<()> {
        if let Some(part) = self.in_progress.take() {
            debug!(
                "subtask {} aborting open part file {}",
                self.subtask_index, part.in_progress_path
            );
            part.writer.abort().await?;
        }
        self.status = if self.has_pending() {
            BucketStatus::Pending
        } else {
            BucketStatus::Active
        };
        Ok(())
    }
}
