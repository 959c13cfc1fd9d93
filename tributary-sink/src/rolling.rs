use std::fmt::Debug;
use std::time::{Duration, SystemTime};

use crate::config::RollingPolicyConfig;
use crate::partition::BucketId;

/// Progress of the part file a bucket currently has open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartFileInfo {
    pub bucket_id: BucketId,
    pub part_counter: u64,
    pub bytes_written: u64,
    pub rows_written: u64,
    pub created_at: SystemTime,
    pub last_write_at: SystemTime,
}

impl PartFileInfo {
    pub fn new(bucket_id: BucketId, part_counter: u64, now: SystemTime) -> Self {
        Self {
            bucket_id,
            part_counter,
            bytes_written: 0,
            rows_written: 0,
            created_at: now,
            last_write_at: now,
        }
    }

    pub fn record_write(&mut self, bytes: u64, now: SystemTime) {
        self.bytes_written += bytes;
        self.rows_written += 1;
        self.last_write_at = now;
    }

    fn age(&self, now: SystemTime) -> Duration {
        now.duration_since(self.created_at).unwrap_or_default()
    }

    fn idle(&self, now: SystemTime) -> Duration {
        now.duration_since(self.last_write_at).unwrap_or_default()
    }
}

/// Decides when a bucket's open part file must be closed.
pub trait RollingPolicy: Send + Sync + Debug {
    fn should_roll_on_append(&self, file: &PartFileInfo) -> bool;

    /// Open files are always closed at a checkpoint so the snapshot holds only finished files.
    fn should_roll_on_checkpoint(&self, _file: &PartFileInfo) -> bool {
        true
    }

    fn should_roll_on_processing_time(&self, file: &PartFileInfo, now: SystemTime) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollingCondition {
    SizeLimit(u64),
    RolloverDuration(Duration),
    InactivityDuration(Duration),
}

impl RollingCondition {
    fn should_roll(&self, file: &PartFileInfo, now: SystemTime) -> bool {
        match self {
            RollingCondition::SizeLimit(limit) => file.bytes_written >= *limit,
            RollingCondition::RolloverDuration(duration) => file.age(now) >= *duration,
            RollingCondition::InactivityDuration(duration) => file.idle(now) >= *duration,
        }
    }
}

/// Rolls when any of its conditions holds. Appends only consult size; time-based conditions are
/// evaluated on processing-time ticks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefaultRollingPolicy {
    conditions: Vec<RollingCondition>,
}

impl DefaultRollingPolicy {
    pub fn new(conditions: Vec<RollingCondition>) -> Self {
        Self { conditions }
    }

    pub fn from_config(config: &RollingPolicyConfig) -> Self {
        let mut conditions = vec![
            RollingCondition::SizeLimit(config.file_size_bytes()),
            RollingCondition::RolloverDuration(config.rollover()),
        ];
        if let Some(inactivity) = config.inactivity() {
            conditions.push(RollingCondition::InactivityDuration(inactivity));
        }
        Self::new(conditions)
    }

    pub fn conditions(&self) -> &[RollingCondition] {
        &self.conditions
    }
}

impl RollingPolicy for DefaultRollingPolicy {
    fn should_roll_on_append(&self, file: &PartFileInfo) -> bool {
        self.conditions.iter().any(|c| match c {
            RollingCondition::SizeLimit(_) => c.should_roll(file, file.last_write_at),
            _ => false,
        })
    }

    fn should_roll_on_processing_time(&self, file: &PartFileInfo, now: SystemTime) -> bool {
        self.conditions.iter().any(|c| c.should_roll(file, now))
    }
}

/// Rolls only at checkpoints, producing at most one file per bucket per checkpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CheckpointRollingPolicy;

impl RollingPolicy for CheckpointRollingPolicy {
    fn should_roll_on_append(&self, _file: &PartFileInfo) -> bool {
        false
    }

    fn should_roll_on_processing_time(&self, _file: &PartFileInfo, _now: SystemTime) -> bool {
        false
    }
}
